use resilient_rabbitmq::message::Publishing;
use resilient_rabbitmq::rabbitmq::{ChannelConfig, ChannelManager, ChannelState, MemoryBroker};
use std::sync::Arc;
use std::time::Duration;

pub fn broker() -> MemoryBroker {
    MemoryBroker::new().with_reconnect_interval(Duration::from_millis(5))
}

pub async fn manager(broker: &MemoryBroker) -> Arc<ChannelManager<MemoryBroker>> {
    Arc::new(
        ChannelManager::new(Arc::new(broker.clone()), ChannelConfig::default())
            .await
            .unwrap(),
    )
}

/// Polls `condition` until it holds, failing the test after two seconds.
pub async fn eventually<F: FnMut() -> bool>(what: &str, mut condition: F) {
    let waited = tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

pub async fn wait_for_state(manager: &ChannelManager<MemoryBroker>, wanted: ChannelState) {
    let mut rx = manager.subscribe_state();
    tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == wanted))
        .await
        .expect("state transition timed out")
        .unwrap();
}

/// Drops every channel and waits until the manager runs on channel `expected_id`.
pub async fn swap_channel(broker: &MemoryBroker, manager: &ChannelManager<MemoryBroker>, expected_id: u64) {
    broker.drop_channels("connection reset by peer");
    eventually("a replacement channel", || broker.channels_opened() >= expected_id).await;
    wait_for_state(manager, ChannelState::Active).await;
}

pub fn fill_queue(broker: &MemoryBroker, queue: &str, ids: &[&str]) {
    for id in ids {
        broker.enqueue(queue, Publishing::new(format!("body of {}", id)).with_message_id(*id));
    }
}

pub fn ids(values: &[&str]) -> Vec<Option<String>> {
    values.iter().map(|v| Some(v.to_string())).collect()
}
