use lapin::{options::QueueDeclareOptions, types::FieldTable};
use resilient_rabbitmq::rabbitmq::{Operation, RabbitMQError};

use crate::support::{broker, fill_queue, ids, manager};

fn nacks(operations: &[Operation]) -> Vec<(Option<String>, bool)> {
    operations
        .iter()
        .filter_map(|op| match op {
            Operation::Nack {
                message_id, requeue, ..
            } => Some((message_id.clone(), *requeue)),
            _ => None,
        })
        .collect()
}

fn gets(operations: &[Operation]) -> usize {
    operations
        .iter()
        .filter(|op| matches!(op, Operation::Get { .. }))
        .count()
}

#[tokio::test]
async fn single_id_scan_stops_at_the_match() {
    let broker = broker();
    let manager = manager(&broker).await;
    fill_queue(&broker, "jobs", &["id-1", "id-2", "id-5", "id-7"]);

    manager.ack_message_safe("jobs", "id-5").await.unwrap();

    let operations = broker.operations();
    assert_eq!(gets(&operations), 3);
    assert_eq!(nacks(&operations), vec![(Some("id-5".to_string()), false)]);
    assert_eq!(broker.ready_message_ids("jobs"), ids(&["id-7"]));
    assert_eq!(broker.unacked_message_ids(), ids(&["id-1", "id-2"]));

    let next = manager.get_safe("jobs", true).await.unwrap().unwrap();
    assert_eq!(next.message_id(), Some("id-7"));
}

#[tokio::test]
async fn batch_scan_stops_before_later_messages() {
    let broker = broker();
    let manager = manager(&broker).await;
    fill_queue(&broker, "jobs", &["id-1", "id-2", "id-3"]);

    manager
        .ack_messages_safe("jobs", &["id-2", "id-9"])
        .await
        .unwrap();

    let operations = broker.operations();
    assert_eq!(gets(&operations), 2);
    assert_eq!(nacks(&operations), vec![(Some("id-2".to_string()), false)]);
    assert_eq!(broker.ready_message_ids("jobs"), ids(&["id-3"]));
    assert_eq!(broker.unacked_message_ids(), ids(&["id-1"]));
}

#[tokio::test]
async fn scan_without_match_drains_the_queue_and_succeeds() {
    let broker = broker();
    let manager = manager(&broker).await;
    fill_queue(&broker, "jobs", &["id-1", "id-2"]);

    manager.ack_message_safe("jobs", "id-404").await.unwrap();

    let operations = broker.operations();
    assert_eq!(gets(&operations), 3);
    assert!(nacks(&operations).is_empty());
    assert_eq!(broker.queue_len("jobs"), Some(0));
    assert_eq!(broker.unacked_message_ids().len(), 2);
}

#[tokio::test]
async fn empty_ids_never_match_in_a_batch() {
    let broker = broker();
    let manager = manager(&broker).await;
    broker.enqueue("jobs", resilient_rabbitmq::message::Publishing::new("no id"));
    fill_queue(&broker, "jobs", &["id-1"]);

    manager.ack_messages_safe("jobs", &["", "id-1"]).await.unwrap();

    assert_eq!(nacks(&broker.operations()), vec![(Some("id-1".to_string()), false)]);
    assert_eq!(broker.unacked_message_ids(), vec![None]);
}

#[tokio::test]
async fn fetch_failure_aborts_the_scan() {
    let broker = broker();
    let manager = manager(&broker).await;

    let err = manager.ack_message_safe("absent", "id-1").await.unwrap_err();
    match err {
        RabbitMQError::ChannelError(reason) => assert!(reason.contains("NOT_FOUND")),
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn purge_returns_the_ready_count() {
    let broker = broker();
    let manager = manager(&broker).await;
    manager
        .queue_declare_safe("jobs", QueueDeclareOptions::default(), FieldTable::default())
        .await
        .unwrap();
    fill_queue(&broker, "jobs", &["id-1", "id-2", "id-3", "id-4", "id-5"]);

    assert_eq!(manager.queue_purge_safe("jobs", false).await.unwrap(), 5);
    assert_eq!(broker.queue_len("jobs"), Some(0));
    assert_eq!(manager.queue_purge_safe("jobs", false).await.unwrap(), 0);
}
