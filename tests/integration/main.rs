// Integration tests against the in-process broker; `live` needs a running RabbitMQ.

mod live;
mod publisher_test;
mod queue_test;
mod scan_reject_test;
mod support;
