//! Progress Publisher
//!
//! One broadcast channel per course. Subscribers see the events published
//! after they subscribed, in publish order; there is no replay. Callers that
//! reconnect re-read the course instead.

use futures::Stream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::warn;

use crate::course::CourseId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    ModuleReady {
        index: usize,
        title: String,
        progress_percent: u8,
    },
    ModuleFailed {
        index: usize,
        reason: String,
    },
    CourseComplete {
        ready: usize,
        failed: usize,
    },
}

pub type ProgressStream = Pin<Box<dyn Stream<Item = ProgressEvent> + Send>>;

pub struct ProgressPublisher {
    capacity: usize,
    channels: Mutex<HashMap<CourseId, broadcast::Sender<ProgressEvent>>>,
}

impl ProgressPublisher {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// The course's sender, created on first use. Channels whose
    /// subscribers have all gone are dropped on the way.
    fn sender(&self, course_id: CourseId) -> broadcast::Sender<ProgressEvent> {
        let mut channels = self.channels.lock();
        channels.retain(|_, tx| tx.receiver_count() > 0);
        channels
            .entry(course_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Sends `event` to the current subscribers of `course_id`.
    /// Returns how many received it.
    pub fn publish(&self, course_id: CourseId, event: ProgressEvent) -> usize {
        let mut channels = self.channels.lock();
        let Some(sender) = channels.get(&course_id) else {
            return 0;
        };
        match sender.send(event) {
            Ok(received) => received,
            // Nobody is listening any more.
            Err(_) => {
                channels.remove(&course_id);
                0
            }
        }
    }

    pub fn subscribe(&self, course_id: CourseId) -> ProgressStream {
        let rx = self.sender(course_id).subscribe();
        Box::pin(BroadcastStream::new(rx).filter_map(move |item| match item {
            Ok(event) => Some(event),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(course_id = %course_id, skipped, "Progress subscriber lagged, events dropped");
                None
            }
        }))
    }

    /// Drops the course's channel; open streams end once drained.
    pub fn close(&self, course_id: CourseId) {
        self.channels.lock().remove(&course_id);
    }

    pub fn subscriber_count(&self, course_id: CourseId) -> usize {
        self.channels
            .lock()
            .get(&course_id)
            .map(broadcast::Sender::receiver_count)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn ready(index: usize) -> ProgressEvent {
        ProgressEvent::ModuleReady {
            index,
            title: format!("Module {index}"),
            progress_percent: 25,
        }
    }

    #[tokio::test]
    async fn events_arrive_in_publish_order() {
        let publisher = ProgressPublisher::new(16);
        let course = Uuid::new_v4();
        let stream = publisher.subscribe(course);

        publisher.publish(course, ready(2));
        publisher.publish(
            course,
            ProgressEvent::ModuleFailed {
                index: 1,
                reason: "timeout".into(),
            },
        );
        publisher.publish(course, ready(3));
        publisher.close(course);

        let events: Vec<_> = stream.collect().await;
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], ready(2));
        assert!(matches!(events[1], ProgressEvent::ModuleFailed { index: 1, .. }));
        assert_eq!(events[2], ready(3));
    }

    #[tokio::test]
    async fn late_subscribers_get_no_replay() {
        let publisher = ProgressPublisher::new(16);
        let course = Uuid::new_v4();
        let _early = publisher.subscribe(course);
        publisher.publish(course, ready(0));

        let late = publisher.subscribe(course);
        publisher.publish(course, ready(1));
        publisher.close(course);

        let events: Vec<_> = late.collect().await;
        assert_eq!(events, vec![ready(1)]);
    }

    #[tokio::test]
    async fn courses_are_isolated() {
        let publisher = ProgressPublisher::new(16);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let stream_a = publisher.subscribe(a);
        let _stream_b = publisher.subscribe(b);

        assert_eq!(publisher.publish(b, ready(0)), 1);
        publisher.publish(a, ready(5));
        publisher.close(a);

        let events: Vec<_> = stream_a.collect().await;
        assert_eq!(events, vec![ready(5)]);
    }

    #[tokio::test]
    async fn lagging_subscribers_skip_dropped_events() {
        let publisher = ProgressPublisher::new(2);
        let course = Uuid::new_v4();
        let stream = publisher.subscribe(course);
        for i in 0..5 {
            publisher.publish(course, ready(i));
        }
        publisher.close(course);

        let events: Vec<_> = stream.collect().await;
        assert_eq!(events, vec![ready(3), ready(4)]);
    }

    #[test]
    fn abandoned_channels_are_dropped() {
        let publisher = ProgressPublisher::new(4);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        drop(publisher.subscribe(a));
        assert_eq!(publisher.publish(a, ready(0)), 0);
        assert!(publisher.channels.lock().is_empty());

        drop(publisher.subscribe(a));
        let _listening = publisher.subscribe(b);
        assert_eq!(publisher.channels.lock().len(), 1);
        assert_eq!(publisher.subscriber_count(b), 1);
    }

    #[test]
    fn publishing_without_a_channel_is_a_no_op() {
        let publisher = ProgressPublisher::new(4);
        assert_eq!(publisher.publish(Uuid::new_v4(), ready(0)), 0);
    }

    #[test]
    fn events_serialize_with_an_event_tag() {
        let json = serde_json::to_value(ProgressEvent::CourseComplete { ready: 3, failed: 1 }).unwrap();
        assert_eq!(json, serde_json::json!({"event": "course_complete", "ready": 3, "failed": 1}));
    }
}
