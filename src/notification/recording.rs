//! Notifier that keeps every event, for tests.

use std::sync::Mutex;

use super::{Event, EventType, NotificationError, Notifier};

#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<Event>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, event_type: EventType) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }
}

#[async_trait::async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, event: &Event) -> Result<(), NotificationError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }

    fn send_async(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    fn is_enabled(&self, _event_type: EventType) -> bool {
        true
    }

    async fn close(&self) -> Result<(), NotificationError> {
        Ok(())
    }
}
