use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::bus::{BusClient, EventHandler};
use crate::error::{timeout, Result};

type Responder = Arc<dyn Fn(&JsonValue) -> Result<JsonValue> + Send + Sync>;

#[derive(Clone, Debug, PartialEq)]
pub struct RecordedRequest {
    pub subject: String,
    pub payload: JsonValue,
}

/// In-process bus with scripted responders, used by tests and demos the same
/// way a real message-bus binding would be used by the deployment.
///
/// Requests are answered by the responder registered for their exact subject
/// and recorded for later inspection; a subject without a responder behaves
/// like a bus with nobody listening and times out. `publish` delivers an
/// event to the installed handler synchronously, which matches the
/// per-subject ordering a real bus provides.
#[derive(Clone, Default)]
pub struct InMemoryBus {
    inner: Arc<BusState>,
}

#[derive(Default)]
struct BusState {
    handler: Mutex<Option<EventHandler>>,
    responders: Mutex<HashMap<String, Responder>>,
    requests: Mutex<Vec<RecordedRequest>>,
    subscriptions: Mutex<HashMap<String, usize>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the reply closure for requests to `subject`, replacing any
    /// previous responder.
    pub fn respond_to<F>(&self, subject: impl Into<String>, responder: F)
    where
        F: Fn(&JsonValue) -> Result<JsonValue> + Send + Sync + 'static,
    {
        self.inner
            .responders
            .lock()
            .unwrap()
            .insert(subject.into(), Arc::new(responder));
    }

    pub fn remove_responder(&self, subject: &str) {
        self.inner.responders.lock().unwrap().remove(subject);
    }

    /// Delivers an event to the installed handler. Events published before a
    /// handler is installed are dropped, like bus traffic before a
    /// subscription exists.
    pub fn publish(&self, subject: &str, payload: JsonValue) {
        let handler = self.inner.handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler(subject, payload);
        }
    }

    pub fn recorded_requests(&self) -> Vec<RecordedRequest> {
        self.inner.requests.lock().unwrap().clone()
    }

    pub fn requests_to(&self, subject: &str) -> Vec<JsonValue> {
        self.inner
            .requests
            .lock()
            .unwrap()
            .iter()
            .filter(|request| request.subject == subject)
            .map(|request| request.payload.clone())
            .collect()
    }

    pub fn clear_recorded_requests(&self) {
        self.inner.requests.lock().unwrap().clear();
    }

    pub fn is_subscribed(&self, subject: &str) -> bool {
        self.inner
            .subscriptions
            .lock()
            .unwrap()
            .get(subject)
            .map_or(false, |count| *count > 0)
    }
}

#[async_trait]
impl BusClient for InMemoryBus {
    async fn request(&self, subject: &str, payload: JsonValue) -> Result<JsonValue> {
        let responder = {
            let mut requests = self.inner.requests.lock().unwrap();
            requests.push(RecordedRequest {
                subject: subject.to_string(),
                payload: payload.clone(),
            });
            self.inner.responders.lock().unwrap().get(subject).cloned()
        };

        match responder {
            Some(responder) => responder(&payload),
            None => Err(timeout()),
        }
    }

    async fn subscribe(&self, subject: &str) -> Result<()> {
        *self
            .inner
            .subscriptions
            .lock()
            .unwrap()
            .entry(subject.to_string())
            .or_insert(0) += 1;
        Ok(())
    }

    async fn unsubscribe(&self, subject: &str) -> Result<()> {
        let mut subscriptions = self.inner.subscriptions.lock().unwrap();
        if let Some(count) = subscriptions.get_mut(subject) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                subscriptions.remove(subject);
            }
        }
        Ok(())
    }

    fn set_event_handler(&self, handler: EventHandler) {
        *self.inner.handler.lock().unwrap() = Some(handler);
    }
}
