use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::error::Result;

pub mod memory;

pub use memory::InMemoryBus;

/// Callback invoked for every inbound event. The first argument is the full
/// event subject (`event.<name>.<event>`), the second the raw payload.
pub type EventHandler = Arc<dyn Fn(&str, JsonValue) + Send + Sync>;

/// The message-bus capabilities the gateway consumes: request/reply plus
/// topic subscription with events delivered through the installed handler.
/// Bus semantics (at-least-once, per-subject ordering) are assumed, not
/// re-implemented.
///
/// Subscriptions are counted per subject: `subscribe` and `unsubscribe`
/// calls pair up, and delivery stops when the count drops to zero.
#[async_trait]
pub trait BusClient: Send + Sync {
    async fn request(&self, subject: &str, payload: JsonValue) -> Result<JsonValue>;
    async fn subscribe(&self, subject: &str) -> Result<()>;
    async fn unsubscribe(&self, subject: &str) -> Result<()>;
    fn set_event_handler(&self, handler: EventHandler);
}

pub fn get_subject(name: &str) -> String {
    format!("get.{}", name)
}

pub fn access_subject(name: &str) -> String {
    format!("access.{}", name)
}

/// Wildcard subject covering every event of a resource.
pub fn event_subject(name: &str) -> String {
    format!("event.{}.>", name)
}

/// Splits an inbound event subject `event.<name>.<event>` into resource name
/// and event name.
pub fn parse_event_subject(subject: &str) -> Option<(&str, &str)> {
    let rest = subject.strip_prefix("event.")?;
    let (name, event) = rest.rsplit_once('.')?;
    if name.is_empty() || event.is_empty() {
        return None;
    }
    Some((name, event))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_subjects() {
        assert_eq!(get_subject("library.book.1"), "get.library.book.1");
        assert_eq!(access_subject("library.book.1"), "access.library.book.1");
        assert_eq!(event_subject("library.book.1"), "event.library.book.1.>");
    }

    #[test]
    fn splits_event_subjects() {
        assert_eq!(
            parse_event_subject("event.library.book.1.change"),
            Some(("library.book.1", "change"))
        );
        assert_eq!(parse_event_subject("event.x"), None);
        assert_eq!(parse_event_subject("get.library.book.1"), None);
    }
}
