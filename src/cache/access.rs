use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use serde_json::Value as JsonValue;

use crate::error::{internal_error, ErrorCode, Result};
use crate::rid::Rid;

/// Methods a client may call on a resource, from the `call` field of an
/// access reply: `"*"` grants all, a comma-separated list grants some.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CallAccess {
    None,
    All,
    Methods(BTreeSet<String>),
}

/// Decision returned by a service for an `access.<name>` request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessDecision {
    pub get: bool,
    pub call: CallAccess,
}

impl AccessDecision {
    pub fn from_json(payload: &JsonValue) -> Result<Self> {
        let obj = payload
            .as_object()
            .ok_or_else(|| internal_error("Invalid access response"))?;
        let get = obj.get("get").and_then(JsonValue::as_bool).unwrap_or(false);
        let call = match obj.get("call") {
            None | Some(JsonValue::Null) => CallAccess::None,
            Some(JsonValue::String(list)) if list == "*" => CallAccess::All,
            Some(JsonValue::String(list)) if list.is_empty() => CallAccess::None,
            Some(JsonValue::String(list)) => CallAccess::Methods(
                list.split(',').map(|method| method.trim().to_string()).collect(),
            ),
            Some(_) => return Err(internal_error("Invalid call access in access response")),
        };
        Ok(Self { get, call })
    }

    pub fn can_call(&self, method: &str) -> bool {
        match &self.call {
            CallAccess::None => false,
            CallAccess::All => true,
            CallAccess::Methods(methods) => methods.contains(method),
        }
    }
}

/// Canonical fingerprint of a connection token, used as part of the access
/// cache key. An unset token fingerprints as `null`.
pub fn token_fingerprint(token: Option<&JsonValue>) -> String {
    match token {
        Some(token) => token.to_string(),
        None => "null".to_string(),
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct AccessKey {
    name: String,
    query: Option<String>,
    token: String,
}

/// Cache of access decisions keyed by (resource, token fingerprint).
///
/// Ok decisions are always cached. Of the error results only
/// `system.accessDenied` is cached; any other error (timeout, internal)
/// stays uncached so the next check retries against the service.
#[derive(Default)]
pub struct AccessCache {
    decisions: Mutex<HashMap<AccessKey, Result<AccessDecision>>>,
}

impl AccessCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, rid: &Rid, token: &str) -> Option<Result<AccessDecision>> {
        self.decisions.lock().unwrap().get(&key(rid, token)).cloned()
    }

    pub fn store(&self, rid: &Rid, token: &str, result: &Result<AccessDecision>) {
        match result {
            Err(err) if err.code != ErrorCode::AccessDenied => {}
            _ => {
                self.decisions
                    .lock()
                    .unwrap()
                    .insert(key(rid, token), result.clone());
            }
        }
    }

    /// Drops every cached decision for the resource name, across all queries
    /// and tokens. Triggered by a `reaccess` event.
    pub fn invalidate(&self, name: &str) {
        self.decisions
            .lock()
            .unwrap()
            .retain(|key, _| key.name != name);
    }
}

fn key(rid: &Rid, token: &str) -> AccessKey {
    AccessKey {
        name: rid.name().to_string(),
        query: rid.query().map(str::to_string),
        token: token.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{access_denied, timeout};
    use serde_json::json;

    #[test]
    fn parses_call_access() {
        let decision = AccessDecision::from_json(&json!({"get": true, "call": "*"})).unwrap();
        assert!(decision.get);
        assert!(decision.can_call("set"));

        let decision =
            AccessDecision::from_json(&json!({"get": true, "call": "set,delete"})).unwrap();
        assert!(decision.can_call("set"));
        assert!(!decision.can_call("rename"));

        let decision = AccessDecision::from_json(&json!({})).unwrap();
        assert!(!decision.get);
        assert!(!decision.can_call("set"));
    }

    #[test]
    fn caches_denied_but_not_transient_errors() {
        let cache = AccessCache::new();
        let rid = Rid::parse("library.book.1").unwrap();

        cache.store(&rid, "null", &Err(timeout()));
        assert!(cache.get(&rid, "null").is_none());

        cache.store(&rid, "null", &Err(access_denied()));
        assert!(matches!(cache.get(&rid, "null"), Some(Err(_))));
    }

    #[test]
    fn invalidates_by_name() {
        let cache = AccessCache::new();
        let book = Rid::parse("library.book.1").unwrap();
        let books = Rid::parse("library.books?sort=title").unwrap();
        let decision = Ok(AccessDecision {
            get: true,
            call: CallAccess::None,
        });

        cache.store(&book, "null", &decision);
        cache.store(&books, "t1", &decision);

        cache.invalidate("library.books");
        assert!(cache.get(&book, "null").is_some());
        assert!(cache.get(&books, "t1").is_none());
    }
}
