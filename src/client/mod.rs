use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use futures::channel::oneshot;
use serde_json::{json, Value as JsonValue};

use crate::cache::ResourceCache;
use crate::error::{
    disposed_subscription, no_subscription, subscription_limit_exceeded, Error, Result,
};
use crate::rid::Rid;
use crate::runtime::spawn_detached;
use crate::value::Value;

mod queue;
mod subscription;

use queue::WorkQueue;
use subscription::{evaluate_access, ClientSubscription};

/// Resources embedded in a subscribe response or in an event that introduces
/// new references: model and collection snapshots keyed by RID, plus load
/// errors for children that failed while their siblings stayed functional.
#[derive(Clone, Debug, Default)]
pub struct ResourceSet {
    pub models: BTreeMap<String, JsonValue>,
    pub collections: BTreeMap<String, JsonValue>,
    pub errors: BTreeMap<String, Error>,
}

impl ResourceSet {
    pub fn is_empty(&self) -> bool {
        self.models.is_empty() && self.collections.is_empty() && self.errors.is_empty()
    }

    pub fn to_json(&self) -> JsonValue {
        let mut obj = serde_json::Map::new();
        if !self.models.is_empty() {
            obj.insert("models".to_string(), json!(self.models));
        }
        if !self.collections.is_empty() {
            obj.insert("collections".to_string(), json!(self.collections));
        }
        if !self.errors.is_empty() {
            let errors: BTreeMap<&String, JsonValue> = self
                .errors
                .iter()
                .map(|(rid, err)| (rid, err.to_json()))
                .collect();
            obj.insert("errors".to_string(), json!(errors));
        }
        JsonValue::Object(obj)
    }
}

/// An event addressed to the client under a subscription's RID. The set of
/// kinds is exhaustive for the client protocol.
#[derive(Clone, Debug)]
pub enum ClientEvent {
    Change {
        values: BTreeMap<String, Value>,
        resources: Option<ResourceSet>,
    },
    Add {
        idx: usize,
        value: Value,
        resources: Option<ResourceSet>,
    },
    Remove {
        idx: usize,
    },
    Delete,
    Unsubscribe {
        reason: Error,
    },
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Change { .. } => "change",
            ClientEvent::Add { .. } => "add",
            ClientEvent::Remove { .. } => "remove",
            ClientEvent::Delete => "delete",
            ClientEvent::Unsubscribe { .. } => "unsubscribe",
        }
    }

    /// Wire payload of the event.
    pub fn to_json(&self) -> JsonValue {
        match self {
            ClientEvent::Change { values, resources } => {
                let values: BTreeMap<&String, JsonValue> = values
                    .iter()
                    .map(|(key, value)| (key, value.to_json()))
                    .collect();
                let mut obj = json!({"values": values});
                merge_resources(&mut obj, resources);
                obj
            }
            ClientEvent::Add {
                idx,
                value,
                resources,
            } => {
                let mut obj = json!({"idx": idx, "value": value.to_json()});
                merge_resources(&mut obj, resources);
                obj
            }
            ClientEvent::Remove { idx } => json!({"idx": idx}),
            ClientEvent::Delete => JsonValue::Null,
            ClientEvent::Unsubscribe { reason } => json!({"reason": reason.to_json()}),
        }
    }
}

fn merge_resources(obj: &mut JsonValue, resources: &Option<ResourceSet>) {
    if let Some(resources) = resources {
        if let (JsonValue::Object(obj), JsonValue::Object(extra)) =
            (obj, resources.to_json())
        {
            obj.extend(extra);
        }
    }
}

/// Receives client-bound events: `(rid, event)`. Implemented by the network
/// layer that owns the client socket.
pub type ClientEventSink = Arc<dyn Fn(&str, ClientEvent) + Send + Sync>;

/// One stateful client connection. Owns a serial work queue; every mutation
/// of its subscriptions and every event delivery to them runs on that queue,
/// so the connection is single-writer by construction.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnInner>,
}

pub(crate) struct ConnInner {
    pub(crate) cid: String,
    pub(crate) cache: ResourceCache,
    pub(crate) sink: ClientEventSink,
    pub(crate) queue: WorkQueue,
    pub(crate) subscription_limit: usize,
    pub(crate) state: Mutex<ConnState>,
}

pub(crate) struct ConnState {
    pub(crate) token: Option<JsonValue>,
    pub(crate) subs: HashMap<String, Arc<ClientSubscription>>,
    pub(crate) disposed: bool,
}

impl Connection {
    pub(crate) fn new(
        cache: ResourceCache,
        cid: String,
        sink: ClientEventSink,
        subscription_limit: usize,
    ) -> Self {
        Self {
            inner: Arc::new(ConnInner {
                cid,
                cache,
                sink,
                queue: WorkQueue::new(),
                subscription_limit,
                state: Mutex::new(ConnState {
                    token: None,
                    subs: HashMap::new(),
                    disposed: false,
                }),
            }),
        }
    }

    pub fn cid(&self) -> &str {
        &self.inner.cid
    }

    /// Subscribes the client to a resource. Resolves once the resource and
    /// its reference tree are ready, with the snapshot of every resource the
    /// client does not already have.
    pub async fn subscribe(&self, rid: &str) -> Result<ResourceSet> {
        let rid = Rid::parse(rid)?;
        let (tx, rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        self.inner
            .queue
            .enqueue(move || ConnInner::subscribe_job(&inner, rid, tx));
        rx.await.unwrap_or_else(|_| Err(disposed_subscription()))
    }

    /// Releases one direct subscription of the RID. The subscription itself
    /// is dropped once no direct or indirect holds remain.
    pub async fn unsubscribe(&self, rid: &str) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        let rid = rid.to_string();
        self.inner.queue.enqueue(move || {
            let sub = {
                let st = inner.state.lock().unwrap();
                if st.disposed {
                    let _ = tx.send(Err(disposed_subscription()));
                    return;
                }
                st.subs.get(&rid).cloned()
            };
            let result = match sub {
                Some(sub) if sub.direct_count() > 0 => {
                    sub.remove_direct();
                    Ok(())
                }
                _ => Err(no_subscription()),
            };
            let _ = tx.send(result);
        });
        rx.await.unwrap_or_else(|_| Err(disposed_subscription()))
    }

    /// Replaces the connection token and re-evaluates access on every direct
    /// subscription; a denial unsubscribes the client with the reason.
    pub async fn set_token(&self, token: Option<JsonValue>) {
        let (tx, rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        self.inner.queue.enqueue(move || {
            let subs: Vec<_> = {
                let mut st = inner.state.lock().unwrap();
                st.token = token;
                st.subs.values().cloned().collect()
            };
            for sub in subs {
                sub.handle_reaccess();
            }
            let _ = tx.send(());
        });
        let _ = rx.await;
    }

    /// Drops every subscription. Late callbacks observe the disposed state
    /// and no-op.
    pub fn dispose(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.queue.enqueue(move || {
            let subs: Vec<_> = {
                let mut st = inner.state.lock().unwrap();
                if st.disposed {
                    return;
                }
                st.disposed = true;
                st.subs.drain().map(|(_, sub)| sub).collect()
            };
            for sub in subs {
                sub.dispose();
            }
            inner.queue.close();
        });
    }

}

impl ConnInner {
    fn subscribe_job(
        inner: &Arc<ConnInner>,
        rid: Rid,
        respond: oneshot::Sender<Result<ResourceSet>>,
    ) {
        let rid_str = rid.to_string();
        let existing = {
            let st = inner.state.lock().unwrap();
            if st.disposed {
                let _ = respond.send(Err(disposed_subscription()));
                return;
            }
            st.subs.get(&rid_str).cloned()
        };

        if let Some(sub) = existing {
            if sub.direct_count() > 0 {
                sub.add_direct(respond);
            } else if let Some(decision) = sub.cached_access() {
                // an earlier direct phase resolved access and no reaccess
                // invalidated it since
                if decision.get {
                    sub.add_direct(respond);
                } else {
                    let _ = respond.send(Err(crate::error::access_denied()));
                }
            } else {
                // A direct hold on a previously indirect-only subscription
                // needs its own access check.
                let task_inner = Arc::clone(inner);
                spawn_detached(async move {
                    let token = task_inner.state.lock().unwrap().token.clone();
                    let result = task_inner
                        .cache
                        .access(sub.rid(), token.as_ref(), &task_inner.cid)
                        .await;
                    task_inner.queue.enqueue(move || match evaluate_access(result) {
                        Ok(decision) => sub.add_direct_with_access(decision, respond),
                        Err(err) => {
                            let _ = respond.send(Err(err));
                        }
                    });
                });
            }
            return;
        }

        let sub = {
            let mut st = inner.state.lock().unwrap();
            if st.subs.len() >= inner.subscription_limit {
                let _ = respond.send(Err(subscription_limit_exceeded()));
                return;
            }
            let sub = ClientSubscription::new(inner, rid);
            st.subs.insert(rid_str, Arc::clone(&sub));
            sub
        };
        sub.register_direct(respond);
        sub.begin_direct();
    }

    /// Creates or reuses the subscription a reference expansion points at.
    /// Indirect subscriptions skip the access check; they ride on their
    /// parent's.
    pub(crate) fn subscribe_indirect(
        inner: &Arc<ConnInner>,
        rid: &Rid,
    ) -> Result<Arc<ClientSubscription>> {
        let rid_str = rid.to_string();
        let mut st = inner.state.lock().unwrap();
        if st.disposed {
            return Err(disposed_subscription());
        }
        if let Some(sub) = st.subs.get(&rid_str) {
            let sub = Arc::clone(sub);
            drop(st);
            sub.add_indirect();
            return Ok(sub);
        }
        if st.subs.len() >= inner.subscription_limit {
            return Err(subscription_limit_exceeded());
        }
        let sub = ClientSubscription::new(inner, rid.clone());
        st.subs.insert(rid_str, Arc::clone(&sub));
        drop(st);
        sub.add_indirect();
        sub.begin_indirect();
        Ok(sub)
    }
}
