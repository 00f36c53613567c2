use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::channel::oneshot;
use serde_json::{json, Value as JsonValue};

use crate::bus::{access_subject, event_subject, get_subject, parse_event_subject, BusClient};
use crate::codec::{parse_get_response, GetResponse};
use crate::error::{internal_error, not_found, timeout, Result};
use crate::rid::Rid;
use crate::runtime::{spawn_detached, with_timeout};
use crate::value::Value;

pub mod access;
mod handle;
mod query_event;
mod view;

pub use access::{AccessCache, AccessDecision, CallAccess};
pub use handle::ResourceHandle;

use access::token_fingerprint;
use view::{fan_out, LoadState, ResourceView};

/// A resource mutation after it has been applied to the cache, as fanned out
/// to every subscribed handle. `Change` carries the actual delta (no-ops
/// omitted) plus the previous value of each replaced key so downstream
/// reference bookkeeping can release replaced references.
#[derive(Clone, Debug)]
pub enum ResourceEvent {
    Change {
        values: BTreeMap<String, Value>,
        old_values: BTreeMap<String, Value>,
    },
    Add {
        idx: usize,
        value: Value,
    },
    Remove {
        idx: usize,
        value: Value,
    },
    Delete,
    Reaccess,
}

/// Receives the cache's event fan-out for one subscribed handle.
///
/// Implementations must hand the event off to their own work queue and
/// return; the callback runs under cache locks, so calling back into the
/// cache from it deadlocks.
pub trait ResourceEventObserver: Send + Sync {
    fn on_resource_event(&self, event: ResourceEvent);
}

/// Process-wide resource cache. Deduplicates backend subscriptions per
/// resource, fans events out to every client subscription holding a handle,
/// serves query-parameterised views, and caches access decisions.
#[derive(Clone)]
pub struct ResourceCache {
    inner: Arc<CacheInner>,
}

pub(crate) struct CacheInner {
    bus: Arc<dyn BusClient>,
    pub(crate) access: AccessCache,
    pub(crate) request_timeout: Duration,
    entries: Mutex<HashMap<String, Arc<EventSubscription>>>,
}

impl ResourceCache {
    /// Creates the cache and installs its event handler on the bus. The
    /// cache brackets the gateway's lifetime; inject it into connections
    /// rather than reaching for a global.
    pub fn new(bus: Arc<dyn BusClient>, request_timeout: Duration) -> Self {
        let inner = Arc::new(CacheInner {
            bus,
            access: AccessCache::new(),
            request_timeout,
            entries: Mutex::new(HashMap::new()),
        });

        let weak = Arc::downgrade(&inner);
        inner.bus.set_event_handler(Arc::new(move |subject, payload| {
            if let Some(inner) = weak.upgrade() {
                CacheInner::handle_event(&inner, subject, payload);
            }
        }));

        Self { inner }
    }

    /// Routes an inbound bus event (`event.<name>.<event>`) to the resource
    /// it addresses. Events for resources without subscribers are dropped.
    pub fn handle_event(&self, subject: &str, payload: JsonValue) {
        CacheInner::handle_event(&self.inner, subject, payload);
    }

    /// Subscribes a handle to a resource. Reuses the existing cache entry
    /// when one is loading or loaded; otherwise subscribes the resource's
    /// event topic and issues the backend get request. Concurrent subscribes
    /// to the same RID share one outstanding request.
    pub async fn subscribe(
        &self,
        rid: &Rid,
        observer: Arc<dyn ResourceEventObserver>,
    ) -> Result<ResourceHandle> {
        CacheInner::subscribe(&self.inner, rid.clone(), observer).await
    }

    /// Resolves the access decision for (resource, token), consulting the
    /// access cache first. Ok decisions and `system.accessDenied` errors are
    /// cached until a reaccess event invalidates them; other errors are
    /// returned uncached so the next check retries.
    pub async fn access(
        &self,
        rid: &Rid,
        token: Option<&JsonValue>,
        cid: &str,
    ) -> Result<AccessDecision> {
        let fingerprint = token_fingerprint(token);
        if let Some(result) = self.inner.access.get(rid, &fingerprint) {
            return result;
        }

        let mut payload = json!({
            "token": token.cloned().unwrap_or(JsonValue::Null),
            "cid": cid,
        });
        if let Some(query) = rid.query() {
            payload["query"] = json!(query);
        }

        let result = request_with_timeout(
            &self.inner,
            &access_subject(rid.name()),
            payload,
        )
        .await
        .and_then(|payload| AccessDecision::from_json(&payload));

        self.inner.access.store(rid, &fingerprint, &result);
        result
    }

    #[cfg(test)]
    pub(crate) fn entry_count(&self) -> usize {
        self.inner.entries.lock().unwrap().len()
    }
}

pub(crate) async fn request_with_timeout(
    inner: &CacheInner,
    subject: &str,
    payload: JsonValue,
) -> Result<JsonValue> {
    match with_timeout(inner.bus.request(subject, payload), inner.request_timeout).await {
        Ok(result) => result,
        Err(_) => Err(timeout()),
    }
}

enum Attach {
    Ready(Arc<EventSubscription>, Arc<ResourceView>, u64),
    Wait(
        Arc<EventSubscription>,
        Arc<ResourceView>,
        u64,
        oneshot::Receiver<Result<()>>,
    ),
    Load(
        Arc<EventSubscription>,
        Arc<ResourceView>,
        u64,
        oneshot::Receiver<Result<()>>,
        bool,
    ),
}

impl CacheInner {
    fn handle_event(inner: &Arc<CacheInner>, subject: &str, payload: JsonValue) {
        let Some((name, event)) = parse_event_subject(subject) else {
            log::debug!("ignoring event on malformed subject {}", subject);
            return;
        };
        let entry = inner.entries.lock().unwrap().get(name).cloned();
        let Some(entry) = entry else {
            return;
        };
        entry.process_event(inner, event, payload);
        Self::finalize(inner, &entry);
    }

    async fn subscribe(
        inner: &Arc<CacheInner>,
        rid: Rid,
        observer: Arc<dyn ResourceEventObserver>,
    ) -> Result<ResourceHandle> {
        let attach = {
            let mut entries = inner.entries.lock().unwrap();
            let entry = match entries.get(rid.name()) {
                Some(entry) if !entry.state.lock().unwrap().deleted => Arc::clone(entry),
                _ => {
                    let entry = Arc::new(EventSubscription::new(
                        rid.name().to_string(),
                        Arc::downgrade(inner),
                    ));
                    entries.insert(rid.name().to_string(), Arc::clone(&entry));
                    entry
                }
            };

            let mut st = entry.state.lock().unwrap();
            let key = rid.query().unwrap_or("").to_string();
            match st.views.get(&key) {
                Some(view) => {
                    let view = Arc::clone(view);
                    let mut vs = view.state.lock().unwrap();
                    vs.ref_count += 1;
                    let id = vs.add_subscriber(Arc::clone(&observer));
                    match &mut vs.load {
                        LoadState::Pending { waiters, .. } => {
                            let (tx, rx) = oneshot::channel();
                            waiters.push(tx);
                            drop(vs);
                            drop(st);
                            Attach::Wait(entry, view, id, rx)
                        }
                        LoadState::Loaded => {
                            drop(vs);
                            drop(st);
                            Attach::Ready(entry, view, id)
                        }
                        LoadState::Deleted => {
                            drop(vs);
                            drop(st);
                            return Err(not_found());
                        }
                    }
                }
                None => {
                    let view = Arc::new(ResourceView::new(rid.clone()));
                    let (id, rx) = {
                        let mut vs = view.state.lock().unwrap();
                        vs.ref_count = 1;
                        let id = vs.add_subscriber(Arc::clone(&observer));
                        let (tx, rx) = oneshot::channel();
                        match &mut vs.load {
                            LoadState::Pending { waiters, .. } => waiters.push(tx),
                            _ => unreachable!("new views start pending"),
                        }
                        (id, rx)
                    };
                    let first_view = st.views.is_empty();
                    st.views.insert(key, Arc::clone(&view));
                    drop(st);
                    Attach::Load(entry, view, id, rx, first_view)
                }
            }
        };

        match attach {
            Attach::Ready(entry, view, id) => Ok(ResourceHandle::new(entry, view, id)),
            Attach::Wait(entry, view, id, rx) => match rx.await {
                Ok(Ok(())) => Ok(ResourceHandle::new(entry, view, id)),
                Ok(Err(err)) => Err(err),
                Err(_) => Err(internal_error("Resource load was abandoned")),
            },
            Attach::Load(entry, view, id, rx, first_view) => {
                if first_view {
                    // Events must be flowing before the get goes out so
                    // nothing published after the response is missed.
                    if let Err(err) = inner.bus.subscribe(&event_subject(rid.name())).await {
                        entry.detach_subscriber(&view, id);
                        // remove without the unsubscribe a successful
                        // topic subscription would warrant
                        let mut entries = inner.entries.lock().unwrap();
                        if let Some(existing) = entries.get(rid.name()) {
                            if Arc::ptr_eq(existing, &entry)
                                && entry.state.lock().unwrap().views.is_empty()
                            {
                                entries.remove(rid.name());
                            }
                        }
                        return Err(err);
                    }
                }

                let task_inner = Arc::clone(inner);
                let task_entry = Arc::clone(&entry);
                let task_view = Arc::clone(&view);
                spawn_detached(async move {
                    let payload = match task_view.rid.query() {
                        Some(query) => json!({"query": query}),
                        None => json!({}),
                    };
                    let result = request_with_timeout(
                        &task_inner,
                        &get_subject(task_view.rid.name()),
                        payload,
                    )
                    .await
                    .and_then(|payload| parse_get_response(&payload));
                    task_entry.finish_load(&task_view, result);
                    Self::finalize(&task_inner, &task_entry);
                });

                match rx.await {
                    Ok(Ok(())) => Ok(ResourceHandle::new(entry, view, id)),
                    Ok(Err(err)) => Err(err),
                    Err(_) => Err(internal_error("Resource load was abandoned")),
                }
            }
        }
    }

    /// Removes the entry from the cache once it is deleted or has no views
    /// left, and balances the event-topic subscription. Idempotent; every
    /// path that may have emptied or deleted an entry calls it after
    /// releasing the entry lock.
    pub(crate) fn finalize(inner: &Arc<CacheInner>, entry: &Arc<EventSubscription>) {
        let removed = {
            let mut entries = inner.entries.lock().unwrap();
            match entries.get(&entry.name) {
                Some(existing) if Arc::ptr_eq(existing, entry) => {
                    let st = entry.state.lock().unwrap();
                    if st.deleted || st.views.is_empty() {
                        drop(st);
                        entries.remove(&entry.name);
                        true
                    } else {
                        false
                    }
                }
                _ => false,
            }
        };

        if removed {
            let bus = Arc::clone(&inner.bus);
            let subject = event_subject(&entry.name);
            spawn_detached(async move {
                if let Err(err) = bus.unsubscribe(&subject).await {
                    log::warn!("failed to unsubscribe {}: {}", subject, err);
                }
            });
        }
    }
}

pub(crate) struct EventSubState {
    pub(crate) views: HashMap<String, Arc<ResourceView>>,
    pub(crate) pending_queries: usize,
    pub(crate) buffered: VecDeque<(String, JsonValue)>,
    pub(crate) deleted: bool,
}

/// Per-resource-name entry: owns the views of the resource (one per raw
/// query), serialises event application against them, and coordinates query
/// events. Everything that touches a view happens under this entry's state
/// lock, which is what preserves bus order per resource.
pub(crate) struct EventSubscription {
    pub(crate) name: String,
    pub(crate) cache: Weak<CacheInner>,
    pub(crate) state: Mutex<EventSubState>,
}

impl EventSubscription {
    fn new(name: String, cache: Weak<CacheInner>) -> Self {
        Self {
            name,
            cache,
            state: Mutex::new(EventSubState {
                views: HashMap::new(),
                pending_queries: 0,
                buffered: VecDeque::new(),
                deleted: false,
            }),
        }
    }

    fn process_event(self: &Arc<Self>, inner: &Arc<CacheInner>, event: &str, payload: JsonValue) {
        let mut st = self.state.lock().unwrap();
        if st.deleted {
            return;
        }
        if st.pending_queries > 0 {
            st.buffered.push_back((event.to_string(), payload));
            return;
        }
        self.apply_event(inner, &mut st, event, payload);
    }

    pub(crate) fn apply_event(
        self: &Arc<Self>,
        inner: &Arc<CacheInner>,
        st: &mut EventSubState,
        event: &str,
        payload: JsonValue,
    ) {
        match event {
            "change" | "add" | "remove" => {
                // Direct mutations address the unqueried view; query views
                // change only through query events.
                if let Some(view) = st.views.get("") {
                    view.apply_direct(event, payload);
                }
            }
            "delete" => self.cascade_delete(st),
            "reaccess" => {
                inner.access.invalidate(&self.name);
                for view in st.views.values() {
                    let vs = view.state.lock().unwrap();
                    fan_out(&vs.subscribers, ResourceEvent::Reaccess);
                }
            }
            "query" => self.handle_query_event(inner, st, payload),
            other => {
                log::debug!("ignoring unsupported event {} for {}", other, self.name);
            }
        }
    }

    /// Marks the resource deleted, fans `Delete` to every subscriber of
    /// every view, and fails pending loads. The caller finalizes the entry
    /// (map removal + bus unsubscribe) after releasing the lock.
    pub(crate) fn cascade_delete(&self, st: &mut EventSubState) {
        st.deleted = true;
        st.buffered.clear();
        for (_, view) in st.views.drain() {
            let mut vs = view.state.lock().unwrap();
            if let LoadState::Pending { waiters, .. } = std::mem::replace(&mut vs.load, LoadState::Deleted)
            {
                for waiter in waiters {
                    let _ = waiter.send(Err(not_found()));
                }
            }
            let subscribers = std::mem::take(&mut vs.subscribers);
            drop(vs);
            fan_out(&subscribers, ResourceEvent::Delete);
        }
    }

    /// Completes a view's initial load. On success the buffered events that
    /// raced the get request are applied silently (the snapshot already
    /// supersedes them for every waiting subscriber); on failure the view is
    /// removed so the next subscribe retries.
    fn finish_load(self: &Arc<Self>, view: &Arc<ResourceView>, result: Result<GetResponse>) {
        let mut st = self.state.lock().unwrap();
        let mut vs = view.state.lock().unwrap();
        let (waiters, buffered) = match std::mem::replace(&mut vs.load, LoadState::Loaded) {
            LoadState::Pending { waiters, buffered } => (waiters, buffered),
            other => {
                // Deleted while loading; waiters were already notified.
                vs.load = other;
                return;
            }
        };

        match result {
            Ok(response) => {
                vs.normalized_query = response
                    .query
                    .or_else(|| view.rid.query().map(str::to_string));
                vs.data = Some(response.data);
                for (event, payload) in buffered {
                    if let Err(err) = view.apply_parsed(&mut vs, &event, &payload) {
                        log::error!("dropping {} event for {}: {}", event, view.rid, err);
                    }
                }
                drop(vs);
                drop(st);
                for waiter in waiters {
                    let _ = waiter.send(Ok(()));
                }
            }
            Err(err) => {
                vs.load = LoadState::Deleted;
                drop(vs);
                if let Some(existing) = st.views.get(view.view_key()) {
                    if Arc::ptr_eq(existing, view) {
                        st.views.remove(view.view_key());
                    }
                }
                drop(st);
                for waiter in waiters {
                    let _ = waiter.send(Err(err.clone()));
                }
            }
        }
    }

    /// Detaches one subscriber from a view, dropping the view when its
    /// ref-count reaches zero. The caller finalizes the entry afterwards.
    pub(crate) fn detach_subscriber(&self, view: &Arc<ResourceView>, id: u64) {
        let mut st = self.state.lock().unwrap();
        let now_unreferenced = {
            let mut vs = view.state.lock().unwrap();
            vs.subscribers.retain(|subscriber| subscriber.id != id);
            vs.ref_count = vs.ref_count.saturating_sub(1);
            vs.ref_count == 0
        };
        if now_unreferenced {
            if let Some(existing) = st.views.get(view.view_key()) {
                if Arc::ptr_eq(existing, view) {
                    st.views.remove(view.view_key());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use std::sync::Mutex as StdMutex;

    pub(crate) struct RecordingObserver {
        pub(crate) events: StdMutex<Vec<ResourceEvent>>,
    }

    impl RecordingObserver {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self {
                events: StdMutex::new(Vec::new()),
            })
        }
    }

    impl ResourceEventObserver for RecordingObserver {
        fn on_resource_event(&self, event: ResourceEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn test_cache() -> (ResourceCache, InMemoryBus) {
        let bus = InMemoryBus::new();
        let cache = ResourceCache::new(Arc::new(bus.clone()), Duration::from_secs(1));
        (cache, bus)
    }

    #[tokio::test]
    async fn subscribe_loads_and_reuses_entries() {
        let (cache, bus) = test_cache();
        bus.respond_to("get.library.book.1", |_| {
            Ok(json!({"model": {"title": "Dune"}}))
        });

        let rid = Rid::parse("library.book.1").unwrap();
        let first = cache
            .subscribe(&rid, RecordingObserver::new())
            .await
            .unwrap();
        let second = cache
            .subscribe(&rid, RecordingObserver::new())
            .await
            .unwrap();

        assert_eq!(bus.requests_to("get.library.book.1").len(), 1);
        assert!(bus.is_subscribed("event.library.book.1.>"));
        assert!(first.data().is_some());
        drop(second);
        drop(first);

        // last handle gone: entry removed and topic unsubscribed
        tokio::task::yield_now().await;
        assert_eq!(cache.entry_count(), 0);
        assert!(!bus.is_subscribed("event.library.book.1.>"));
    }

    #[tokio::test]
    async fn concurrent_subscribes_share_one_get() {
        let (cache, bus) = test_cache();
        bus.respond_to("get.library.book.1", |_| {
            Ok(json!({"model": {"title": "Dune"}}))
        });

        let rid = Rid::parse("library.book.1").unwrap();
        let (a, b) = tokio::join!(
            cache.subscribe(&rid, RecordingObserver::new()),
            cache.subscribe(&rid, RecordingObserver::new()),
        );
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(bus.requests_to("get.library.book.1").len(), 1);
    }

    #[tokio::test]
    async fn failed_get_is_not_cached() {
        let (cache, bus) = test_cache();
        let rid = Rid::parse("library.book.1").unwrap();

        let err = cache
            .subscribe(&rid, RecordingObserver::new())
            .await
            .unwrap_err();
        assert_eq!(err.code_str(), "system.timeout");
        assert_eq!(cache.entry_count(), 0);

        bus.respond_to("get.library.book.1", |_| {
            Ok(json!({"model": {"title": "Dune"}}))
        });
        assert!(cache.subscribe(&rid, RecordingObserver::new()).await.is_ok());
    }

    #[tokio::test]
    async fn change_events_fan_out_with_delta() {
        let (cache, bus) = test_cache();
        bus.respond_to("get.library.book.1", |_| {
            Ok(json!({"model": {"title": "Dune", "pages": 412}}))
        });

        let rid = Rid::parse("library.book.1").unwrap();
        let observer = RecordingObserver::new();
        let _handle = cache.subscribe(&rid, observer.clone()).await.unwrap();

        bus.publish(
            "event.library.book.1.change",
            json!({"values": {"pages": 500, "title": "Dune"}}),
        );

        let events = observer.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            ResourceEvent::Change { values, old_values } => {
                assert_eq!(values.len(), 1);
                assert_eq!(values["pages"], Value::Primitive(json!(500)));
                assert_eq!(old_values["pages"], Value::Primitive(json!(412)));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn delete_event_cascades_and_drops_entry() {
        let (cache, bus) = test_cache();
        bus.respond_to("get.library.book.1", |_| {
            Ok(json!({"model": {"title": "Dune"}}))
        });

        let rid = Rid::parse("library.book.1").unwrap();
        let observer = RecordingObserver::new();
        let handle = cache.subscribe(&rid, observer.clone()).await.unwrap();

        bus.publish("event.library.book.1.delete", JsonValue::Null);

        assert!(matches!(
            observer.events.lock().unwrap().as_slice(),
            [ResourceEvent::Delete]
        ));
        assert_eq!(cache.entry_count(), 0);

        // further events for the resource are dropped
        bus.publish(
            "event.library.book.1.change",
            json!({"values": {"title": "x"}}),
        );
        assert_eq!(observer.events.lock().unwrap().len(), 1);
        drop(handle);
    }

    #[tokio::test]
    async fn reaccess_invalidates_access_cache_and_fans_out() {
        let (cache, bus) = test_cache();
        bus.respond_to("get.library.book.1", |_| {
            Ok(json!({"model": {"title": "Dune"}}))
        });
        bus.respond_to("access.library.book.1", |_| {
            Ok(json!({"get": true}))
        });

        let rid = Rid::parse("library.book.1").unwrap();
        let observer = RecordingObserver::new();
        let _handle = cache.subscribe(&rid, observer.clone()).await.unwrap();

        cache.access(&rid, None, "c1").await.unwrap();
        cache.access(&rid, None, "c1").await.unwrap();
        assert_eq!(bus.requests_to("access.library.book.1").len(), 1);

        bus.publish("event.library.book.1.reaccess", JsonValue::Null);
        assert!(matches!(
            observer.events.lock().unwrap().as_slice(),
            [ResourceEvent::Reaccess]
        ));

        cache.access(&rid, None, "c1").await.unwrap();
        assert_eq!(bus.requests_to("access.library.book.1").len(), 2);
    }

    #[tokio::test]
    async fn events_racing_the_get_are_folded_into_the_snapshot() {
        let (cache, bus) = test_cache();
        let gate = Arc::new(StdMutex::new(false));
        let bus_for_responder = bus.clone();
        let gate_for_responder = Arc::clone(&gate);
        bus.respond_to("get.library.book.1", move |_| {
            // Publish a change that lands before the get response is parsed.
            if !std::mem::replace(&mut *gate_for_responder.lock().unwrap(), true) {
                bus_for_responder.publish(
                    "event.library.book.1.change",
                    json!({"values": {"pages": 500}}),
                );
            }
            Ok(json!({"model": {"title": "Dune", "pages": 412}}))
        });

        let rid = Rid::parse("library.book.1").unwrap();
        let observer = RecordingObserver::new();
        let handle = cache.subscribe(&rid, observer.clone()).await.unwrap();

        // The raced change is part of the snapshot, not an event.
        let data = handle.data().unwrap();
        let model = data.as_model().unwrap();
        assert_eq!(model.get("pages"), Some(&Value::Primitive(json!(500))));
        assert!(observer.events.lock().unwrap().is_empty());
    }
}
