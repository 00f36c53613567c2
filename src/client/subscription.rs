use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use futures::channel::oneshot;

use crate::cache::{
    AccessDecision, ResourceEvent, ResourceEventObserver, ResourceHandle,
};
use crate::client::{ClientEvent, ConnInner, ResourceSet};
use crate::error::{access_denied, disposed_subscription, internal_error, Error, Result};
use crate::rid::Rid;
use crate::runtime::spawn_detached;
use crate::value::{ResourceData, Value};

const QUEUE_LOADING: u8 = 1 << 0;
const QUEUE_REACCESS: u8 = 1 << 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Loading,
    Loaded,
    Ready,
    ToSend,
    Sent,
    Failed,
    Disposed,
}

struct SubReference {
    sub: Arc<ClientSubscription>,
    count: usize,
}

/// Shared bookkeeping for one readiness wait across a reference tree. The
/// visited map doubles as the cycle breaker: a subscription already present
/// counts as ready, because it completes through the path that first added
/// it.
struct ReadyTracker {
    visited: HashMap<String, Arc<ClientSubscription>>,
    pending: usize,
    on_complete: Option<Box<dyn FnOnce() + Send>>,
}

type ReadyRef = Arc<Mutex<ReadyTracker>>;

struct SubState {
    phase: Phase,
    handle: Option<ResourceHandle>,
    error: Option<Error>,
    direct: usize,
    indirect: usize,
    queue_flags: u8,
    events: VecDeque<ResourceEvent>,
    refs: HashMap<String, SubReference>,
    trackers: Vec<ReadyRef>,
    response_waiters: Vec<oneshot::Sender<Result<ResourceSet>>>,
    access: Option<AccessDecision>,
}

/// Per-(connection, RID) state machine. Orchestrates the asynchronous load,
/// reference expansion, access checks and event queueing that stand between
/// a raw cache entry and a consistent client-facing snapshot-then-events
/// stream. Every method runs on the owning connection's work queue.
pub(crate) struct ClientSubscription {
    rid: Rid,
    rid_str: String,
    conn: Weak<ConnInner>,
    state: Mutex<SubState>,
}

/// Maps an access result to the subscribe outcome: a decision without `get`
/// is a denial.
pub(crate) fn evaluate_access(result: Result<AccessDecision>) -> Result<AccessDecision> {
    match result {
        Ok(decision) if decision.get => Ok(decision),
        Ok(_) => Err(access_denied()),
        Err(err) => Err(err),
    }
}

struct SubObserver {
    conn: Weak<ConnInner>,
    sub: Weak<ClientSubscription>,
}

impl ResourceEventObserver for SubObserver {
    fn on_resource_event(&self, event: ResourceEvent) {
        if let (Some(conn), Some(sub)) = (self.conn.upgrade(), self.sub.upgrade()) {
            conn.queue.enqueue(move || sub.process_event(event));
        }
    }
}

impl ClientSubscription {
    pub(crate) fn new(conn: &Arc<ConnInner>, rid: Rid) -> Arc<Self> {
        let rid_str = rid.to_string();
        Arc::new(Self {
            rid,
            rid_str,
            conn: Arc::downgrade(conn),
            state: Mutex::new(SubState {
                phase: Phase::Loading,
                handle: None,
                error: None,
                direct: 0,
                indirect: 0,
                queue_flags: 0,
                events: VecDeque::new(),
                refs: HashMap::new(),
                trackers: Vec::new(),
                response_waiters: Vec::new(),
                access: None,
            }),
        })
    }

    pub(crate) fn rid(&self) -> &Rid {
        &self.rid
    }

    pub(crate) fn direct_count(&self) -> usize {
        self.state.lock().unwrap().direct
    }

    fn is_sent(&self) -> bool {
        self.state.lock().unwrap().phase == Phase::Sent
    }

    pub(crate) fn cached_access(&self) -> Option<AccessDecision> {
        self.state.lock().unwrap().access.clone()
    }

    pub(crate) fn register_direct(&self, respond: oneshot::Sender<Result<ResourceSet>>) {
        let mut st = self.state.lock().unwrap();
        st.direct += 1;
        st.response_waiters.push(respond);
    }

    /// Adds another direct hold. Subscriptions the client already received
    /// respond right away; loading ones park the responder until readiness.
    pub(crate) fn add_direct(
        self: &Arc<Self>,
        respond: oneshot::Sender<Result<ResourceSet>>,
    ) {
        let mut st = self.state.lock().unwrap();
        st.direct += 1;
        match st.phase {
            Phase::Sent => {
                drop(st);
                let _ = respond.send(Ok(ResourceSet::default()));
            }
            Phase::Failed => {
                let err = st
                    .error
                    .clone()
                    .unwrap_or_else(|| internal_error("Failed to load resource"));
                drop(st);
                let _ = respond.send(Err(err));
            }
            Phase::Disposed => {
                drop(st);
                let _ = respond.send(Err(disposed_subscription()));
            }
            Phase::Loading => {
                st.response_waiters.push(respond);
            }
            Phase::Loaded | Phase::Ready | Phase::ToSend => {
                st.response_waiters.push(respond);
                drop(st);
                self.start_ready_wait();
            }
        }
    }

    pub(crate) fn add_direct_with_access(
        self: &Arc<Self>,
        decision: AccessDecision,
        respond: oneshot::Sender<Result<ResourceSet>>,
    ) {
        self.state.lock().unwrap().access = Some(decision);
        self.add_direct(respond);
    }

    pub(crate) fn add_indirect(&self) {
        self.state.lock().unwrap().indirect += 1;
    }

    fn observer(self: &Arc<Self>, conn: &Arc<ConnInner>) -> Arc<dyn ResourceEventObserver> {
        Arc::new(SubObserver {
            conn: Arc::downgrade(conn),
            sub: Arc::downgrade(self),
        })
    }

    /// Starts the access check and cache load of a direct subscription as
    /// parked background work; completion lands back on the connection
    /// queue.
    pub(crate) fn begin_direct(self: &Arc<Self>) {
        let Some(conn) = self.conn.upgrade() else {
            return;
        };
        let sub = Arc::clone(self);
        spawn_detached(async move {
            let token = conn.state.lock().unwrap().token.clone();
            let access = conn.cache.access(&sub.rid, token.as_ref(), &conn.cid).await;
            match evaluate_access(access) {
                Err(err) => {
                    let job_sub = Arc::clone(&sub);
                    conn.queue.enqueue(move || job_sub.fail_loading(err));
                }
                Ok(decision) => {
                    let observer = sub.observer(&conn);
                    let result = conn.cache.subscribe(&sub.rid, observer).await;
                    let job_sub = Arc::clone(&sub);
                    conn.queue
                        .enqueue(move || job_sub.load_done(result, Some(decision)));
                }
            }
        });
    }

    pub(crate) fn begin_indirect(self: &Arc<Self>) {
        let Some(conn) = self.conn.upgrade() else {
            return;
        };
        let sub = Arc::clone(self);
        spawn_detached(async move {
            let observer = sub.observer(&conn);
            let result = conn.cache.subscribe(&sub.rid, observer).await;
            let job_sub = Arc::clone(&sub);
            conn.queue.enqueue(move || job_sub.load_done(result, None));
        });
    }

    fn load_done(
        self: &Arc<Self>,
        result: Result<ResourceHandle>,
        access: Option<AccessDecision>,
    ) {
        {
            let mut st = self.state.lock().unwrap();
            if st.phase != Phase::Loading {
                // Disposed while loading; the handle (if any) detaches on drop.
                return;
            }
            if let Some(decision) = access {
                st.access = Some(decision);
            }
            match result {
                Ok(handle) => {
                    st.handle = Some(handle);
                    st.phase = Phase::Loaded;
                }
                Err(err) => {
                    drop(st);
                    self.fail_loading(err);
                    return;
                }
            }
        }
        self.expand_refs();
    }

    /// Subscribes every reference in the loaded model or collection. A
    /// failure to even create a child subscription (invalid RID, limit)
    /// unwinds the references added so far and fails this subscription;
    /// children that fail to *load* stay, as errors in the snapshot.
    fn expand_refs(self: &Arc<Self>) {
        let data = {
            let st = self.state.lock().unwrap();
            st.handle.as_ref().and_then(ResourceHandle::data)
        };

        let mut added: Vec<String> = Vec::new();
        if let Some(data) = data {
            for rid in data.references() {
                match self.add_reference(&rid) {
                    Ok(_) => added.push(rid.to_string()),
                    Err(err) => {
                        for rid_str in &added {
                            self.remove_reference(rid_str);
                        }
                        self.fail_loading(err);
                        return;
                    }
                }
            }
        }

        // Trackers parked on this subscription continue into the children.
        let trackers = { std::mem::take(&mut self.state.lock().unwrap().trackers) };
        for tracker in trackers {
            for child in self.child_subs() {
                child.join_tracker(&tracker);
            }
            Self::tracker_done(&tracker);
        }

        // A parent's tracker may already have settled (or even sent) this
        // subscription while the loop above ran; parked direct responders
        // still need their own readiness walk.
        let drives_response = {
            let st = self.state.lock().unwrap();
            !st.response_waiters.is_empty()
                && !matches!(st.phase, Phase::Loading | Phase::Failed | Phase::Disposed)
        };
        if drives_response {
            self.start_ready_wait();
        }
    }

    fn child_subs(&self) -> Vec<Arc<ClientSubscription>> {
        self.state
            .lock()
            .unwrap()
            .refs
            .values()
            .map(|reference| Arc::clone(&reference.sub))
            .collect()
    }

    fn new_tracker(on_complete: Box<dyn FnOnce() + Send>) -> ReadyRef {
        Arc::new(Mutex::new(ReadyTracker {
            visited: HashMap::new(),
            pending: 0,
            on_complete: Some(on_complete),
        }))
    }

    /// Begins a readiness wait rooted at this subscription; completion
    /// answers the parked subscribe responders.
    fn start_ready_wait(self: &Arc<Self>) {
        let sub = Arc::clone(self);
        let tracker = Self::new_tracker(Box::new(move || sub.finish_direct_subscribe()));
        self.join_tracker(&tracker);
        Self::complete_if_idle(&tracker);
    }

    /// Adds this subscription (and, transitively, its reference tree) to a
    /// readiness wait. Already-settled and already-visited subscriptions
    /// contribute nothing; loading ones park the tracker until they load.
    fn join_tracker(self: &Arc<Self>, tracker: &ReadyRef) {
        {
            let mut t = tracker.lock().unwrap();
            if t.visited.contains_key(&self.rid_str) {
                return;
            }
            t.visited.insert(self.rid_str.clone(), Arc::clone(self));
        }

        enum Next {
            Wait,
            Recurse(Vec<Arc<ClientSubscription>>),
            Done,
        }
        let next = {
            let mut st = self.state.lock().unwrap();
            match st.phase {
                Phase::Loading => {
                    st.trackers.push(Arc::clone(tracker));
                    Next::Wait
                }
                Phase::Loaded => Next::Recurse(
                    st.refs
                        .values()
                        .map(|reference| Arc::clone(&reference.sub))
                        .collect(),
                ),
                _ => Next::Done,
            }
        };
        match next {
            Next::Wait => tracker.lock().unwrap().pending += 1,
            Next::Recurse(children) => {
                for child in children {
                    child.join_tracker(tracker);
                }
            }
            Next::Done => {}
        }
    }

    fn tracker_done(tracker: &ReadyRef) {
        let finished = {
            let mut t = tracker.lock().unwrap();
            t.pending = t.pending.saturating_sub(1);
            t.pending == 0
        };
        if finished {
            Self::complete_tracker(tracker);
        }
    }

    fn complete_if_idle(tracker: &ReadyRef) {
        if tracker.lock().unwrap().pending == 0 {
            Self::complete_tracker(tracker);
        }
    }

    fn complete_tracker(tracker: &ReadyRef) {
        let (participants, on_complete) = {
            let mut t = tracker.lock().unwrap();
            (
                t.visited.values().cloned().collect::<Vec<_>>(),
                t.on_complete.take(),
            )
        };
        for sub in participants {
            sub.mark_ready();
        }
        if let Some(on_complete) = on_complete {
            on_complete();
        }
    }

    fn mark_ready(self: &Arc<Self>) {
        let mut st = self.state.lock().unwrap();
        if st.phase == Phase::Loaded {
            st.phase = Phase::Ready;
        }
    }

    /// Builds and sends the subscribe response: the snapshot walk marks the
    /// in-flight resources, the responders are answered, and the release
    /// step flips everything to Sent and flushes the queues.
    fn finish_direct_subscribe(self: &Arc<Self>) {
        let waiters = {
            let mut st = self.state.lock().unwrap();
            if st.phase == Phase::Disposed {
                return;
            }
            std::mem::take(&mut st.response_waiters)
        };
        if waiters.is_empty() {
            return;
        }

        let mut set = ResourceSet::default();
        let mut visited = HashSet::new();
        self.collect_resources(&mut set, &mut visited);
        for waiter in waiters {
            let _ = waiter.send(Ok(set.clone()));
        }
        let mut released = HashSet::new();
        self.release_sent(&mut released);
    }

    /// Gathers this subscription and its reference tree into a resource set,
    /// skipping resources the client already has and recording failed
    /// children under `errors`. Visited resources are marked as part of the
    /// in-flight response.
    fn collect_resources(self: &Arc<Self>, set: &mut ResourceSet, visited: &mut HashSet<String>) {
        if !visited.insert(self.rid_str.clone()) {
            return;
        }
        let (data, children) = {
            let mut st = self.state.lock().unwrap();
            match st.phase {
                Phase::Sent | Phase::ToSend | Phase::Disposed | Phase::Loading => return,
                Phase::Failed => {
                    set.errors.insert(
                        self.rid_str.clone(),
                        st.error
                            .clone()
                            .unwrap_or_else(|| internal_error("Failed to load resource")),
                    );
                    return;
                }
                Phase::Loaded | Phase::Ready => {}
            }
            st.phase = Phase::ToSend;
            (
                st.handle.as_ref().and_then(ResourceHandle::data),
                st.refs
                    .values()
                    .map(|reference| Arc::clone(&reference.sub))
                    .collect::<Vec<_>>(),
            )
        };

        match data {
            Some(ResourceData::Model(model)) => {
                set.models.insert(self.rid_str.clone(), model.to_json());
            }
            Some(ResourceData::Collection(collection)) => {
                set.collections
                    .insert(self.rid_str.clone(), collection.to_json());
            }
            None => {}
        }
        for child in children {
            child.collect_resources(set, visited);
        }
    }

    /// Marks a just-collected subtree Sent and flushes the events queued
    /// while each subscription waited for its snapshot to go out.
    fn release_sent(self: &Arc<Self>, visited: &mut HashSet<String>) {
        if !visited.insert(self.rid_str.clone()) {
            return;
        }
        let (was_to_send, children) = {
            let mut st = self.state.lock().unwrap();
            let was_to_send = st.phase == Phase::ToSend;
            if was_to_send {
                st.phase = Phase::Sent;
            }
            (
                was_to_send,
                st.refs
                    .values()
                    .map(|reference| Arc::clone(&reference.sub))
                    .collect::<Vec<_>>(),
            )
        };
        if !was_to_send {
            return;
        }
        for child in children {
            child.release_sent(visited);
        }
        self.flush_events();
    }

    /// Entry point for the cache fan-out. Reaccess resolves immediately
    /// (ahead of any queued events); everything else is deliverable only in
    /// Sent with an empty queue-flag set, and queues otherwise.
    pub(crate) fn process_event(self: &Arc<Self>, event: ResourceEvent) {
        if matches!(event, ResourceEvent::Reaccess) {
            self.handle_reaccess();
            return;
        }
        {
            let mut st = self.state.lock().unwrap();
            match st.phase {
                Phase::Disposed | Phase::Failed => return,
                Phase::Sent if st.queue_flags == 0 => {}
                _ => {
                    st.events.push_back(event);
                    return;
                }
            }
        }
        self.handle_event(event);
    }

    /// Drains the event queue one event at a time, re-checking the gate
    /// between events: a handler that re-raises a queue flag leaves the
    /// remainder queued, ahead of anything that arrives later.
    fn flush_events(self: &Arc<Self>) {
        loop {
            let event = {
                let mut st = self.state.lock().unwrap();
                if st.phase != Phase::Sent || st.queue_flags != 0 {
                    return;
                }
                match st.events.pop_front() {
                    Some(event) => event,
                    None => return,
                }
            };
            self.handle_event(event);
        }
    }

    fn handle_event(self: &Arc<Self>, event: ResourceEvent) {
        match event {
            ResourceEvent::Change { values, old_values } => {
                self.handle_change(values, old_values)
            }
            ResourceEvent::Add { idx, value } => self.handle_add(idx, value),
            ResourceEvent::Remove { idx, value } => self.handle_remove(idx, value),
            ResourceEvent::Delete => {
                self.emit(ClientEvent::Delete);
                self.dispose();
            }
            ResourceEvent::Reaccess => self.handle_reaccess(),
        }
    }

    /// New references are added before replaced ones are removed, so a
    /// resource that is re-referenced in the same event never unloads. If
    /// any newly referenced child has not reached the client yet, the event
    /// waits (queueing everything behind it) and goes out with the children
    /// embedded.
    fn handle_change(
        self: &Arc<Self>,
        values: BTreeMap<String, Value>,
        old_values: BTreeMap<String, Value>,
    ) {
        let mut new_children = Vec::new();
        let mut child_errors: BTreeMap<String, Error> = BTreeMap::new();
        for value in values.values() {
            if let Some(rid) = value.reference() {
                match self.add_reference(rid) {
                    Ok(child) => new_children.push(child),
                    Err(err) => {
                        child_errors.insert(rid.to_string(), err);
                    }
                }
            }
        }
        for old in old_values.values() {
            if let Some(rid) = old.reference() {
                self.remove_reference(&rid.to_string());
            }
        }

        let pending: Vec<_> = new_children
            .iter()
            .filter(|child| !child.is_sent())
            .cloned()
            .collect();
        if pending.is_empty() && child_errors.is_empty() {
            self.emit(ClientEvent::Change {
                values,
                resources: None,
            });
            return;
        }

        self.raise_queue_flag(QUEUE_LOADING);
        let sub = Arc::clone(self);
        let children = new_children;
        let tracker = Self::new_tracker(Box::new(move || {
            let mut set = ResourceSet::default();
            let mut visited = HashSet::new();
            for child in &children {
                child.collect_resources(&mut set, &mut visited);
            }
            for (rid, err) in child_errors {
                set.errors.insert(rid, err);
            }
            let resources = if set.is_empty() { None } else { Some(set) };
            sub.emit(ClientEvent::Change { values, resources });
            let mut released = HashSet::new();
            for child in &children {
                child.release_sent(&mut released);
            }
            sub.clear_queue_flag(QUEUE_LOADING);
        }));
        for child in &pending {
            child.join_tracker(&tracker);
        }
        Self::complete_if_idle(&tracker);
    }

    fn handle_add(self: &Arc<Self>, idx: usize, value: Value) {
        let mut child_error: Option<(String, Error)> = None;
        let mut pending_child: Option<Arc<ClientSubscription>> = None;
        if let Some(rid) = value.reference() {
            match self.add_reference(rid) {
                Ok(child) if !child.is_sent() => pending_child = Some(child),
                Ok(_) => {}
                Err(err) => child_error = Some((rid.to_string(), err)),
            }
        }

        let Some(child) = pending_child else {
            let resources = child_error.map(|(rid, err)| {
                let mut set = ResourceSet::default();
                set.errors.insert(rid, err);
                set
            });
            self.emit(ClientEvent::Add {
                idx,
                value,
                resources,
            });
            return;
        };

        self.raise_queue_flag(QUEUE_LOADING);
        let sub = Arc::clone(self);
        let tracked = Arc::clone(&child);
        let tracker = Self::new_tracker(Box::new(move || {
            let mut set = ResourceSet::default();
            let mut visited = HashSet::new();
            tracked.collect_resources(&mut set, &mut visited);
            let resources = if set.is_empty() { None } else { Some(set) };
            sub.emit(ClientEvent::Add {
                idx,
                value,
                resources,
            });
            let mut released = HashSet::new();
            tracked.release_sent(&mut released);
            sub.clear_queue_flag(QUEUE_LOADING);
        }));
        child.join_tracker(&tracker);
        Self::complete_if_idle(&tracker);
    }

    fn handle_remove(self: &Arc<Self>, idx: usize, value: Value) {
        if let Some(rid) = value.reference() {
            self.remove_reference(&rid.to_string());
        }
        self.emit(ClientEvent::Remove { idx });
    }

    fn raise_queue_flag(&self, flag: u8) {
        self.state.lock().unwrap().queue_flags |= flag;
    }

    fn clear_queue_flag(self: &Arc<Self>, flag: u8) {
        {
            let mut st = self.state.lock().unwrap();
            st.queue_flags &= !flag;
            if st.queue_flags != 0 {
                return;
            }
        }
        self.flush_events();
    }

    /// Shares one child subscription across every occurrence of a RID in
    /// this resource, counting occurrences.
    fn add_reference(&self, rid: &Rid) -> Result<Arc<ClientSubscription>> {
        let rid_str = rid.to_string();
        {
            let mut st = self.state.lock().unwrap();
            if let Some(reference) = st.refs.get_mut(&rid_str) {
                reference.count += 1;
                return Ok(Arc::clone(&reference.sub));
            }
        }
        let conn = self.conn.upgrade().ok_or_else(disposed_subscription)?;
        let child = ConnInner::subscribe_indirect(&conn, rid)?;
        self.state.lock().unwrap().refs.insert(
            rid_str,
            SubReference {
                sub: Arc::clone(&child),
                count: 1,
            },
        );
        Ok(child)
    }

    fn remove_reference(&self, rid_str: &str) {
        let released = {
            let mut st = self.state.lock().unwrap();
            match st.refs.get_mut(rid_str) {
                Some(reference) => {
                    reference.count -= 1;
                    if reference.count == 0 {
                        st.refs.remove(rid_str).map(|reference| reference.sub)
                    } else {
                        None
                    }
                }
                None => None,
            }
        };
        if let Some(child) = released {
            child.release_indirect(1);
        }
    }

    fn release_indirect(self: &Arc<Self>, count: usize) {
        let dispose = {
            let mut st = self.state.lock().unwrap();
            st.indirect = st.indirect.saturating_sub(count);
            st.phase != Phase::Disposed && st.indirect == 0 && st.direct == 0
        };
        if dispose {
            self.dispose();
        }
    }

    pub(crate) fn remove_direct(self: &Arc<Self>) {
        let dispose = {
            let mut st = self.state.lock().unwrap();
            st.direct = st.direct.saturating_sub(1);
            st.phase != Phase::Disposed && st.indirect == 0 && st.direct == 0
        };
        if dispose {
            self.dispose();
        }
    }

    /// Invalidates the subscription's access decision. Direct subscriptions
    /// queue events while the decision is re-fetched; a denial unsubscribes
    /// the client with the reason. Indirect-only subscriptions ride on their
    /// parent and skip the re-check.
    pub(crate) fn handle_reaccess(self: &Arc<Self>) {
        {
            let mut st = self.state.lock().unwrap();
            if matches!(st.phase, Phase::Disposed | Phase::Failed) {
                return;
            }
            st.access = None;
            if st.direct == 0 {
                return;
            }
            st.queue_flags |= QUEUE_REACCESS;
        }
        let Some(conn) = self.conn.upgrade() else {
            return;
        };
        let sub = Arc::clone(self);
        spawn_detached(async move {
            let token = conn.state.lock().unwrap().token.clone();
            let result = conn.cache.access(&sub.rid, token.as_ref(), &conn.cid).await;
            let job_sub = Arc::clone(&sub);
            conn.queue.enqueue(move || job_sub.apply_reaccess(result));
        });
    }

    fn apply_reaccess(self: &Arc<Self>, result: Result<AccessDecision>) {
        let denial = {
            let mut st = self.state.lock().unwrap();
            if matches!(st.phase, Phase::Disposed | Phase::Failed) {
                return;
            }
            st.queue_flags &= !QUEUE_REACCESS;
            match evaluate_access(result) {
                Ok(decision) => {
                    st.access = Some(decision);
                    None
                }
                Err(err) => Some(err),
            }
        };
        match denial {
            None => self.flush_events(),
            Some(reason) => {
                self.emit(ClientEvent::Unsubscribe { reason });
                self.dispose();
            }
        }
    }

    /// Terminal load failure. Parked responders get the error; a failed
    /// subscription lingers only while parents still reference it, carrying
    /// the error for their snapshots.
    pub(crate) fn fail_loading(self: &Arc<Self>, err: Error) {
        let (waiters, trackers, dispose_now) = {
            let mut st = self.state.lock().unwrap();
            if matches!(st.phase, Phase::Disposed | Phase::Failed) {
                return;
            }
            st.phase = Phase::Failed;
            st.error = Some(err.clone());
            st.events.clear();
            st.direct = 0;
            (
                std::mem::take(&mut st.response_waiters),
                std::mem::take(&mut st.trackers),
                st.indirect == 0,
            )
        };
        for waiter in waiters {
            let _ = waiter.send(Err(err.clone()));
        }
        for tracker in trackers {
            Self::tracker_done(&tracker);
        }
        if dispose_now {
            self.dispose();
        }
    }

    /// Absorbing terminal state: detaches from the cache, releases indirect
    /// references, answers parked responders, and removes the subscription
    /// from the connection. Late callbacks find the phase and no-op.
    pub(crate) fn dispose(self: &Arc<Self>) {
        let (handle, refs, waiters, trackers) = {
            let mut st = self.state.lock().unwrap();
            if st.phase == Phase::Disposed {
                return;
            }
            st.phase = Phase::Disposed;
            st.events.clear();
            st.queue_flags = 0;
            (
                st.handle.take(),
                std::mem::take(&mut st.refs),
                std::mem::take(&mut st.response_waiters),
                std::mem::take(&mut st.trackers),
            )
        };
        drop(handle);
        for waiter in waiters {
            let _ = waiter.send(Err(disposed_subscription()));
        }
        for tracker in trackers {
            Self::tracker_done(&tracker);
        }
        if let Some(conn) = self.conn.upgrade() {
            let mut st = conn.state.lock().unwrap();
            if let Some(existing) = st.subs.get(&self.rid_str) {
                if Arc::ptr_eq(existing, self) {
                    st.subs.remove(&self.rid_str);
                }
            }
        }
        for (_, reference) in refs {
            reference.sub.release_indirect(reference.count);
        }
    }

    fn emit(&self, event: ClientEvent) {
        if self.state.lock().unwrap().phase == Phase::Disposed {
            return;
        }
        if let Some(conn) = self.conn.upgrade() {
            (conn.sink)(&self.rid_str, event);
        }
    }
}
