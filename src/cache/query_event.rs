use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::json;

use crate::cache::view::{fan_out, LoadState, ResourceView};
use crate::cache::{
    request_with_timeout, CacheInner, EventSubState, EventSubscription, ResourceEvent,
};
use crate::codec::{parse_query_response, parse_query_subject, QueryResponse, SyntheticEvent};
use crate::error::Result;
use crate::runtime::spawn_detached;
use crate::value::{Model, Value};

impl EventSubscription {
    /// Handles a `query` event: one backend request per distinct normalised
    /// query currently held, multicast of each response to the views sharing
    /// that query, and buffering of every other event on the resource until
    /// all outstanding requests resolve.
    pub(crate) fn handle_query_event(
        self: &Arc<Self>,
        inner: &Arc<CacheInner>,
        st: &mut EventSubState,
        payload: serde_json::Value,
    ) {
        let subject = match parse_query_subject(&payload) {
            Ok(subject) => subject,
            Err(err) => {
                log::error!("invalid query event for {}: {}", self.name, err);
                return;
            }
        };

        // Views still waiting for their get response are skipped; that
        // response already reflects the latest state.
        let mut groups: HashMap<String, Vec<Arc<ResourceView>>> = HashMap::new();
        for view in st.views.values() {
            let vs = view.state.lock().unwrap();
            if !vs.is_loaded() {
                continue;
            }
            let Some(normalized) = vs.normalized_query.clone() else {
                continue;
            };
            if normalized.is_empty() {
                continue;
            }
            groups.entry(normalized).or_default().push(Arc::clone(view));
        }
        if groups.is_empty() {
            return;
        }

        st.pending_queries += groups.len();
        for (normalized, views) in groups {
            let entry = Arc::clone(self);
            let inner = Arc::clone(inner);
            let subject = subject.clone();
            spawn_detached(async move {
                let result =
                    request_with_timeout(&inner, &subject, json!({"query": normalized})).await;
                entry.finish_query_request(&inner, views, result);
                CacheInner::finalize(&inner, &entry);
            });
        }
    }

    /// Applies one query request's outcome. Each request releases only its
    /// own views; the buffered events drain once the last outstanding
    /// request is in.
    fn finish_query_request(
        self: &Arc<Self>,
        inner: &Arc<CacheInner>,
        views: Vec<Arc<ResourceView>>,
        result: Result<serde_json::Value>,
    ) {
        let mut st = self.state.lock().unwrap();
        if st.deleted {
            return;
        }
        st.pending_queries = st.pending_queries.saturating_sub(1);

        // Views unsubscribed while the request was in flight no longer
        // receive anything.
        let views: Vec<_> = views
            .into_iter()
            .filter(|view| {
                st.views
                    .get(view.view_key())
                    .map_or(false, |current| Arc::ptr_eq(current, view))
            })
            .collect();

        match result {
            Ok(payload) => match parse_query_response(&payload) {
                Ok(QueryResponse::Events(events)) => {
                    for view in &views {
                        self.replay_synthetic(&mut st, view, &events);
                    }
                }
                Ok(QueryResponse::Model(next)) => {
                    for view in &views {
                        self.reset_model(view, &next);
                    }
                }
                Ok(QueryResponse::Collection(next)) => {
                    for view in &views {
                        self.reset_collection(view, next.values());
                    }
                }
                Err(err) => {
                    log::error!("invalid query response for {}: {}", self.name, err);
                }
            },
            Err(err) if err.is_gone() => {
                self.cascade_delete(&mut st);
                return;
            }
            Err(err) => {
                log::error!("query request failed for {}: {}", self.name, err);
            }
        }

        if st.pending_queries == 0 {
            self.drain_buffered(inner, &mut st);
        }
    }

    /// Replays synthetic events on one view as if they had arrived on the
    /// bus for that view alone. A synthetic delete disposes the view without
    /// touching its sibling views.
    fn replay_synthetic(
        &self,
        st: &mut EventSubState,
        view: &Arc<ResourceView>,
        events: &[SyntheticEvent],
    ) {
        for event in events {
            if event.name == "delete" {
                let mut vs = view.state.lock().unwrap();
                vs.load = LoadState::Deleted;
                let subscribers = std::mem::take(&mut vs.subscribers);
                drop(vs);
                if let Some(current) = st.views.get(view.view_key()) {
                    if Arc::ptr_eq(current, view) {
                        st.views.remove(view.view_key());
                    }
                }
                fan_out(&subscribers, ResourceEvent::Delete);
                return;
            }

            let mut vs = view.state.lock().unwrap();
            match view.apply_parsed(&mut vs, &event.name, &event.payload) {
                Ok(Some(applied)) => fan_out(&vs.subscribers, applied),
                Ok(None) => {}
                Err(err) => {
                    log::error!(
                        "dropping synthetic {} event for {}: {}",
                        event.name,
                        view.rid,
                        err
                    );
                }
            }
        }
    }

    /// Diffs a full model snapshot against the cached view and emits the
    /// minimal single change event.
    fn reset_model(&self, view: &Arc<ResourceView>, next: &Model) {
        let mut vs = view.state.lock().unwrap();
        let current = match vs.data.as_ref().and_then(|data| data.as_model()) {
            Some(model) => model.clone(),
            None => {
                log::error!("model query response for non-model view {}", view.rid);
                return;
            }
        };
        let values = diff_model(&current, next);
        if values.is_empty() {
            return;
        }
        match view.apply_change(&mut vs, values) {
            Ok(Some(event)) => fan_out(&vs.subscribers, event),
            Ok(None) => {}
            Err(err) => {
                log::error!("failed to apply model reset for {}: {}", view.rid, err);
            }
        }
    }

    /// Diffs a full collection snapshot against the cached view and emits
    /// the remove/add sequence that transforms the old into the new.
    fn reset_collection(&self, view: &Arc<ResourceView>, next: &[Value]) {
        let mut vs = view.state.lock().unwrap();
        let current = match vs.data.as_ref().and_then(|data| data.as_collection()) {
            Some(collection) => collection.values().to_vec(),
            None => {
                log::error!("collection query response for non-collection view {}", view.rid);
                return;
            }
        };
        for op in diff_collection(&current, next) {
            let applied = match op {
                CollectionOp::Remove { idx } => view.apply_remove(&mut vs, idx),
                CollectionOp::Add { idx, value } => view.apply_add(&mut vs, idx, value),
            };
            match applied {
                Ok(event) => fan_out(&vs.subscribers, event),
                Err(err) => {
                    log::error!("failed to apply collection reset for {}: {}", view.rid, err);
                    return;
                }
            }
        }
    }

    /// Replays events buffered behind outstanding query requests, in bus
    /// order. A buffered query event starts a new round; the drain stops and
    /// everything behind it stays buffered.
    pub(crate) fn drain_buffered(
        self: &Arc<Self>,
        inner: &Arc<CacheInner>,
        st: &mut EventSubState,
    ) {
        while st.pending_queries == 0 && !st.deleted {
            let Some((event, payload)) = st.buffered.pop_front() else {
                break;
            };
            self.apply_event(inner, st, &event, payload);
        }
    }
}

/// The minimal change set transforming `current` into `next`: changed and
/// added keys with their new value, removed keys with a delete marker.
pub(crate) fn diff_model(current: &Model, next: &Model) -> BTreeMap<String, Value> {
    let mut values = BTreeMap::new();
    for (key, value) in next.values() {
        if current.get(key) != Some(value) {
            values.insert(key.clone(), value.clone());
        }
    }
    for key in current.values().keys() {
        if next.get(key).is_none() {
            values.insert(key.clone(), Value::Delete);
        }
    }
    values
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum CollectionOp {
    Remove { idx: usize },
    Add { idx: usize, value: Value },
}

/// Remove/add sequence transforming `a` into `b`, derived from a
/// longest-common-subsequence reduction over the region left after trimming
/// the common prefix and suffix. Removes come first in descending index
/// order, then adds in ascending index order; every index is valid at the
/// time its operation applies.
pub(crate) fn diff_collection(a: &[Value], b: &[Value]) -> Vec<CollectionOp> {
    let mut start = 0;
    while start < a.len() && start < b.len() && a[start] == b[start] {
        start += 1;
    }
    let (mut a_end, mut b_end) = (a.len(), b.len());
    while a_end > start && b_end > start && a[a_end - 1] == b[b_end - 1] {
        a_end -= 1;
        b_end -= 1;
    }

    let m = a_end - start;
    let n = b_end - start;
    let mut table = vec![vec![0usize; n + 1]; m + 1];
    for i in 1..=m {
        for j in 1..=n {
            table[i][j] = if a[start + i - 1] == b[start + j - 1] {
                table[i - 1][j - 1] + 1
            } else {
                table[i - 1][j].max(table[i][j - 1])
            };
        }
    }

    let mut removes = Vec::new();
    let mut adds = Vec::new();
    let (mut i, mut j) = (m, n);
    loop {
        if i > 0 && j > 0 && a[start + i - 1] == b[start + j - 1] {
            i -= 1;
            j -= 1;
        } else if i > 0 && (j == 0 || table[i - 1][j] >= table[i][j - 1]) {
            removes.push(CollectionOp::Remove {
                idx: start + i - 1,
            });
            i -= 1;
        } else if j > 0 {
            adds.push(CollectionOp::Add {
                idx: start + j - 1,
                value: b[start + j - 1].clone(),
            });
            j -= 1;
        } else {
            break;
        }
    }

    adds.reverse();
    removes.extend(adds);
    removes
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn model(json: serde_json::Value) -> Model {
        Model::from_json(json.as_object().unwrap())
    }

    fn values(json: &[serde_json::Value]) -> Vec<Value> {
        json.iter().map(Value::from_json).collect()
    }

    fn apply_ops(mut list: Vec<Value>, ops: &[CollectionOp]) -> Vec<Value> {
        for op in ops {
            match op {
                CollectionOp::Remove { idx } => {
                    list.remove(*idx);
                }
                CollectionOp::Add { idx, value } => {
                    list.insert(*idx, value.clone());
                }
            }
        }
        list
    }

    #[test]
    fn model_diff_is_minimal() {
        let current = model(json!({"string": "foo", "int": 10, "bool": true, "null": null}));
        let next = model(json!({"string": "bar", "int": -12, "bool": true}));
        let diff = diff_model(&current, &next);
        assert_eq!(diff.len(), 3);
        assert_eq!(diff["string"], Value::Primitive(json!("bar")));
        assert_eq!(diff["int"], Value::Primitive(json!(-12)));
        assert!(diff["null"].is_delete());
    }

    #[test]
    fn identical_models_diff_to_nothing() {
        let current = model(json!({"a": 1}));
        assert!(diff_model(&current, &current.clone()).is_empty());
    }

    #[test]
    fn collection_diff_replaces_in_the_altered_region() {
        let a = values(&[json!("foo"), json!("foo"), json!(42), json!(true)]);
        let b = values(&[json!("foo"), json!("bar"), json!(42), json!(true)]);
        let ops = diff_collection(&a, &b);
        assert_eq!(
            ops,
            vec![
                CollectionOp::Remove { idx: 1 },
                CollectionOp::Add {
                    idx: 1,
                    value: Value::Primitive(json!("bar"))
                },
            ]
        );
        assert_eq!(apply_ops(a, &ops), b);
    }

    #[test]
    fn collection_diff_round_trips() {
        let cases: Vec<(Vec<serde_json::Value>, Vec<serde_json::Value>)> = vec![
            (vec![], vec![json!(1), json!(2)]),
            (vec![json!(1), json!(2)], vec![]),
            (
                vec![json!("a"), json!("b"), json!("c")],
                vec![json!("c"), json!("b"), json!("a")],
            ),
            (
                vec![json!(1), json!(2), json!(3), json!(4)],
                vec![json!(2), json!(4), json!(5)],
            ),
            (
                vec![json!("x"), json!("x"), json!("x")],
                vec![json!("x"), json!("x")],
            ),
        ];
        for (a, b) in cases {
            let a = values(&a);
            let b = values(&b);
            let ops = diff_collection(&a, &b);
            assert_eq!(apply_ops(a.clone(), &ops), b, "ops {:?}", ops);
        }
    }

    #[test]
    fn equal_collections_diff_to_nothing() {
        let a = values(&[json!(1), json!(2)]);
        assert!(diff_collection(&a, &a).is_empty());
    }

    #[test]
    fn remove_indices_stay_valid_mid_sequence() {
        // every remove index must be within bounds of the list as it shrinks
        let a = values(&[json!(1), json!(2), json!(3), json!(4), json!(5)]);
        let b = values(&[json!(5)]);
        let mut list = a.clone();
        for op in diff_collection(&a, &b) {
            match op {
                CollectionOp::Remove { idx } => {
                    assert!(idx < list.len());
                    list.remove(idx);
                }
                CollectionOp::Add { idx, value } => {
                    assert!(idx <= list.len());
                    list.insert(idx, value);
                }
            }
        }
        assert_eq!(list, b);
    }
}
