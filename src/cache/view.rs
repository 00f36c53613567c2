use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use futures::channel::oneshot;
use serde_json::Value as JsonValue;

use crate::cache::{ResourceEvent, ResourceEventObserver};
use crate::codec::{parse_add_payload, parse_change_payload, parse_remove_payload};
use crate::error::{invalid_request, Result};
use crate::rid::Rid;
use crate::value::{ResourceData, Value};

pub(crate) struct Subscriber {
    pub(crate) id: u64,
    pub(crate) observer: Arc<dyn ResourceEventObserver>,
}

pub(crate) enum LoadState {
    /// The initial get request is in flight. Waiters are notified when it
    /// resolves; events arriving meanwhile are buffered and applied silently
    /// once the snapshot lands (the snapshot each subscriber reads already
    /// reflects them).
    Pending {
        waiters: Vec<oneshot::Sender<Result<()>>>,
        buffered: Vec<(String, JsonValue)>,
    },
    Loaded,
    Deleted,
}

pub(crate) struct ViewState {
    pub(crate) load: LoadState,
    pub(crate) data: Option<ResourceData>,
    pub(crate) normalized_query: Option<String>,
    pub(crate) subscribers: Vec<Subscriber>,
    pub(crate) ref_count: usize,
    next_subscriber_id: u64,
}

impl ViewState {
    pub(crate) fn add_subscriber(&mut self, observer: Arc<dyn ResourceEventObserver>) -> u64 {
        let id = self.next_subscriber_id;
        self.next_subscriber_id += 1;
        self.subscribers.push(Subscriber { id, observer });
        id
    }

    pub(crate) fn is_loaded(&self) -> bool {
        matches!(self.load, LoadState::Loaded)
    }
}

/// One cache entry: the state of a resource as seen through one raw query
/// (the empty query for plain resources). Holds the current model or
/// collection, the load state with coalesced waiters, and the subscriber set
/// events fan out to.
pub(crate) struct ResourceView {
    pub(crate) rid: Rid,
    pub(crate) state: Mutex<ViewState>,
}

impl ResourceView {
    pub(crate) fn new(rid: Rid) -> Self {
        Self {
            rid,
            state: Mutex::new(ViewState {
                load: LoadState::Pending {
                    waiters: Vec::new(),
                    buffered: Vec::new(),
                },
                data: None,
                normalized_query: None,
                subscribers: Vec::new(),
                ref_count: 0,
                next_subscriber_id: 1,
            }),
        }
    }

    pub(crate) fn view_key(&self) -> &str {
        self.rid.query().unwrap_or("")
    }

    pub(crate) fn data(&self) -> Option<ResourceData> {
        self.state.lock().unwrap().data.clone()
    }

    pub(crate) fn normalized_query(&self) -> Option<String> {
        self.state.lock().unwrap().normalized_query.clone()
    }

    /// Routes a direct bus event to this view. While the initial get request
    /// is in flight the event is buffered; once loaded it is applied and, if
    /// it changed anything, fanned out to the subscribers.
    pub(crate) fn apply_direct(&self, event: &str, payload: JsonValue) {
        let mut vs = self.state.lock().unwrap();
        if matches!(vs.load, LoadState::Deleted) {
            return;
        }
        if let LoadState::Pending { buffered, .. } = &mut vs.load {
            buffered.push((event.to_string(), payload));
            return;
        }
        match self.apply_parsed(&mut vs, event, &payload) {
            Ok(Some(resource_event)) => fan_out(&vs.subscribers, resource_event),
            Ok(None) => {}
            Err(err) => {
                log::error!("dropping {} event for {}: {}", event, self.rid, err);
            }
        }
    }

    /// Applies a parsed `change`/`add`/`remove` payload to the cached data
    /// and returns the client-facing event, or `None` when the event is a
    /// no-op. Protocol violations are reported as errors for the caller to
    /// log and drop.
    pub(crate) fn apply_parsed(
        &self,
        vs: &mut ViewState,
        event: &str,
        payload: &JsonValue,
    ) -> Result<Option<ResourceEvent>> {
        match event {
            "change" => {
                let values = parse_change_payload(payload)?;
                self.apply_change(vs, values)
            }
            "add" => {
                let (idx, value) = parse_add_payload(payload)?;
                self.apply_add(vs, idx, value).map(Some)
            }
            "remove" => {
                let idx = parse_remove_payload(payload)?;
                self.apply_remove(vs, idx).map(Some)
            }
            other => Err(invalid_request(format!("Unsupported resource event: {}", other))),
        }
    }

    /// Overwrites model keys, removing those with delete markers. The
    /// returned event carries only keys whose value actually changed, plus
    /// the previous value of every replaced key.
    pub(crate) fn apply_change(
        &self,
        vs: &mut ViewState,
        values: BTreeMap<String, Value>,
    ) -> Result<Option<ResourceEvent>> {
        let model = match &mut vs.data {
            Some(ResourceData::Model(model)) => model,
            _ => return Err(invalid_request("Change event on non-model resource")),
        };

        let mut changed = BTreeMap::new();
        let mut old_values = BTreeMap::new();
        for (key, value) in values {
            if value.is_delete() {
                if let Some(previous) = model.remove(&key) {
                    old_values.insert(key.clone(), previous);
                    changed.insert(key, Value::Delete);
                }
            } else if model.get(&key) != Some(&value) {
                if let Some(previous) = model.insert(key.clone(), value.clone()) {
                    old_values.insert(key.clone(), previous);
                }
                changed.insert(key, value);
            }
        }

        if changed.is_empty() {
            return Ok(None);
        }
        Ok(Some(ResourceEvent::Change {
            values: changed,
            old_values,
        }))
    }

    pub(crate) fn apply_add(
        &self,
        vs: &mut ViewState,
        idx: usize,
        value: Value,
    ) -> Result<ResourceEvent> {
        let collection = match &mut vs.data {
            Some(ResourceData::Collection(collection)) => collection,
            _ => return Err(invalid_request("Add event on non-collection resource")),
        };
        if idx > collection.len() {
            return Err(invalid_request(format!("Add index out of bounds: {}", idx)));
        }
        collection.insert(idx, value.clone());
        Ok(ResourceEvent::Add { idx, value })
    }

    pub(crate) fn apply_remove(&self, vs: &mut ViewState, idx: usize) -> Result<ResourceEvent> {
        let collection = match &mut vs.data {
            Some(ResourceData::Collection(collection)) => collection,
            _ => return Err(invalid_request("Remove event on non-collection resource")),
        };
        if idx >= collection.len() {
            return Err(invalid_request(format!(
                "Remove index out of bounds: {}",
                idx
            )));
        }
        let value = collection.remove(idx);
        Ok(ResourceEvent::Remove { idx, value })
    }
}

pub(crate) fn fan_out(subscribers: &[Subscriber], event: ResourceEvent) {
    for subscriber in subscribers {
        subscriber.observer.on_resource_event(event.clone());
    }
}
