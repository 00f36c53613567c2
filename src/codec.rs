use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::error::{internal_error, invalid_request, Result};
use crate::value::{Collection, Model, ResourceData, Value};

/// Parsed reply to a `get.<name>` request: the resource payload plus the
/// normalised query the service wants events grouped under.
#[derive(Clone, Debug)]
pub struct GetResponse {
    pub data: ResourceData,
    pub query: Option<String>,
}

pub fn parse_get_response(payload: &JsonValue) -> Result<GetResponse> {
    let obj = payload
        .as_object()
        .ok_or_else(|| internal_error("Invalid get response"))?;

    let data = match (obj.get("model"), obj.get("collection")) {
        (Some(model), None) => {
            let model = model
                .as_object()
                .ok_or_else(|| internal_error("Invalid model in get response"))?;
            ResourceData::Model(Model::from_json(model))
        }
        (None, Some(collection)) => {
            let collection = collection
                .as_array()
                .ok_or_else(|| internal_error("Invalid collection in get response"))?;
            ResourceData::Collection(Collection::from_json(collection))
        }
        _ => return Err(internal_error("Invalid get response")),
    };

    let query = match obj.get("query") {
        None | Some(JsonValue::Null) => None,
        Some(JsonValue::String(query)) if query.is_empty() => None,
        Some(JsonValue::String(query)) => Some(query.clone()),
        Some(_) => return Err(internal_error("Invalid query in get response")),
    };

    Ok(GetResponse { data, query })
}

/// Values of a model `change` event, keyed by model key. Delete markers
/// remove keys when applied.
pub fn parse_change_payload(payload: &JsonValue) -> Result<BTreeMap<String, Value>> {
    let values = payload
        .get("values")
        .and_then(JsonValue::as_object)
        .ok_or_else(|| invalid_request("Change event without values"))?;
    Ok(values
        .iter()
        .map(|(key, value)| (key.clone(), Value::from_json(value)))
        .collect())
}

#[derive(Deserialize)]
struct AddPayload {
    idx: usize,
    value: JsonValue,
}

pub fn parse_add_payload(payload: &JsonValue) -> Result<(usize, Value)> {
    let payload: AddPayload = serde_json::from_value(payload.clone())
        .map_err(|err| invalid_request(format!("Invalid add event: {}", err)))?;
    Ok((payload.idx, Value::from_json(&payload.value)))
}

#[derive(Deserialize)]
struct RemovePayload {
    idx: usize,
}

pub fn parse_remove_payload(payload: &JsonValue) -> Result<usize> {
    let payload: RemovePayload = serde_json::from_value(payload.clone())
        .map_err(|err| invalid_request(format!("Invalid remove event: {}", err)))?;
    Ok(payload.idx)
}

#[derive(Deserialize)]
struct QueryEventPayload {
    subject: String,
}

/// Reply subject of a `query` event. The subject must be a non-empty string.
pub fn parse_query_subject(payload: &JsonValue) -> Result<String> {
    let payload: QueryEventPayload = serde_json::from_value(payload.clone())
        .map_err(|err| invalid_request(format!("Invalid query event: {}", err)))?;
    if payload.subject.is_empty() {
        return Err(invalid_request("Query event with empty subject"));
    }
    Ok(payload.subject)
}

/// One synthetic event inside a query response's `events` list.
#[derive(Clone, Debug)]
pub struct SyntheticEvent {
    pub name: String,
    pub payload: JsonValue,
}

/// Parsed reply to a query request sent to a query event's subject.
#[derive(Clone, Debug)]
pub enum QueryResponse {
    /// Ordered synthetic events to replay on the view. May be empty.
    Events(Vec<SyntheticEvent>),
    /// Full model snapshot to diff against the cached view.
    Model(Model),
    /// Full collection snapshot to diff against the cached view.
    Collection(Collection),
}

pub fn parse_query_response(payload: &JsonValue) -> Result<QueryResponse> {
    let obj = payload
        .as_object()
        .ok_or_else(|| invalid_request("Invalid query response"))?;

    if let Some(model) = obj.get("model") {
        let model = model
            .as_object()
            .ok_or_else(|| invalid_request("Invalid model in query response"))?;
        return Ok(QueryResponse::Model(Model::from_json(model)));
    }
    if let Some(collection) = obj.get("collection") {
        let collection = collection
            .as_array()
            .ok_or_else(|| invalid_request("Invalid collection in query response"))?;
        return Ok(QueryResponse::Collection(Collection::from_json(collection)));
    }

    let events = match obj.get("events") {
        None | Some(JsonValue::Null) => Vec::new(),
        Some(JsonValue::Array(events)) => events
            .iter()
            .map(|event| {
                let name = event
                    .get("event")
                    .and_then(JsonValue::as_str)
                    .ok_or_else(|| invalid_request("Query response event without name"))?;
                Ok(SyntheticEvent {
                    name: name.to_string(),
                    payload: event.get("data").cloned().unwrap_or(JsonValue::Null),
                })
            })
            .collect::<Result<Vec<_>>>()?,
        Some(_) => return Err(invalid_request("Invalid events in query response")),
    };
    Ok(QueryResponse::Events(events))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_model_get_response() {
        let response =
            parse_get_response(&json!({"model": {"title": "Dune"}, "query": "sort=title"}))
                .unwrap();
        assert_eq!(response.query.as_deref(), Some("sort=title"));
        assert!(matches!(response.data, ResourceData::Model(_)));
    }

    #[test]
    fn parses_collection_get_response() {
        let response = parse_get_response(&json!({"collection": [1, 2, 3]})).unwrap();
        assert_eq!(response.query, None);
        assert_eq!(response.data.as_collection().unwrap().len(), 3);
    }

    #[test]
    fn rejects_ambiguous_get_response() {
        assert!(parse_get_response(&json!({"model": {}, "collection": []})).is_err());
        assert!(parse_get_response(&json!({})).is_err());
    }

    #[test]
    fn change_payload_requires_values() {
        assert!(parse_change_payload(&json!({"foo": 1})).is_err());
        let values = parse_change_payload(&json!({"values": {"gone": {"action": "delete"}}}))
            .unwrap();
        assert!(values["gone"].is_delete());
    }

    #[test]
    fn query_subject_must_be_nonempty_string() {
        assert!(parse_query_subject(&json!({"subject": "_R.1"})).is_ok());
        assert!(parse_query_subject(&json!({"subject": ""})).is_err());
        assert!(parse_query_subject(&json!({"subject": 7})).is_err());
        assert!(parse_query_subject(&json!({})).is_err());
    }

    #[test]
    fn empty_query_response_is_noop() {
        assert!(matches!(
            parse_query_response(&json!({})).unwrap(),
            QueryResponse::Events(events) if events.is_empty()
        ));
        assert!(matches!(
            parse_query_response(&json!({"events": []})).unwrap(),
            QueryResponse::Events(events) if events.is_empty()
        ));
    }

    #[test]
    fn parses_synthetic_events() {
        let response = parse_query_response(&json!({
            "events": [
                {"event": "remove", "data": {"idx": 1}},
                {"event": "add", "data": {"idx": 1, "value": "bar"}},
            ]
        }))
        .unwrap();
        match response {
            QueryResponse::Events(events) => {
                assert_eq!(events.len(), 2);
                assert_eq!(events[0].name, "remove");
                assert_eq!(events[1].name, "add");
            }
            _ => panic!("expected events"),
        }
    }
}
