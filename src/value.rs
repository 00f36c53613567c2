use std::collections::BTreeMap;

use serde_json::{json, Map as JsonMap, Value as JsonValue};

use crate::rid::Rid;

/// A single value inside a model or collection: either a primitive JSON
/// value, a reference to another resource, or the delete marker that change
/// events use to remove a model key.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Primitive(JsonValue),
    Reference(Rid),
    Delete,
}

impl Value {
    /// Interprets a payload value. An object with a single `rid` key that
    /// parses as a resource identifier is a reference; an object whose
    /// `action` key is `"delete"` is the delete marker; everything else is a
    /// primitive.
    pub fn from_json(value: &JsonValue) -> Self {
        if let Some(obj) = value.as_object() {
            if obj.len() == 1 {
                if let Some(rid) = obj.get("rid").and_then(JsonValue::as_str) {
                    if let Ok(rid) = Rid::parse(rid) {
                        return Value::Reference(rid);
                    }
                }
            }
            if obj.get("action").and_then(JsonValue::as_str) == Some("delete") {
                return Value::Delete;
            }
        }
        Value::Primitive(value.clone())
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Primitive(value) => value.clone(),
            Value::Reference(rid) => json!({"rid": rid.to_string()}),
            Value::Delete => json!({"action": "delete"}),
        }
    }

    pub fn reference(&self) -> Option<&Rid> {
        match self {
            Value::Reference(rid) => Some(rid),
            _ => None,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, Value::Delete)
    }
}

/// Model resource: a key/value mapping. Key order is informational, so the
/// map keeps its keys sorted.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Model {
    values: BTreeMap<String, Value>,
}

impl Model {
    pub fn new(values: BTreeMap<String, Value>) -> Self {
        Self { values }
    }

    pub fn from_json(obj: &JsonMap<String, JsonValue>) -> Self {
        let values = obj
            .iter()
            .map(|(key, value)| (key.clone(), Value::from_json(value)))
            .collect();
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    pub fn insert(&mut self, key: String, value: Value) -> Option<Value> {
        self.values.insert(key, value)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    pub fn to_json(&self) -> JsonValue {
        JsonValue::Object(
            self.values
                .iter()
                .map(|(key, value)| (key.clone(), value.to_json()))
                .collect(),
        )
    }
}

/// Collection resource: an ordered sequence of values.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Collection {
    values: Vec<Value>,
}

impl Collection {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn from_json(values: &[JsonValue]) -> Self {
        Self {
            values: values.iter().map(Value::from_json).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn insert(&mut self, idx: usize, value: Value) {
        self.values.insert(idx, value);
    }

    pub fn remove(&mut self, idx: usize) -> Value {
        self.values.remove(idx)
    }

    pub fn to_json(&self) -> JsonValue {
        JsonValue::Array(self.values.iter().map(Value::to_json).collect())
    }
}

/// The two resource kinds a service can serve.
#[derive(Clone, Debug, PartialEq)]
pub enum ResourceData {
    Model(Model),
    Collection(Collection),
}

impl ResourceData {
    pub fn to_json(&self) -> JsonValue {
        match self {
            ResourceData::Model(model) => model.to_json(),
            ResourceData::Collection(collection) => collection.to_json(),
        }
    }

    pub fn as_model(&self) -> Option<&Model> {
        match self {
            ResourceData::Model(model) => Some(model),
            _ => None,
        }
    }

    pub fn as_collection(&self) -> Option<&Collection> {
        match self {
            ResourceData::Collection(collection) => Some(collection),
            _ => None,
        }
    }

    /// All reference values currently held by the resource.
    pub fn references(&self) -> Vec<Rid> {
        match self {
            ResourceData::Model(model) => model
                .values()
                .values()
                .filter_map(|value| value.reference().cloned())
                .collect(),
            ResourceData::Collection(collection) => collection
                .values()
                .iter()
                .filter_map(|value| value.reference().cloned())
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_reference_values() {
        let value = Value::from_json(&json!({"rid": "library.book.1"}));
        assert_eq!(value.reference().unwrap().name(), "library.book.1");
    }

    #[test]
    fn object_with_extra_keys_is_primitive() {
        let value = Value::from_json(&json!({"rid": "library.book.1", "x": 1}));
        assert!(value.reference().is_none());
    }

    #[test]
    fn parses_delete_marker() {
        assert!(Value::from_json(&json!({"action": "delete"})).is_delete());
    }

    #[test]
    fn invalid_rid_stays_primitive() {
        let value = Value::from_json(&json!({"rid": "not a rid"}));
        assert!(matches!(value, Value::Primitive(_)));
    }

    #[test]
    fn model_round_trips_to_json() {
        let json = json!({"title": "Dune", "author": {"rid": "library.author.1"}});
        let model = Model::from_json(json.as_object().unwrap());
        assert_eq!(model.to_json(), json);
    }

    #[test]
    fn collection_mutation() {
        let mut collection = Collection::from_json(&[json!("a"), json!("b")]);
        collection.insert(1, Value::Primitive(json!("x")));
        assert_eq!(collection.to_json(), json!(["a", "x", "b"]));
        let removed = collection.remove(0);
        assert_eq!(removed, Value::Primitive(json!("a")));
    }
}
