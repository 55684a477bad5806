use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Search parameters of a profile, handed to its source unchanged.
///
/// Each source picks the keys it understands; the accessors are lenient
/// about numbers arriving as strings since profile files are hand-written.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SearchParams(Map<String, Value>);

impl SearchParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.get(key).map_or(false, |v| !v.is_null())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key).filter(|v| !v.is_null())
    }

    pub fn f64(&self, key: &str) -> Option<f64> {
        match self.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().replace(',', ".").parse().ok(),
            _ => None,
        }
    }

    pub fn str(&self, key: &str) -> Option<&str> {
        self.get(key)?.as_str()
    }

    /// Value rendered the way it should appear in a query string
    pub fn query_value(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn bool(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => s.trim().to_lowercase().parse().ok(),
            _ => None,
        }
    }

    pub fn str_list(&self, key: &str) -> Vec<String> {
        match self.get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect(),
            Some(Value::String(s)) => vec![s.clone()],
            _ => Vec::new(),
        }
    }

    pub fn f64_list(&self, key: &str) -> Vec<f64> {
        match self.get(key) {
            Some(Value::Array(items)) => items.iter().filter_map(Value::as_f64).collect(),
            _ => Vec::new(),
        }
    }
}
