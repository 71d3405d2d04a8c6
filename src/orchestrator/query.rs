//! Query replies and their JSON rendering.

use serde_json::{Map, Value};

/// One answer line of an interactive query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryValue {
    /// A single `key=value` pair.
    Scalar(String, String),
    /// Several pairs from one reply line.
    List(Vec<(String, String)>),
}

impl QueryValue {
    /// Decompose `key=value[,key2=value2...]`. Pairs without a key are
    /// dropped; a pair without `=` gets an empty value.
    pub fn parse(line: &str) -> Option<Self> {
        let mut pairs: Vec<(String, String)> = line
            .split(',')
            .map(|item| match item.split_once('=') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (item.to_string(), String::new()),
            })
            .filter(|(k, _)| !k.is_empty())
            .collect();
        match pairs.len() {
            0 => None,
            1 => pairs.pop().map(|(k, v)| QueryValue::Scalar(k, v)),
            _ => Some(QueryValue::List(pairs)),
        }
    }

    /// JSON form: `{key: value}` for a scalar, `{parameter: [{key: value}, ...]}`
    /// for a list.
    pub fn to_json(&self, parameter: &str) -> Value {
        fn pair(k: &str, v: &str) -> Value {
            let mut map = Map::new();
            map.insert(k.to_string(), Value::String(v.to_string()));
            Value::Object(map)
        }
        match self {
            QueryValue::Scalar(k, v) => pair(k, v),
            QueryValue::List(pairs) => {
                let items = pairs.iter().map(|(k, v)| pair(k, v)).collect();
                let mut map = Map::new();
                map.insert(parameter.to_string(), Value::Array(items));
                Value::Object(map)
            }
        }
    }
}
