//! Parameter store interface — the tree of named keys behind the RPC.
//!
//! The transport never interprets keys or values; it forwards them between
//! the RPC layer and whatever implements [`ParamStore`]. The schema is an
//! opaque document shipped to clients compressed.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::rpc::ParamValue;

/// The schema document describing the parameter tree: an opaque string plus
/// a stable identifier clients can cache against.
#[derive(Debug, Clone)]
pub struct SchemaData {
    pub data: String,
    pub id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ParamError {
    #[error("parameter rejected: {0}")]
    Rejected(String),
}

/// Get/set/schema over a tree of named keys.
///
/// Implementations decide which keys exist and which values are legal; a
/// rejected set fails the whole call. Reads of unset keys yield
/// [`ParamValue::Null`].
pub trait ParamStore: Send + Sync {
    fn schema(&self) -> SchemaData;

    fn set(&self, params: &[(String, ParamValue)]) -> Result<(), ParamError>;

    fn get(&self, names: &[String]) -> Result<Vec<ParamValue>, ParamError>;
}

/// In-memory parameter store.
///
/// Accepts any key and keeps values in a hash map. Used by the daemon when
/// no device backend is wired in, and by the test harnesses.
pub struct MemoryStore {
    schema: SchemaData,
    values: RwLock<HashMap<String, ParamValue>>,
}

impl MemoryStore {
    pub fn new(schema_data: &str, schema_id: &str) -> Self {
        Self {
            schema: SchemaData { data: schema_data.to_owned(), id: schema_id.to_owned() },
            values: RwLock::new(HashMap::new()),
        }
    }
}

impl ParamStore for MemoryStore {
    fn schema(&self) -> SchemaData {
        self.schema.clone()
    }

    fn set(&self, params: &[(String, ParamValue)]) -> Result<(), ParamError> {
        let mut values = self.values.write().expect("param store lock poisoned");
        for (name, value) in params {
            values.insert(name.clone(), value.clone());
        }
        Ok(())
    }

    fn get(&self, names: &[String]) -> Result<Vec<ParamValue>, ParamError> {
        let values = self.values.read().expect("param store lock poisoned");
        Ok(names
            .iter()
            .map(|name| values.get(name).cloned().unwrap_or(ParamValue::Null))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_keys_read_as_null() {
        let store = MemoryStore::new("<schema/>", "test");
        let values = store.get(&["missing".into()]).unwrap();
        assert_eq!(values, vec![ParamValue::Null]);
    }

    #[test]
    fn set_then_get_round_trips() {
        let store = MemoryStore::new("<schema/>", "test");
        store
            .set(&[
                ("gain".into(), ParamValue::F64(12.5)),
                ("enabled".into(), ParamValue::Bool(true)),
            ])
            .unwrap();

        let values = store.get(&["enabled".into(), "gain".into()]).unwrap();
        assert_eq!(values, vec![ParamValue::Bool(true), ParamValue::F64(12.5)]);
    }
}
