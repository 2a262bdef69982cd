//! Result references and the worker-local result table.
//!
//! A value produced by a plugin stays resident in the worker that
//! produced it; only a lightweight `ResultRef` handle crosses the
//! process boundary. Resolution back into the concrete value is an
//! explicit `Read` exchange, never a transparent proxy.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Opaque, copyable handle to a value held in some worker's result
/// table. Serializes with a distinguishing field name so the worker can
/// recognize reference-shaped arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResultRef {
    #[serde(rename = "__result_ref__")]
    pub id: Uuid,
}

impl ResultRef {
    pub const fn new(id: Uuid) -> Self {
        Self { id }
    }

    /// Recognize a reference-shaped JSON value.
    ///
    /// Anything that is not exactly `{"__result_ref__": <uuid>}` is not
    /// a reference and must be treated as a literal argument.
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    /// The wire form of this reference.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Worker-local store mapping reference ids to produced values.
///
/// Created empty when the worker starts, populated only by the
/// plugin-start handler, read by `Read` handling and argument
/// resolution. Entries are never evicted; they live until the worker
/// process exits, which is also the only teardown.
#[derive(Debug, Default)]
pub struct ResultTable {
    entries: HashMap<Uuid, Value>,
}

impl ResultTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a produced value under a fresh id and hand back the
    /// reference for it.
    pub fn insert(&mut self, value: Value) -> ResultRef {
        let id = Uuid::new_v4();
        self.entries.insert(id, value);
        ResultRef::new(id)
    }

    /// Look up the value for a reference id.
    pub fn get(&self, id: Uuid) -> Option<&Value> {
        self.entries.get(&id)
    }

    /// Resolve one argument: a known reference becomes its stored
    /// value; an unknown reference or any non-reference value passes
    /// through as the literal it is. Cache misses never fail — the
    /// argument may simply be data that happens to look like nothing
    /// special.
    pub fn resolve(&self, arg: &Value) -> Value {
        match ResultRef::from_value(arg).and_then(|r| self.get(r.id)) {
            Some(stored) => stored.clone(),
            None => arg.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
