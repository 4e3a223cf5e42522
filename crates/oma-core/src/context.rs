//! Run-scoped shared context and the process-wide store that indexes it.
//!
//! Every pipeline run owns one [`OmaContext`]. Steps read their inputs from it
//! and leave their outputs in it; remote tools may also write into it while a
//! backend is running.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::OmaError;

/// Key/value data shared between the steps of one pipeline run.
///
/// Clones share the same storage.
#[derive(Clone, Debug)]
pub struct OmaContext {
    run_id: Arc<str>,
    data: Arc<DashMap<String, Value>>,
}

impl Default for OmaContext {
    fn default() -> Self {
        Self::new()
    }
}

impl OmaContext {
    pub fn new() -> Self {
        Self::with_run_id(format!("run-{}", Uuid::new_v4()))
    }

    pub fn with_run_id(run_id: impl Into<String>) -> Self {
        let run_id: String = run_id.into();
        Self {
            run_id: Arc::from(run_id),
            data: Arc::new(DashMap::new()),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Typed read; `None` when the key is absent or does not deserialize into `T`.
    pub fn get_shared_data<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.data.get(key)?.value().clone();
        match serde_json::from_value(value) {
            Ok(typed) => Some(typed),
            Err(err) => {
                debug!(key, error = %err, "context value has unexpected shape");
                None
            }
        }
    }

    pub fn get_shared_data_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get_shared_data(key).unwrap_or(default)
    }

    pub fn get_value(&self, key: &str) -> Option<Value> {
        self.data.get(key).map(|entry| entry.value().clone())
    }

    /// Read a key that a step cannot run without.
    pub fn require(&self, key: &str, agent_id: &str) -> Result<Value, OmaError> {
        self.get_value(key).ok_or_else(|| OmaError::MissingInput {
            key: key.to_string(),
            agent_id: agent_id.to_string(),
        })
    }

    pub fn set_shared_data(&self, key: impl Into<String>, value: impl Serialize) {
        let key = key.into();
        match serde_json::to_value(value) {
            Ok(value) => {
                debug!(run_id = %self.run_id, key = %key, "context updated");
                self.data.insert(key, value);
            }
            Err(err) => warn!(key = %key, error = %err, "refusing to store unserializable value"),
        }
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.data.remove(key).map(|(_, value)| value)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.data.iter().map(|entry| entry.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Ordered copy of the whole context, suitable for persisting.
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.data
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Capture the current state of `keys`, including their absence, plus the
    /// set of keys present right now.
    pub fn snapshot_keys<'a, I>(&self, keys: I) -> KeySnapshot
    where
        I: IntoIterator<Item = &'a str>,
    {
        KeySnapshot {
            entries: keys
                .into_iter()
                .map(|key| (key.to_string(), self.get_value(key)))
                .collect(),
            present: self.data.iter().map(|entry| entry.key().clone()).collect(),
        }
    }

    /// Put the captured keys back exactly as they were when `snapshot` was
    /// taken and drop every key written for the first time since then.
    pub fn restore(&self, snapshot: KeySnapshot) {
        self.data.retain(|key, _| snapshot.present.contains(key));
        for (key, previous) in snapshot.entries {
            match previous {
                Some(value) => {
                    self.data.insert(key, value);
                }
                None => {
                    self.data.remove(&key);
                }
            }
        }
    }
}

/// Saved state of a set of context keys.
#[derive(Debug, Clone, Default)]
pub struct KeySnapshot {
    entries: Vec<(String, Option<Value>)>,
    present: BTreeSet<String>,
}

impl KeySnapshot {
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(key, _)| key.as_str())
    }
}

static GLOBAL_STORE: Lazy<ContextStore> = Lazy::new(ContextStore::new);

/// Process-wide index of live run contexts, keyed by run id.
#[derive(Default)]
pub struct ContextStore {
    runs: DashMap<String, OmaContext>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global() -> &'static ContextStore {
        &GLOBAL_STORE
    }

    /// Return the context for `run_id`, creating it on first use.
    pub fn open(&self, run_id: &str) -> OmaContext {
        self.runs
            .entry(run_id.to_string())
            .or_insert_with(|| OmaContext::with_run_id(run_id))
            .value()
            .clone()
    }

    pub fn get(&self, run_id: &str) -> Option<OmaContext> {
        self.runs.get(run_id).map(|entry| entry.value().clone())
    }

    /// Drop a finished run. Returns its context so the caller can persist it.
    pub fn discard(&self, run_id: &str) -> Option<OmaContext> {
        self.runs.remove(run_id).map(|(_, ctx)| ctx)
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn writes_are_visible_to_clones() {
        let ctx = OmaContext::new();
        let other = ctx.clone();
        ctx.set_shared_data("file_id", "F1");
        assert_eq!(other.get_shared_data::<String>("file_id").as_deref(), Some("F1"));
        assert_eq!(other.get_shared_data_or("missing", 7_u32), 7);
    }

    #[test]
    fn require_names_key_and_agent() {
        let ctx = OmaContext::new();
        let err = ctx.require("structured_content_overview_id", "analysis").unwrap_err();
        match err {
            OmaError::MissingInput { key, agent_id } => {
                assert_eq!(key, "structured_content_overview_id");
                assert_eq!(agent_id, "analysis");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn restore_reverts_added_and_changed_keys() {
        let ctx = OmaContext::new();
        ctx.set_shared_data("kept", json!({"a": 1}));
        let snapshot = ctx.snapshot_keys(["kept", "fresh"]);

        ctx.set_shared_data("kept", json!({"a": 2}));
        ctx.set_shared_data("fresh", "new");
        ctx.set_shared_data("stray", true);
        ctx.restore(snapshot);

        assert_eq!(ctx.get_value("kept"), Some(json!({"a": 1})));
        assert!(!ctx.contains("fresh"));
        assert!(!ctx.contains("stray"));
        assert_eq!(ctx.keys(), vec!["kept"]);
    }

    #[test]
    fn typed_read_of_wrong_shape_is_none() {
        let ctx = OmaContext::new();
        ctx.set_shared_data("count", "not a number");
        assert_eq!(ctx.get_shared_data::<u64>("count"), None);
    }

    #[test]
    fn store_hands_out_shared_contexts() {
        let store = ContextStore::new();
        let first = store.open("run-a");
        first.set_shared_data("file_id", "F1");

        let again = store.open("run-a");
        assert_eq!(again.run_id(), "run-a");
        assert!(again.contains("file_id"));
        assert!(store.open("run-b").is_empty());
        assert_eq!(store.len(), 2);

        let discarded = store.discard("run-a").expect("run exists");
        assert!(discarded.contains("file_id"));
        assert!(store.get("run-a").is_none());
    }
}
