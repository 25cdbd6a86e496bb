use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use tracing::debug;

/// Maps each member's Raft address to its client-facing HTTP address.
///
/// Written by the reconciler and the join paths, read by every forwarded
/// request. Only used to build forwarding URLs; cluster membership itself is
/// owned by the consensus engine.
#[derive(Debug, Default)]
pub struct ClientDirectory {
    entries: RwLock<HashMap<String, String>>,
}

impl ClientDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, raft_addr: &str, http_addr: &str) {
        let previous = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(raft_addr.to_string(), http_addr.to_string());
        if previous.as_deref() != Some(http_addr) {
            debug!(raft_addr, http_addr, "client directory updated");
        }
    }

    pub fn resolve(&self, raft_addr: &str) -> Option<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(raft_addr)
            .cloned()
    }

    /// Ordered copy for status output.
    pub fn entries(&self) -> BTreeMap<String, String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
