use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use scim_kernel::{chain_digest, Attributes, ContextLookup, ServiceFlow};

pub type ContextSnapshot = BTreeMap<String, Attributes>;
pub type ChainSnapshot = BTreeMap<String, Vec<ServiceFlow>>;

/// Per-principal attribute maps. Entries are replaced copy-on-write, so a
/// reader holding an entry never sees a partial update.
#[derive(Debug, Default)]
pub struct ContextStore {
    entries: DashMap<String, Arc<Attributes>>,
}

impl ContextStore {
    pub fn from_snapshot(snapshot: ContextSnapshot) -> Self {
        let entries = DashMap::with_capacity(snapshot.len());
        for (principal, attributes) in snapshot {
            entries.insert(principal, Arc::new(attributes));
        }
        Self { entries }
    }

    pub fn get(&self, principal: &str) -> Option<Arc<Attributes>> {
        self.entries.get(principal).map(|e| Arc::clone(e.value()))
    }

    pub fn for_principal(&self, principal: &str) -> PrincipalContext {
        PrincipalContext {
            principal: principal.to_string(),
            attributes: self.get(principal),
        }
    }

    /// Sets one attribute; returns whether the stored value changed.
    pub fn set(&self, principal: &str, name: String, value: String) -> bool {
        let mut entry = self.entries.entry(principal.to_string()).or_default();
        if entry.get(&name) == Some(&value) {
            return false;
        }
        Arc::make_mut(entry.value_mut()).insert(name, value);
        true
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.value().as_ref().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Attributes of a single principal, captured once per evaluation.
#[derive(Debug, Clone)]
pub struct PrincipalContext {
    principal: String,
    attributes: Option<Arc<Attributes>>,
}

impl ContextLookup for PrincipalContext {
    fn attribute(&self, principal: &str, name: &str) -> Option<&str> {
        if principal != self.principal {
            return None;
        }
        self.attributes
            .as_ref()?
            .get(name)
            .map(|v| v.as_str())
    }
}

pub type Chain = Arc<Vec<Arc<ServiceFlow>>>;

/// Ordered service flows per principal.
#[derive(Debug, Default)]
pub struct ChainStore {
    entries: DashMap<String, Chain>,
}

impl ChainStore {
    pub fn from_snapshot(snapshot: ChainSnapshot) -> Self {
        let entries = DashMap::with_capacity(snapshot.len());
        for (principal, flows) in snapshot {
            entries.insert(principal, Arc::new(flows.into_iter().map(Arc::new).collect()));
        }
        Self { entries }
    }

    pub fn get(&self, principal: &str) -> Chain {
        self.entries
            .get(principal)
            .map(|e| Arc::clone(e.value()))
            .unwrap_or_default()
    }

    /// Replaces the principal's whole list. An identical list (same canonical
    /// digest) leaves the stored graphs untouched and returns `false`.
    pub fn replace(&self, principal: &str, flows: Vec<ServiceFlow>) -> bool {
        if flows.is_empty() {
            return self
                .entries
                .remove(principal)
                .map(|(_, old)| !old.is_empty())
                .unwrap_or(false);
        }
        let incoming = chain_digest(&flows).ok();
        let mut entry = self.entries.entry(principal.to_string()).or_default();
        if incoming.is_some() && chain_digest(entry.iter().map(|f| f.as_ref())).ok() == incoming {
            return false;
        }
        *entry.value_mut() = Arc::new(flows.into_iter().map(Arc::new).collect());
        true
    }

    pub fn snapshot(&self) -> ChainSnapshot {
        self.entries
            .iter()
            .map(|e| {
                (
                    e.key().clone(),
                    e.value().iter().map(|f| f.as_ref().clone()).collect(),
                )
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
