//! Node registry — who registered for the current epoch.
//!
//! The map and both registration gates live behind one reader/writer lock.
//! Registration and gate closing take it exclusively, so a registration
//! either lands before the gate closes (and is in the next snapshot) or is
//! rejected. Snapshot construction takes it shared.
//!
//! `EpochDirectory` owns the current registry and swaps in a fresh one at
//! each epoch rotation.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::RwLock;

use pki_core::wire::{snapshot_line, SnapshotKind};
use pki_core::{Category, Endpoint, RegistrationStatus};

#[derive(Debug)]
struct RegistryState {
    nodes: HashMap<String, Endpoint>,
    accept_mixes: bool,
    accept_clients: bool,
}

impl RegistryState {
    fn gate(&self, category: Category) -> bool {
        match category {
            Category::Mix => self.accept_mixes,
            Category::Client => self.accept_clients,
        }
    }
}

/// Where a broadcast must go, copied out of the registry so no lock is
/// held while dialing.
#[derive(Debug, Clone)]
pub struct ContactTarget {
    pub name: String,
    pub contact_addr: String,
    pub contact_cert_pem: Vec<u8>,
}

/// A consistent view taken under the shared lock.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Payload line, without the trailing newline.
    pub line: String,
    /// Every registered node, regardless of category.
    pub targets: Vec<ContactTarget>,
}

/// Registrations for one epoch.
#[derive(Debug)]
pub struct NodeRegistry {
    state: RwLock<RegistryState>,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeRegistry {
    /// Empty registry with both gates open.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RegistryState {
                nodes: HashMap::new(),
                accept_mixes: true,
                accept_clients: true,
            }),
        }
    }

    /// Insert or overwrite `endpoint` if its category's gate is open.
    pub async fn register(&self, endpoint: Endpoint) -> RegistrationStatus {
        let mut state = self.state.write().await;
        if !state.gate(endpoint.category) {
            return RegistrationStatus::NotAccepting;
        }
        state.nodes.insert(endpoint.name.clone(), endpoint);
        RegistrationStatus::Accepted
    }

    /// Stop accepting registrations of `category`.
    pub async fn close(&self, category: Category) {
        let mut state = self.state.write().await;
        match category {
            Category::Mix => state.accept_mixes = false,
            Category::Client => state.accept_clients = false,
        }
    }

    /// Close both gates. Used when this registry is being replaced.
    pub async fn retire(&self) {
        let mut state = self.state.write().await;
        state.accept_mixes = false;
        state.accept_clients = false;
    }

    pub async fn is_accepting(&self, category: Category) -> bool {
        self.state.read().await.gate(category)
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.nodes.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.nodes.is_empty()
    }

    pub async fn get(&self, name: &str) -> Option<Endpoint> {
        self.state.read().await.nodes.get(name).cloned()
    }

    /// Number of registered nodes of one category.
    pub async fn count(&self, category: Category) -> usize {
        self.state
            .read()
            .await
            .nodes
            .values()
            .filter(|ep| ep.category == category)
            .count()
    }

    /// Build the broadcast line for `kind` and the list of every node to
    /// send it to. Nodes are listed sorted by name.
    pub async fn snapshot(&self, kind: SnapshotKind) -> Snapshot {
        let state = self.state.read().await;

        let mut nodes: Vec<&Endpoint> = state.nodes.values().collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));

        let line = snapshot_line(kind, nodes.iter().copied());
        let targets = nodes
            .iter()
            .map(|ep| ContactTarget {
                name: ep.name.clone(),
                contact_addr: ep.contact_addr.clone(),
                contact_cert_pem: ep.contact_cert_pem.clone(),
            })
            .collect();

        Snapshot { line, targets }
    }
}

// ── Epoch directory ───────────────────────────────────────────────────────────

/// Holder of the current epoch's registry, shared by the listener and the
/// scheduler.
#[derive(Debug)]
pub struct EpochDirectory {
    current: ArcSwap<NodeRegistry>,
}

/// Shared handle to the directory.
pub type SharedDirectory = Arc<EpochDirectory>;

impl Default for EpochDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl EpochDirectory {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(NodeRegistry::new()),
        }
    }

    pub fn shared() -> SharedDirectory {
        Arc::new(Self::new())
    }

    /// The registry of the running epoch.
    pub fn current(&self) -> Arc<NodeRegistry> {
        self.current.load_full()
    }

    /// Replace the registry with an empty one, gates open.
    ///
    /// The old registry is retired first, so a registration racing the
    /// swap is answered with `NotAccepting` instead of being stored in a
    /// map nobody reads again.
    pub async fn rotate(&self) -> Arc<NodeRegistry> {
        let old = self.current();
        old.retire().await;
        self.current.store(Arc::new(NodeRegistry::new()));
        old
    }
}
