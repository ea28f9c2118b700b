//! Accounting of native object creation and release.
//!
//! Every native program, kernel and memory object reports into the ledger of
//! the context that created it, once when it is created and once when its
//! handle is released. Teardown checks compare the two counts.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Kind of native object tracked by a [`ReleaseLedger`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Program,
    Kernel,
    Memory,
}

impl ResourceKind {
    const ALL: [ResourceKind; 3] = [ResourceKind::Program, ResourceKind::Kernel, ResourceKind::Memory];

    fn slot(self) -> usize {
        match self {
            ResourceKind::Program => 0,
            ResourceKind::Kernel => 1,
            ResourceKind::Memory => 2,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Program => write!(f, "program"),
            ResourceKind::Kernel => write!(f, "kernel"),
            ResourceKind::Memory => write!(f, "memory object"),
        }
    }
}

/// Created/released counters per resource kind.
#[derive(Debug, Default)]
pub struct ReleaseLedger {
    created: [AtomicUsize; 3],
    released: [AtomicUsize; 3],
}

impl ReleaseLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_created(&self, kind: ResourceKind) {
        self.created[kind.slot()].fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_released(&self, kind: ResourceKind) {
        let released = self.released[kind.slot()].fetch_add(1, Ordering::SeqCst) + 1;
        debug_assert!(
            released <= self.created(kind),
            "{} released more often than created",
            kind
        );
    }

    /// Number of native objects of this kind created so far.
    pub fn created(&self, kind: ResourceKind) -> usize {
        self.created[kind.slot()].load(Ordering::SeqCst)
    }

    /// Number of native objects of this kind released so far.
    pub fn released(&self, kind: ResourceKind) -> usize {
        self.released[kind.slot()].load(Ordering::SeqCst)
    }

    /// Objects of this kind still holding a native handle.
    pub fn outstanding(&self, kind: ResourceKind) -> usize {
        self.created(kind).saturating_sub(self.released(kind))
    }

    /// True when every created object has been released exactly once.
    pub fn is_balanced(&self) -> bool {
        ResourceKind::ALL
            .iter()
            .all(|&kind| self.created(kind) == self.released(kind))
    }
}

impl fmt::Display for ReleaseLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = ResourceKind::ALL
            .iter()
            .map(|&kind| format!("{}s {}/{}", kind, self.released(kind), self.created(kind)))
            .collect();
        write!(f, "released {}", parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_per_kind() {
        let ledger = ReleaseLedger::new();
        ledger.record_created(ResourceKind::Memory);
        ledger.record_created(ResourceKind::Memory);
        ledger.record_created(ResourceKind::Kernel);
        assert_eq!(ledger.outstanding(ResourceKind::Memory), 2);
        assert_eq!(ledger.outstanding(ResourceKind::Kernel), 1);
        assert_eq!(ledger.outstanding(ResourceKind::Program), 0);
        assert!(!ledger.is_balanced());

        ledger.record_released(ResourceKind::Memory);
        ledger.record_released(ResourceKind::Memory);
        ledger.record_released(ResourceKind::Kernel);
        assert!(ledger.is_balanced());
        assert_eq!(ledger.released(ResourceKind::Memory), 2);
    }

    #[test]
    fn test_display() {
        let ledger = ReleaseLedger::new();
        ledger.record_created(ResourceKind::Program);
        assert_eq!(
            ledger.to_string(),
            "released programs 0/1, kernels 0/0, memory objects 0/0"
        );
    }
}
