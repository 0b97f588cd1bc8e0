//! Target reconciliation
//!
//! The [`Reconciler`] owns the map of active collectors, keyed by target
//! address. Each call to [`Reconciler::reconcile`] diffs a freshly loaded
//! desired-target list against that map and applies the minimal set of
//! changes through a [`RegistryAdapter`]:
//!
//! 1. malformed descriptors are skipped and duplicates collapse to the last
//!    occurrence of each address;
//! 2. new addresses are added, addresses whose kind or name changed are
//!    replaced, unchanged ones are left alone;
//! 3. active addresses missing from the desired list are removed.
//!
//! The whole pass runs under one lock. A replaced collector is always
//! deregistered before its successor is registered, so the registry never
//! holds two collectors for one address.
//!
//! The first instantiation or registration failure aborts the pass. Changes
//! applied before the failure stay applied, later entries are not attempted
//! and stale entries are left for the next pass. A replacement that cannot be
//! registered puts the previous collector back.
//!
//! [`Reconciler::snapshot`] and friends read a copy published at the end of
//! each pass, so they never wait for a pass in progress.

use crate::adapter::{AdapterError, RegistryAdapter};
use crate::target::{Target, TargetKind};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("failed to create {kind} collector for {address}: {source}")]
    Instantiate {
        address: String,
        kind: TargetKind,
        #[source]
        source: AdapterError,
    },
    #[error("failed to register {kind} collector for {address}: {source}")]
    Register {
        address: String,
        kind: TargetKind,
        #[source]
        source: AdapterError,
    },
}

impl ReconcileError {
    /// Address of the target that could not be activated
    pub fn address(&self) -> &str {
        match self {
            ReconcileError::Instantiate { address, .. } | ReconcileError::Register { address, .. } => {
                address
            }
        }
    }
}

/// A live collector and the descriptor that produced it
#[derive(Debug)]
pub struct ActiveCollector<H> {
    pub address: String,
    pub name: String,
    pub kind: TargetKind,
    pub handle: H,
}

/// Public view of an active collector
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetStatus {
    pub address: String,
    pub name: String,
    pub kind: TargetKind,
}

/// What one reconciliation pass changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub added: usize,
    pub replaced: usize,
    pub removed: usize,
    pub unchanged: usize,
    pub skipped: usize,
}

impl ReconcileReport {
    /// Whether the pass touched the registry at all
    pub fn changed(&self) -> bool {
        self.added + self.replaced + self.removed > 0
    }
}

enum Change {
    Add,
    Replace,
    Keep,
}

/// Owner of the active collector set
pub struct Reconciler<A: RegistryAdapter> {
    adapter: A,
    active: Mutex<HashMap<String, ActiveCollector<A::Handle>>>,
    // View of `active` as of the end of the last pass. Readers never wait for
    // a pass in progress, which can block on the registry.
    published: RwLock<Vec<TargetStatus>>,
}

impl<A: RegistryAdapter> Reconciler<A> {
    /// Create a reconciler with no active collectors
    pub fn new(adapter: A) -> Self {
        Self {
            adapter,
            active: Mutex::new(HashMap::new()),
            published: RwLock::new(Vec::new()),
        }
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ActiveCollector<A::Handle>>> {
        // The map is only mutated between adapter calls, so a guard poisoned by
        // a panicking adapter still holds a consistent map
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Bring the active collector set in line with `desired`
    pub fn reconcile(&self, desired: &[Target]) -> Result<ReconcileReport, ReconcileError> {
        let mut active = self.lock();
        let result = self.run_pass(&mut active, desired);
        self.publish(&active);
        result
    }

    fn run_pass(
        &self,
        active: &mut HashMap<String, ActiveCollector<A::Handle>>,
        desired: &[Target],
    ) -> Result<ReconcileReport, ReconcileError> {
        let mut report = ReconcileReport::default();

        // Validate & index
        let mut valid: Vec<&Target> = Vec::with_capacity(desired.len());
        for target in desired {
            match target.validate() {
                Ok(()) => valid.push(target),
                Err(e) => {
                    warn!("{}, ignore it", e);
                    report.skipped += 1;
                }
            }
        }

        let mut last_seen: HashMap<&str, usize> = HashMap::with_capacity(valid.len());
        for (i, target) in valid.iter().enumerate() {
            last_seen.insert(target.address.as_str(), i);
        }
        if last_seen.len() < valid.len() {
            debug!(
                "{} duplicate target address(es), last entry wins",
                valid.len() - last_seen.len()
            );
        }

        // Add / replace
        for (i, target) in valid.iter().enumerate() {
            if last_seen.get(target.address.as_str()) != Some(&i) {
                continue;
            }
            self.apply(active, target, &mut report)?;
        }

        // Remove stale
        let stale: Vec<String> = active
            .keys()
            .filter(|address| !last_seen.contains_key(address.as_str()))
            .cloned()
            .collect();
        for address in stale {
            if let Some(entry) = active.remove(&address) {
                self.adapter.deregister(&entry.handle);
                info!("del exporter {} {}", entry.address, entry.name);
                report.removed += 1;
            }
        }

        Ok(report)
    }

    fn apply(
        &self,
        active: &mut HashMap<String, ActiveCollector<A::Handle>>,
        target: &Target,
        report: &mut ReconcileReport,
    ) -> Result<(), ReconcileError> {
        let change = match active.get(&target.address) {
            None => Change::Add,
            Some(entry) if target.same_identity(entry.kind, &entry.name) => Change::Keep,
            Some(_) => Change::Replace,
        };

        match change {
            Change::Keep => {
                report.unchanged += 1;
            }
            Change::Add => {
                let handle = self.instantiate(target)?;
                let entry = self.activate(target, handle)?;
                active.insert(target.address.clone(), entry);
                info!("add {} exporter {} {}", target.kind, target.address, target.name);
                report.added += 1;
            }
            Change::Replace => {
                // Nothing touches the registry until the replacement exists
                let handle = self.instantiate(target)?;

                let old = active.remove(&target.address);
                if let Some(old) = &old {
                    self.adapter.deregister(&old.handle);
                    info!("del exporter {} {}", old.address, old.name);
                }

                let entry = match self.activate(target, handle) {
                    Ok(entry) => entry,
                    Err(e) => {
                        if let Some(old) = old {
                            self.restore(active, old);
                        }
                        return Err(e);
                    }
                };
                active.insert(target.address.clone(), entry);
                info!("add {} exporter {} {}", target.kind, target.address, target.name);
                report.replaced += 1;
            }
        }

        Ok(())
    }

    /// Put back a collector whose replacement could not be registered
    fn restore(
        &self,
        active: &mut HashMap<String, ActiveCollector<A::Handle>>,
        old: ActiveCollector<A::Handle>,
    ) {
        match self.adapter.register(&old.handle) {
            Ok(()) => {
                info!("restored exporter {} {}", old.address, old.name);
                active.insert(old.address.clone(), old);
            }
            Err(e) => {
                warn!(
                    "failed to restore exporter {} {}: {}",
                    old.address, old.name, e
                );
            }
        }
    }

    fn instantiate(&self, target: &Target) -> Result<A::Handle, ReconcileError> {
        self.adapter
            .instantiate(target)
            .map_err(|source| ReconcileError::Instantiate {
                address: target.address.clone(),
                kind: target.kind,
                source,
            })
    }

    fn activate(
        &self,
        target: &Target,
        handle: A::Handle,
    ) -> Result<ActiveCollector<A::Handle>, ReconcileError> {
        self.adapter
            .register(&handle)
            .map_err(|source| ReconcileError::Register {
                address: target.address.clone(),
                kind: target.kind,
                source,
            })?;

        Ok(ActiveCollector {
            address: target.address.clone(),
            name: target.name.clone(),
            kind: target.kind,
            handle,
        })
    }

    fn publish(&self, active: &HashMap<String, ActiveCollector<A::Handle>>) {
        let mut targets: Vec<TargetStatus> = active
            .values()
            .map(|entry| TargetStatus {
                address: entry.address.clone(),
                name: entry.name.clone(),
                kind: entry.kind,
            })
            .collect();
        targets.sort_by(|a, b| a.address.cmp(&b.address));

        match self.published.write() {
            Ok(mut guard) => *guard = targets,
            Err(poisoned) => *poisoned.into_inner() = targets,
        }
    }

    fn read_published<T>(&self, f: impl FnOnce(&[TargetStatus]) -> T) -> T {
        match self.published.read() {
            Ok(guard) => f(&guard),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }

    /// Active collectors sorted by address, as of the last finished pass
    pub fn snapshot(&self) -> Vec<TargetStatus> {
        self.read_published(|targets| targets.to_vec())
    }

    pub fn contains(&self, address: &str) -> bool {
        self.read_published(|targets| targets.iter().any(|t| t.address == address))
    }

    pub fn len(&self) -> usize {
        self.read_published(|targets| targets.len())
    }

    pub fn is_empty(&self) -> bool {
        self.read_published(|targets| targets.is_empty())
    }
}

impl<A> Reconciler<A>
where
    A: RegistryAdapter,
    A::Handle: Clone,
{
    /// Clones of every active collector handle
    pub fn handles(&self) -> Vec<A::Handle> {
        self.lock().values().map(|entry| entry.handle.clone()).collect()
    }
}
