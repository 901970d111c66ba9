//! Reconciles freshly extracted records against the catalog's prior state.
//!
//! Matching is by identity `(file_path, layer_name)` only. A match inherits
//! the prior management fields; everything else comes from the new
//! extraction. Prior identities that the scan never produced are retired.
//! In fresh mode nothing is matched and nothing is retired.

use std::collections::{HashMap, HashSet};

use crate::record::{Identity, InventoryRecord, ManagementFields};

/// How a record was classified against the prior catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// First sighting; management fields start at their defaults.
    New,
    /// Known identity; prior management fields were carried forward.
    Preserved,
    /// The identity was already produced earlier in this scan. The record
    /// must not be written.
    Duplicate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffCounts {
    pub new: usize,
    pub preserved: usize,
    pub duplicates: usize,
}

pub struct CatalogDiffEngine {
    prior: HashMap<Identity, ManagementFields>,
    update_mode: bool,
    seen: HashSet<Identity>,
    counts: DiffCounts,
}

impl CatalogDiffEngine {
    /// Update-mode engine over the prior active records' management fields.
    pub fn new(prior: HashMap<Identity, ManagementFields>) -> Self {
        Self {
            prior,
            update_mode: true,
            seen: HashSet::new(),
            counts: DiffCounts::default(),
        }
    }

    /// Fresh-mode engine: every record is new and nothing is retired.
    pub fn fresh() -> Self {
        Self {
            prior: HashMap::new(),
            update_mode: false,
            seen: HashSet::new(),
            counts: DiffCounts::default(),
        }
    }

    pub fn is_update_mode(&self) -> bool {
        self.update_mode
    }

    /// Sets the record's management fields from the prior catalog, or
    /// resets them for a new identity.
    pub fn reconcile(&mut self, record: &mut InventoryRecord) -> Reconciled {
        if !self.seen.insert(record.identity.clone()) {
            self.counts.duplicates += 1;
            return Reconciled::Duplicate;
        }

        match self.prior.get(&record.identity) {
            Some(management) if self.update_mode => {
                record.management = management.clone();
                self.counts.preserved += 1;
                Reconciled::Preserved
            }
            _ => {
                record.management = ManagementFields::default();
                self.counts.new += 1;
                Reconciled::New
            }
        }
    }

    /// Identities produced by this scan so far.
    pub fn seen(&self) -> &HashSet<Identity> {
        &self.seen
    }

    /// Prior identities this scan did not produce, in a stable order.
    pub fn retirements(&self) -> Vec<Identity> {
        if !self.update_mode {
            return Vec::new();
        }
        let mut missing: Vec<Identity> = self
            .prior
            .keys()
            .filter(|id| !self.seen.contains(*id))
            .cloned()
            .collect();
        missing.sort_by(|a, b| {
            a.file_path
                .cmp(&b.file_path)
                .then_with(|| a.layer_name.cmp(&b.layer_name))
        });
        missing
    }

    pub fn counts(&self) -> DiffCounts {
        self.counts
    }
}
