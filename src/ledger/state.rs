use std::collections::HashMap;

use super::LedgerError;
use crate::balance::Balances;
use crate::model::{EntryId, EntryStatus, LedgerEntry, Metadata};

/// One account's entries in append order, with its running balances.
#[derive(Debug, Default)]
pub struct AccountLedger {
    entries: Vec<LedgerEntry>,
    positions: HashMap<EntryId, usize>,
    balances: Balances,
}

impl AccountLedger {
    pub fn balances(&self) -> Balances {
        self.balances
    }

    pub fn get(&self, id: EntryId) -> Option<&LedgerEntry> {
        self.positions.get(&id).map(|&pos| &self.entries[pos])
    }

    /// Balances once `entry` is pushed, or `Overflow` if a total would not fit.
    pub fn admit(&self, entry: &LedgerEntry) -> Result<Balances, LedgerError> {
        self.balances
            .recorded(entry)
            .ok_or(LedgerError::Overflow(entry.id, entry.account))
    }

    /// Balances once `id` moves to `to`.
    pub fn admit_transition(&self, id: EntryId, to: EntryStatus) -> Result<Balances, LedgerError> {
        let entry = self.get(id).ok_or(LedgerError::NotFound(id))?;
        self.balances
            .transitioned(entry, to)
            .ok_or(LedgerError::Overflow(id, entry.account))
    }

    pub fn push(&mut self, entry: LedgerEntry) -> Result<(), LedgerError> {
        self.balances = self.admit(&entry)?;
        self.positions.insert(entry.id, self.entries.len());
        self.entries.push(entry);
        Ok(())
    }

    /// Move a pending entry to `to`, merging `annotations` into its metadata.
    ///
    /// The caller has already checked that the transition is legal.
    pub fn settle(
        &mut self,
        id: EntryId,
        to: EntryStatus,
        annotations: Metadata,
    ) -> Result<LedgerEntry, LedgerError> {
        self.balances = self.admit_transition(id, to)?;
        let pos = self.positions[&id];
        let entry = &mut self.entries[pos];
        entry.status = to;
        entry.metadata.extend(annotations);
        Ok(entry.clone())
    }

    /// Merge `annotations` into a pending entry without moving balances.
    pub fn annotate(&mut self, id: EntryId, annotations: Metadata) -> Option<LedgerEntry> {
        let pos = *self.positions.get(&id)?;
        let entry = &mut self.entries[pos];
        entry.metadata.extend(annotations);
        Some(entry.clone())
    }

    pub fn newest_first(&self) -> impl Iterator<Item = &LedgerEntry> + '_ {
        self.entries.iter().rev()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
