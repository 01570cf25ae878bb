use crate::farm::Farm;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;

/// A farm written to since the last commit or rollback, pinned to the
/// connection the writes went through.
#[derive(Debug, Clone)]
pub(crate) struct TouchedFarm {
    pub farm: Arc<Farm>,
    pub generation: u64,
}

#[derive(Debug, Default)]
pub(crate) struct TransactionState {
    pub in_transaction: bool,
    pub farms: Vec<TouchedFarm>,
    pub tables: BTreeSet<String>,
    pub statements: BTreeSet<String>,
}

impl TransactionState {
    pub fn touch(&mut self, farm: &Arc<Farm>, generation: u64) {
        let known = self
            .farms
            .iter()
            .any(|t| Arc::ptr_eq(&t.farm, farm) && t.generation == generation);
        if !known {
            self.farms.push(TouchedFarm {
                farm: farm.clone(),
                generation,
            });
        }
    }

    /// Drops `farm` after its connection was committed or rolled back
    /// outside the store. Outside a transaction, the table and statement
    /// record goes with the last farm.
    pub fn forget(&mut self, farm: &Arc<Farm>) {
        self.farms.retain(|t| !Arc::ptr_eq(&t.farm, farm));
        if self.farms.is_empty() && !self.in_transaction {
            self.tables.clear();
            self.statements.clear();
        }
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.farms.is_empty()
    }

    /// Ends the transaction and hands back everything it tracked.
    pub fn take(&mut self) -> TransactionState {
        std::mem::take(self)
    }

    pub fn report(&self) -> TransactionReport {
        let farms: BTreeSet<String> = self
            .farms
            .iter()
            .map(|t| t.farm.name().to_string())
            .collect();
        TransactionReport {
            cross_farm: farms.len() > 1,
            farms: farms.into_iter().collect(),
            tables: self.tables.iter().cloned().collect(),
            statements: self.statements.len(),
        }
    }
}

/// What a commit or rollback covered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransactionReport {
    pub farms: Vec<String>,
    pub tables: Vec<String>,
    pub statements: usize,
    /// Writes landed on more than one farm, so the commit was not atomic.
    pub cross_farm: bool,
}
