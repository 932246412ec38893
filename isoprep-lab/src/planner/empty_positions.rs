//! Free wells for intermediate dilutions
//!
//! Preference when a reagent needs another well: a free well in a column the
//! reagent already occupies, then a well in a column nothing occupies, then
//! any free well. Columns and rows are scanned in ascending order.

use crate::model::{RackPosition, RackShape, ReagentKey};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone)]
pub struct EmptyPositionManager {
    free: BTreeSet<RackPosition>,
    occupied: BTreeSet<RackPosition>,
    reagent_columns: BTreeMap<ReagentKey, BTreeSet<u8>>,
}

impl EmptyPositionManager {
    /// Every position of `shape` not in `occupied` is free
    pub fn new(shape: RackShape, occupied: impl IntoIterator<Item = RackPosition>) -> Self {
        let occupied: BTreeSet<RackPosition> = occupied.into_iter().collect();
        let free = shape.positions().filter(|p| !occupied.contains(p)).collect();
        Self {
            free,
            occupied,
            reagent_columns: BTreeMap::new(),
        }
    }

    /// Record a well the reagent occupies
    pub fn register(&mut self, key: ReagentKey, position: RackPosition) {
        self.free.remove(&position);
        self.occupied.insert(position);
        self.reagent_columns.entry(key).or_default().insert(position.column);
    }

    pub fn take_for(&mut self, key: ReagentKey) -> Option<RackPosition> {
        let own_columns = self.reagent_columns.get(&key).cloned().unwrap_or_default();
        let chosen = self
            .first_free(|p| own_columns.contains(&p.column))
            .or_else(|| self.first_free(|p| self.column_is_empty(p.column)))
            .or_else(|| self.first_free(|_| true))?;
        self.register(key, chosen);
        Some(chosen)
    }

    /// Give a taken well back
    pub fn release(&mut self, position: RackPosition) {
        if self.occupied.remove(&position) {
            self.free.insert(position);
        }
        let column_used = self.occupied.iter().any(|p| p.column == position.column);
        if !column_used {
            for columns in self.reagent_columns.values_mut() {
                columns.remove(&position.column);
            }
        }
    }

    pub fn remaining(&self) -> usize {
        self.free.len()
    }

    fn column_is_empty(&self, column: u8) -> bool {
        !self.occupied.iter().any(|p| p.column == column)
    }

    /// First free position in column order matching `filter`
    fn first_free(&self, filter: impl Fn(&RackPosition) -> bool) -> Option<RackPosition> {
        self.free
            .iter()
            .copied()
            .filter(|p| filter(p))
            .min_by_key(|p| (p.column, p.row))
    }
}
