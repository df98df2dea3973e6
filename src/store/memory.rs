//! In-process [`Store`] backed by a mutex-protected map.
//!
//! Row locks are modelled by a set of locked target names: [`MemoryStore::lock_row`]
//! hands out a guard standing for another worker's open transaction, and
//! [`Store::claim_stale`] skips every locked row instead of waiting for it.
use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::constants::{Degree, JulianDate};
use crate::mop_errors::MopError;
use crate::store::{is_claimable, DataType, Datum, Store};
use crate::target::{Target, TargetExtras, TargetFilter, TargetKind};

#[derive(Debug, Default)]
struct Tables {
    targets: BTreeMap<String, Target>,
    data: Vec<Datum>,
    locked: HashSet<String>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

/// A row lock held on a target until dropped.
pub struct RowLock<'a> {
    store: &'a MemoryStore,
    name: String,
}

impl Drop for RowLock<'_> {
    fn drop(&mut self) {
        self.store.tables().locked.remove(&self.name);
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock the row of `name` as a concurrent transaction would.
    ///
    /// Return
    /// ------
    /// * `None` if the row is already locked
    pub fn lock_row(&self, name: &str) -> Option<RowLock<'_>> {
        self.tables().locked.insert(name.to_string()).then(|| RowLock {
            store: self,
            name: name.to_string(),
        })
    }
}

impl Store for MemoryStore {
    fn find(&self, filter: &TargetFilter) -> Result<Vec<Target>, MopError> {
        Ok(self
            .tables()
            .targets
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect())
    }

    fn get(&self, name: &str) -> Result<Target, MopError> {
        self.tables()
            .targets
            .get(name)
            .cloned()
            .ok_or_else(|| MopError::TargetNotFound(name.to_string()))
    }

    fn get_or_create(
        &self,
        name: &str,
        ra: Degree,
        dec: Degree,
        kind: TargetKind,
        epoch: f64,
    ) -> Result<(Target, bool), MopError> {
        let mut tables = self.tables();
        if let Some(existing) = tables.targets.get(name) {
            return Ok((existing.clone(), false));
        }
        let target = Target::new(name, ra, dec, kind, epoch);
        tables.targets.insert(name.to_string(), target.clone());
        Ok((target, true))
    }

    fn claim_stale(&self, window_hours: f64, now: JulianDate) -> Result<Option<Target>, MopError> {
        let mut tables = self.tables();
        let Tables { targets, locked, .. } = &mut *tables;

        let candidate = targets
            .values_mut()
            .filter(|t| !locked.contains(&t.name) && is_claimable(t, window_hours, now))
            .min_by(|a, b| {
                a.extras
                    .last_fit
                    .unwrap_or(f64::NEG_INFINITY)
                    .total_cmp(&b.extras.last_fit.unwrap_or(f64::NEG_INFINITY))
            });

        Ok(candidate.map(|target| {
            target.extras.last_fit = Some(now);
            target.clone()
        }))
    }

    fn save_extras(&self, name: &str, extras: &TargetExtras) -> Result<(), MopError> {
        let mut tables = self.tables();
        let target = tables
            .targets
            .get_mut(name)
            .ok_or_else(|| MopError::TargetNotFound(name.to_string()))?;
        target.extras = extras.clone();
        Ok(())
    }

    fn append_datum(&self, datum: Datum) -> Result<(), MopError> {
        let mut tables = self.tables();
        if !tables.targets.contains_key(&datum.target) {
            return Err(MopError::TargetNotFound(datum.target));
        }
        if tables.data.iter().any(|d| d.collides_with(&datum)) {
            return Err(datum.duplicate_error());
        }
        tables.data.push(datum);
        Ok(())
    }

    fn data(&self, name: &str, data_type: Option<DataType>) -> Result<Vec<Datum>, MopError> {
        let tables = self.tables();
        if !tables.targets.contains_key(name) {
            return Err(MopError::TargetNotFound(name.to_string()));
        }
        let mut data: Vec<Datum> = tables
            .data
            .iter()
            .filter(|d| d.target == name && data_type.map_or(true, |dt| d.data_type() == dt))
            .cloned()
            .collect();
        data.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        Ok(data)
    }
}
