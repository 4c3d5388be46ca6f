//! The memoizing construction cache.
//!
//! Constructing the same workflow-backed task twice must yield the same
//! [`Workflow`] by reference, so that two graphs can recognise a shared
//! subgraph by pointer identity. Entries are grouped per specification,
//! then by the set of input names holding lazy values, then matched by the
//! folded content hash of the remaining concrete fields.
//!
//! A field made concrete after an earlier construction can still hit that
//! earlier entry: lookup also walks groups whose lazy-name set is a strict
//! superset of the instance's, hashing only the fields outside the group's
//! set. Concurrent constructions of the same key are serialized on a
//! per-key gate, so the constructor body runs at most once per key.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use crate::engine::workflow::Workflow;
use crate::error::ConstructionError;
use crate::hash::{Hash32, fold_fields};
use crate::spec::{TaskInstance, TaskSpec};

type Group = Vec<(Hash32, Arc<Workflow>)>;
type SpecGroups = BTreeMap<BTreeSet<String>, Group>;
type GateKey = (Hash32, BTreeSet<String>, Hash32);

/// Cache of constructed workflow graphs, shared across constructions.
#[derive(Default)]
pub struct ConstructionCache {
    entries: Mutex<HashMap<Hash32, SpecGroups>>,
    gates: Mutex<HashMap<GateKey, Arc<Mutex<()>>>>,
}

impl ConstructionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached workflow for `task`, or builds and caches one.
    pub(crate) fn get_or_construct(
        &self,
        task: &TaskInstance,
        build: impl FnOnce() -> Result<Workflow, ConstructionError>,
    ) -> Result<Arc<Workflow>, ConstructionError> {
        let spec_id = task.spec().identity_hash();
        let lazy = task.lazy_names();
        let (_, hashes) = task.compute_hashes()?;

        if let Some(hit) = self.lookup(spec_id, &lazy, &hashes) {
            tracing::debug!(workflow = %task.spec().name(), "construction cache hit");
            return Ok(hit);
        }

        let own = fold_excluding(&hashes, &lazy);
        let key = (spec_id, lazy.clone(), own);
        let gate = {
            let mut gates = self.gates.lock().unwrap();
            Arc::clone(gates.entry(key.clone()).or_default())
        };
        let _guard = gate.lock().unwrap();

        // Another thread may have finished this key while we waited.
        if let Some(hit) = self.lookup(spec_id, &lazy, &hashes) {
            self.gates.lock().unwrap().remove(&key);
            return Ok(hit);
        }

        let workflow = match build() {
            Ok(workflow) => Arc::new(workflow),
            Err(err) => {
                self.gates.lock().unwrap().remove(&key);
                return Err(err);
            }
        };

        {
            let mut entries = self.entries.lock().unwrap();
            entries
                .entry(spec_id)
                .or_default()
                .entry(lazy)
                .or_default()
                .push((own, Arc::clone(&workflow)));
        }

        // The entry is published, so the gate has served its purpose.
        self.gates.lock().unwrap().remove(&key);

        Ok(workflow)
    }

    fn lookup(
        &self,
        spec_id: Hash32,
        lazy: &BTreeSet<String>,
        hashes: &[(String, Hash32)],
    ) -> Option<Arc<Workflow>> {
        let entries = self.entries.lock().unwrap();
        let groups = entries.get(&spec_id)?;

        let exact = groups.get_key_value(lazy).into_iter();
        let wider = groups
            .iter()
            .filter(|(set, _)| *set != lazy && set.is_superset(lazy));

        for (set, group) in exact.chain(wider) {
            let hash = fold_excluding(hashes, set);
            if let Some((_, workflow)) = group.iter().find(|(h, _)| *h == hash) {
                return Some(Arc::clone(workflow));
            }
        }

        None
    }

    /// Gates currently held by in-flight constructions.
    #[cfg(test)]
    fn gate_count(&self) -> usize {
        self.gates.lock().unwrap().len()
    }

    /// Drops every cached construction of the given specification.
    pub fn clear(&self, spec: &TaskSpec) {
        let mut entries = self.entries.lock().unwrap();
        entries.remove(&spec.identity_hash());
    }

    /// The cached groups for a specification: each group's lazy-name set and
    /// the number of distinct constructions stored under it.
    pub fn groups(&self, spec: &TaskSpec) -> Vec<(BTreeSet<String>, usize)> {
        let entries = self.entries.lock().unwrap();
        entries
            .get(&spec.identity_hash())
            .map(|groups| {
                groups
                    .iter()
                    .map(|(set, group)| (set.clone(), group.len()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn fold_excluding(hashes: &[(String, Hash32)], exclude: &BTreeSet<String>) -> Hash32 {
    fold_fields(
        hashes
            .iter()
            .filter(|(name, _)| !exclude.contains(name))
            .map(|(name, hash)| (name.as_str(), *hash)),
    )
}
