use crate::aggregation::{self, Aggregated, AggregationPlan};
use crate::data::SubjectDataDict;
use crate::error::{Error, Result, UnitId};
use crate::results::{AggregatedResult, MergedEnsemble};
use crate::structure::ProtocolStructure;
use indexmap::map::Entry;
use indexmap::IndexMap;
use log::{debug, info};

/// Named result tables and ensembles of one protocol, in insertion order
#[derive(Debug, Clone, Default)]
pub struct ResultsRegistry {
    results: IndexMap<String, AggregatedResult>,
    ensembles: IndexMap<String, MergedEnsemble>,
}

impl ResultsRegistry {
    pub fn result(&self, id: &str) -> Option<&AggregatedResult> {
        self.results.get(id)
    }

    pub fn ensemble(&self, id: &str) -> Option<&MergedEnsemble> {
        self.ensembles.get(id)
    }

    pub fn result_ids(&self) -> Vec<&str> {
        self.results.keys().map(String::as_str).collect()
    }

    pub fn ensemble_ids(&self) -> Vec<&str> {
        self.ensembles.keys().map(String::as_str).collect()
    }

    pub fn insert_result(&mut self, id: &str, result: AggregatedResult, overwrite: bool) -> Result<()> {
        insert(&mut self.results, id, result, overwrite)
    }

    pub fn insert_ensemble(
        &mut self,
        id: &str,
        ensemble: MergedEnsemble,
        overwrite: bool,
    ) -> Result<()> {
        insert(&mut self.ensembles, id, ensemble, overwrite)
    }

    pub fn remove_result(&mut self, id: &str) -> Option<AggregatedResult> {
        self.results.shift_remove(id)
    }

    pub fn remove_ensemble(&mut self, id: &str) -> Option<MergedEnsemble> {
        self.ensembles.shift_remove(id)
    }
}

fn insert<T>(store: &mut IndexMap<String, T>, id: &str, value: T, overwrite: bool) -> Result<()> {
    match store.entry(id.to_string()) {
        Entry::Occupied(_) if !overwrite => Err(Error::DuplicateId(id.to_string())),
        Entry::Occupied(mut slot) => {
            debug!("Overwriting '{}'", id);
            slot.insert(value);
            Ok(())
        }
        Entry::Vacant(slot) => {
            slot.insert(value);
            Ok(())
        }
    }
}

/// A study protocol: its structure plus every aggregation computed for it
#[derive(Debug, Clone)]
pub struct Protocol {
    name: String,
    structure: ProtocolStructure,
    registry: ResultsRegistry,
}

impl Protocol {
    pub fn new(name: &str, structure: ProtocolStructure) -> Self {
        Protocol {
            name: name.to_string(),
            structure,
            registry: ResultsRegistry::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn structure(&self) -> &ProtocolStructure {
        &self.structure
    }

    pub fn registry(&self) -> &ResultsRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ResultsRegistry {
        &mut self.registry
    }

    /// Runs a results plan and stores the table under `id`.
    ///
    /// Reusing `id` fails with [`Error::DuplicateId`] unless `overwrite` is
    /// set; the id is checked before any work is done. Returns the per-unit
    /// errors of the run.
    pub fn compute_results(
        &mut self,
        id: &str,
        data: &SubjectDataDict,
        plan: &AggregationPlan,
        overwrite: bool,
    ) -> Result<Vec<(UnitId, Error)>> {
        if !overwrite && self.registry.result(id).is_some() {
            return Err(Error::DuplicateId(id.to_string()));
        }
        let Aggregated { output, errors } =
            aggregation::compute_results(data, &self.structure, plan)?;
        info!(
            "{}: stored result '{}' with {} rows",
            self.name,
            id,
            output.len()
        );
        self.registry.insert_result(id, output, overwrite)?;
        Ok(errors)
    }

    /// Ensemble counterpart of [`compute_results`](Self::compute_results)
    pub fn compute_ensemble(
        &mut self,
        id: &str,
        data: &SubjectDataDict,
        plan: &AggregationPlan,
        overwrite: bool,
    ) -> Result<Vec<(UnitId, Error)>> {
        if !overwrite && self.registry.ensemble(id).is_some() {
            return Err(Error::DuplicateId(id.to_string()));
        }
        let Aggregated { output, errors } =
            aggregation::compute_ensemble(data, &self.structure, plan)?;
        info!(
            "{}: stored ensemble '{}' with {} phases",
            self.name,
            id,
            output.phases().len()
        );
        self.registry.insert_ensemble(id, output, overwrite)?;
        Ok(errors)
    }

    pub fn result(&self, id: &str) -> Option<&AggregatedResult> {
        self.registry.result(id)
    }

    pub fn ensemble(&self, id: &str) -> Option<&MergedEnsemble> {
        self.registry.ensemble(id)
    }
}
