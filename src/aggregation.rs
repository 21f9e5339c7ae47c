//! Stage-plan interpreter turning per-subject series into result tables or
//! phase-major ensembles.
//!
//! A plan is an unordered set of typed stages. Stages always run in the fixed
//! order resample → normalize → select → split/cut → mean/merge → conditions.

use crate::data::{SubjectDataDict, SubjectUnits, UnitKey};
use crate::error::{Error, Result, UnitId};
use crate::results::{AggregatedResult, MergedEnsemble, ResultRow};
use crate::signal::TimeSeries;
use crate::structure::ProtocolStructure;
use indexmap::map::Entry;
use indexmap::IndexMap;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

pub const DEFAULT_RESAMPLE_SEC: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NormalizeMode {
    /// `x - mean(reference)`, identity 0
    Subtract,
    /// `x / mean(reference)`, identity 1
    Divide,
}

/// Where subphase windows come from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SubphaseSplit {
    /// The same ordered `(name, seconds)` windows for every phase
    Fixed(Vec<(String, f64)>),
    /// Each phase's subphases as declared in the protocol structure
    FromStructure,
}

/// Subject → condition table joined onto the output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionLookup {
    entries: IndexMap<String, String>,
    /// Skip subjects missing from the table instead of failing
    pub lenient: bool,
}

impl ConditionLookup {
    pub fn new(entries: Vec<(String, String)>, lenient: bool) -> Result<Self> {
        let mut map = IndexMap::with_capacity(entries.len());
        for (subject, condition) in entries {
            match map.entry(subject) {
                Entry::Occupied(e) => {
                    return Err(Error::config(format!(
                        "subject '{}' has more than one condition",
                        e.key()
                    )))
                }
                Entry::Vacant(e) => {
                    e.insert(condition);
                }
            }
        }
        Ok(ConditionLookup {
            entries: map,
            lenient,
        })
    }

    pub fn get(&self, subject: &str) -> Option<&str> {
        self.entries.get(subject).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Stage {
    /// Resample every series onto a grid with this step in seconds
    ResampleSec(f64),
    NormalizeTo {
        reference: String,
        mode: NormalizeMode,
    },
    /// Keep only these phases, in their original order
    SelectPhases(Vec<String>),
    SplitIntoSubphases(SubphaseSplit),
    /// Trim each phase to the shortest span across subjects
    CutPhases,
    MeanPerSubject,
    MergeDict,
    AddConditions(ConditionLookup),
}

impl Stage {
    fn rank(&self) -> u8 {
        match self {
            Stage::ResampleSec(_) => 0,
            Stage::NormalizeTo { .. } => 1,
            Stage::SelectPhases(_) => 2,
            Stage::SplitIntoSubphases(_) | Stage::CutPhases => 3,
            Stage::MeanPerSubject | Stage::MergeDict => 4,
            Stage::AddConditions(_) => 5,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Stage::ResampleSec(_) => "resample_sec",
            Stage::NormalizeTo { .. } => "normalize_to",
            Stage::SelectPhases(_) => "select_phases",
            Stage::SplitIntoSubphases(_) => "split_into_subphases",
            Stage::CutPhases => "cut_phases",
            Stage::MeanPerSubject => "mean_per_subject",
            Stage::MergeDict => "merge_dict",
            Stage::AddConditions(_) => "add_conditions",
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            Stage::ResampleSec(dt) if !(dt.is_finite() && *dt > 0.0) => Err(Error::config(
                format!("resample step must be positive, got {}", dt),
            )),
            Stage::NormalizeTo { reference, .. } if reference.is_empty() => {
                Err(Error::config("normalization needs a reference phase"))
            }
            Stage::SelectPhases(names) if names.is_empty() => {
                Err(Error::config("phase selection is empty"))
            }
            Stage::SplitIntoSubphases(SubphaseSplit::Fixed(windows)) => {
                validate_windows(windows).map_err(Error::Configuration)
            }
            _ => Ok(()),
        }
    }
}

/// Checks an ordered list of subphase windows, only the last one may be open (0)
fn validate_windows(windows: &[(String, f64)]) -> std::result::Result<(), String> {
    if windows.is_empty() {
        return Err("subphase mapping is empty".to_string());
    }
    let last = windows.len() - 1;
    for (i, (name, d)) in windows.iter().enumerate() {
        if windows[..i].iter().any(|(n, _)| n == name) {
            return Err(format!("subphase '{}' listed twice", name));
        }
        if !(d.is_finite() && *d >= 0.0) {
            return Err(format!("subphase '{}' has invalid duration {}", name, d));
        }
        if *d == 0.0 && i != last {
            return Err(format!("only the last subphase may be open, '{}' is not last", name));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanKind {
    Results,
    Ensemble,
}

/// Validated, canonically ordered set of stages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationPlan {
    kind: PlanKind,
    stages: Vec<Stage>,
}

impl AggregationPlan {
    /// Plan ending in one mean per subject and phase
    pub fn results(stages: Vec<Stage>) -> Result<Self> {
        Self::build(PlanKind::Results, stages)
    }

    /// Plan ending in phase-major ensemble series
    pub fn ensemble(stages: Vec<Stage>) -> Result<Self> {
        Self::build(PlanKind::Ensemble, stages)
    }

    /// 1 s resampling followed by per-subject means
    pub fn results_default() -> Self {
        AggregationPlan {
            kind: PlanKind::Results,
            stages: vec![Stage::ResampleSec(DEFAULT_RESAMPLE_SEC), Stage::MeanPerSubject],
        }
    }

    /// 1 s resampling followed by merging
    pub fn ensemble_default() -> Self {
        AggregationPlan {
            kind: PlanKind::Ensemble,
            stages: vec![Stage::ResampleSec(DEFAULT_RESAMPLE_SEC), Stage::MergeDict],
        }
    }

    fn build(kind: PlanKind, mut stages: Vec<Stage>) -> Result<Self> {
        for (i, stage) in stages.iter().enumerate() {
            stage.validate()?;
            if stages[..i].iter().any(|s| s.name() == stage.name()) {
                return Err(Error::config(format!("stage {} given twice", stage.name())));
            }
        }

        let has = |name: &str| stages.iter().any(|s| s.name() == name);
        let (required, forbidden): (&str, [&str; 2]) = match kind {
            PlanKind::Results => ("mean_per_subject", ["merge_dict", "cut_phases"]),
            PlanKind::Ensemble => ("merge_dict", ["mean_per_subject", "split_into_subphases"]),
        };
        if !has(required) {
            return Err(Error::config(format!(
                "a {:?} plan needs the {} stage",
                kind, required
            )));
        }
        if let Some(bad) = forbidden.iter().find(|name| has(**name)) {
            return Err(Error::config(format!(
                "stage {} is not supported in a {:?} plan",
                bad, kind
            )));
        }

        stages.sort_by_key(|s| s.rank());
        Ok(AggregationPlan { kind, stages })
    }

    pub fn kind(&self) -> PlanKind {
        self.kind
    }

    /// Stages in execution order
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }
}

impl Default for AggregationPlan {
    fn default() -> Self {
        Self::results_default()
    }
}

/// Output of a batch run together with the errors of the units that were dropped
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregated<T> {
    pub output: T,
    pub errors: Vec<(UnitId, Error)>,
}

pub fn compute_results(
    data: &SubjectDataDict,
    structure: &ProtocolStructure,
    plan: &AggregationPlan,
) -> Result<Aggregated<AggregatedResult>> {
    if plan.kind() != PlanKind::Results {
        return Err(Error::config("compute_results needs a results plan"));
    }
    let mut run = Run::prepare(data, structure, plan)?;
    run.transform()?;

    let mut table = AggregatedResult::new(run.means());
    if let Some(Stage::AddConditions(lookup)) = plan.stages().last() {
        let subjects: Vec<String> = table.subjects().iter().map(|s| s.to_string()).collect();
        let missing = run.missing_conditions(&subjects, lookup)?;
        table.retain(|row| !missing.contains(&row.subject));
        for row in table.rows_mut() {
            row.condition = lookup.get(&row.subject).map(str::to_string);
        }
    }
    debug!(
        "Aggregated {} rows, {} units dropped",
        table.len(),
        run.errors.len()
    );
    Ok(Aggregated {
        output: table,
        errors: run.errors,
    })
}

pub fn compute_ensemble(
    data: &SubjectDataDict,
    structure: &ProtocolStructure,
    plan: &AggregationPlan,
) -> Result<Aggregated<MergedEnsemble>> {
    if plan.kind() != PlanKind::Ensemble {
        return Err(Error::config("compute_ensemble needs an ensemble plan"));
    }
    let mut run = Run::prepare(data, structure, plan)?;
    run.transform()?;

    let units = std::mem::take(&mut run.units);
    let mut ensemble = MergedEnsemble::from_units(data.layout(), units);
    if let Some(Stage::AddConditions(lookup)) = plan.stages().last() {
        let subjects = ensemble.subjects().to_vec();
        let missing = run.missing_conditions(&subjects, lookup)?;
        ensemble.retain_subjects(|s| !missing.iter().any(|m| m == s));
        for phase in ensemble.phases_mut() {
            for member in &mut phase.members {
                member.condition = lookup.get(&member.subject).map(str::to_string);
            }
        }
    }
    debug!(
        "Merged {} phases over {} subjects, {} units dropped",
        ensemble.phases().len(),
        ensemble.subjects().len(),
        run.errors.len()
    );
    Ok(Aggregated {
        output: ensemble,
        errors: run.errors,
    })
}

/// Regroups subject-major data into phase-major ensembles without any other stage
pub fn merge_dict(data: &SubjectDataDict) -> MergedEnsemble {
    MergedEnsemble::from_units(data.layout(), data.units())
}

struct Run<'a> {
    structure: &'a ProtocolStructure,
    plan: &'a AggregationPlan,
    units: Vec<SubjectUnits>,
    errors: Vec<(UnitId, Error)>,
}

impl<'a> Run<'a> {
    /// Checks the plan against the structure and the data layout
    fn prepare(
        data: &SubjectDataDict,
        structure: &'a ProtocolStructure,
        plan: &'a AggregationPlan,
    ) -> Result<Self> {
        for stage in plan.stages() {
            match stage {
                Stage::NormalizeTo { reference, .. } if !structure.contains_phase(reference) => {
                    return Err(Error::config(format!(
                        "reference phase '{}' is not part of the protocol",
                        reference
                    )));
                }
                Stage::SelectPhases(names) => {
                    if let Some(unknown) = names.iter().find(|n| !structure.contains_phase(n)) {
                        return Err(Error::config(format!(
                            "selected phase '{}' is not part of the protocol",
                            unknown
                        )));
                    }
                }
                Stage::SplitIntoSubphases(_) if data.layout().has_subphase() => {
                    return Err(Error::config(
                        "data are already split into subphases",
                    ));
                }
                _ => {}
            }
        }
        Ok(Run {
            structure,
            plan,
            units: data.units(),
            errors: Vec::new(),
        })
    }

    fn transform(&mut self) -> Result<()> {
        let plan = self.plan;
        for stage in plan.stages() {
            debug!("Applying stage {}", stage.name());
            match stage {
                Stage::ResampleSec(dt) => self.resample(*dt)?,
                Stage::NormalizeTo { reference, mode } => self.normalize(reference, *mode),
                Stage::SelectPhases(names) => self.select(names),
                Stage::SplitIntoSubphases(split) => self.split(split),
                Stage::CutPhases => self.cut(),
                Stage::MeanPerSubject | Stage::MergeDict | Stage::AddConditions(_) => {}
            }
        }
        Ok(())
    }

    fn record(&mut self, unit: UnitId, error: Error) {
        warn!("Dropping {}: {}", unit, error);
        self.errors.push((unit, error));
    }

    fn resample(&mut self, dt: f64) -> Result<()> {
        for (_, units) in &mut self.units {
            for (_, series) in units.iter_mut() {
                *series = series.resample(dt)?;
            }
        }
        Ok(())
    }

    fn normalize(&mut self, reference: &str, mode: NormalizeMode) {
        let units = std::mem::take(&mut self.units);
        for (subject, subject_units) in units {
            let values: Vec<f64> = subject_units
                .iter()
                .filter(|(key, _)| key.phase == reference)
                .flat_map(|(_, ts)| ts.values().iter().copied())
                .collect();
            if values.is_empty() {
                self.record(
                    UnitId::subject_phase(&subject, reference),
                    Error::lookup(format!(
                        "subject '{}' has no data for reference phase '{}'",
                        subject, reference
                    )),
                );
                continue;
            }
            let baseline = values.iter().sum::<f64>() / values.len() as f64;
            if mode == NormalizeMode::Divide && baseline == 0.0 {
                self.record(
                    UnitId::subject_phase(&subject, reference),
                    Error::processing("reference mean is zero, cannot divide"),
                );
                continue;
            }
            let normalized = subject_units
                .into_iter()
                .map(|(key, ts)| {
                    let ts = match mode {
                        NormalizeMode::Subtract => ts.map_values(|v| v - baseline),
                        NormalizeMode::Divide => ts.map_values(|v| v / baseline),
                    };
                    (key, ts)
                })
                .collect();
            self.units.push((subject, normalized));
        }
    }

    fn select(&mut self, names: &[String]) {
        for (_, units) in &mut self.units {
            units.retain(|(key, _)| names.contains(&key.phase));
        }
    }

    fn split(&mut self, split: &SubphaseSplit) {
        let units = std::mem::take(&mut self.units);
        for (subject, subject_units) in units {
            let mut out = Vec::new();
            for (key, series) in subject_units {
                let windows = match split {
                    SubphaseSplit::Fixed(windows) => windows.clone(),
                    SubphaseSplit::FromStructure => {
                        let has_subphases = self
                            .structure
                            .subphases(&key.phase)
                            .is_some_and(|s| !s.is_empty());
                        if !has_subphases {
                            out.push((key, series));
                            continue;
                        }
                        match self.structure.subphase_durations(&key.phase) {
                            Some(windows) => windows,
                            None => {
                                self.record(
                                    UnitId::subject_phase(&subject, &key.phase),
                                    Error::alignment(format!(
                                        "subphases of '{}' have no declared durations",
                                        key.phase
                                    )),
                                );
                                continue;
                            }
                        }
                    }
                };
                match split_series(&series, &windows) {
                    Ok(parts) => {
                        out.extend(parts.into_iter().map(|(name, ts)| (key.with_subphase(&name), ts)))
                    }
                    Err(e) => self.record(UnitId::subject_phase(&subject, &key.phase), e),
                }
            }
            self.units.push((subject, out));
        }
    }

    fn cut(&mut self) {
        let mut shortest: IndexMap<UnitKey, f64> = IndexMap::new();
        for (_, units) in &self.units {
            for (key, series) in units {
                let span = series.span();
                shortest
                    .entry(key.clone())
                    .and_modify(|s| *s = s.min(span))
                    .or_insert(span);
            }
        }
        for (_, units) in &mut self.units {
            for (key, series) in units.iter_mut() {
                if let Some(span) = shortest.get(key) {
                    *series = series.truncate_span(*span);
                }
            }
        }
    }

    fn means(&mut self) -> Vec<ResultRow> {
        let units = std::mem::take(&mut self.units);
        let mut rows = Vec::new();
        for (subject, subject_units) in units {
            for (key, series) in subject_units {
                match series.mean() {
                    Some(value) => rows.push(ResultRow {
                        subject: subject.clone(),
                        condition: None,
                        phase: key.phase,
                        subphase: key.subphase,
                        value,
                    }),
                    None => self.record(
                        UnitId::subject_phase(&subject, &key.phase),
                        Error::insufficient(format!("no samples left in {}", key)),
                    ),
                }
            }
        }
        rows
    }

    /// Subjects absent from `lookup`; an error unless the lookup is lenient
    fn missing_conditions(
        &mut self,
        subjects: &[String],
        lookup: &ConditionLookup,
    ) -> Result<Vec<String>> {
        let missing: Vec<String> = subjects
            .iter()
            .filter(|s| lookup.get(s).is_none())
            .cloned()
            .collect();
        if !lookup.lenient {
            if let Some(subject) = missing.first() {
                return Err(Error::lookup(format!(
                    "subject '{}' has no condition",
                    subject
                )));
            }
        }
        for subject in &missing {
            self.record(
                UnitId::subject(subject),
                Error::lookup(format!("subject '{}' has no condition", subject)),
            );
        }
        Ok(missing)
    }
}

/// Slices `series` into consecutive windows `[cum, cum + d)` measured from the
/// series start, which is the start of the phase, not its first sample. The
/// last window is closed at the summed duration; an open (0) last window takes
/// the remainder of the series.
pub fn split_series(
    series: &TimeSeries,
    windows: &[(String, f64)],
) -> Result<Vec<(String, TimeSeries)>> {
    validate_windows(windows).map_err(Error::Configuration)?;
    let extent = series.extent();
    let tolerance = series.sample_period().unwrap_or(0.0);
    let last = windows.len() - 1;
    let open = windows[last].1 == 0.0;
    let fixed: f64 = windows.iter().map(|(_, d)| d).sum();

    if fixed > extent + tolerance + 1e-9 {
        return Err(Error::alignment(format!(
            "subphases need {} s but the phase data end after {} s",
            fixed, extent
        )));
    }

    let mut cum = 0.0;
    let mut out = Vec::with_capacity(windows.len());
    for (i, (name, d)) in windows.iter().enumerate() {
        let end = if i == last && open { extent } else { cum + d };
        out.push((name.clone(), series.window(cum, end, i == last)));
        cum = end;
    }
    Ok(out)
}
