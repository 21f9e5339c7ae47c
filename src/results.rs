use crate::data::{DataLayout, SubjectDataDict, SubjectUnits, UnitKey};
use crate::signal::TimeSeries;
use indexmap::IndexMap;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// One line of an aggregated result table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    pub subject: String,
    pub condition: Option<String>,
    pub phase: String,
    pub subphase: Option<String>,
    pub value: f64,
}

/// Long table keyed by (subject, [condition], phase, [subphase])
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AggregatedResult {
    rows: Vec<ResultRow>,
}

impl AggregatedResult {
    pub fn new(rows: Vec<ResultRow>) -> Self {
        AggregatedResult { rows }
    }

    pub fn rows(&self) -> &[ResultRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_conditions(&self) -> bool {
        self.rows.iter().any(|r| r.condition.is_some())
    }

    pub fn has_subphases(&self) -> bool {
        self.rows.iter().any(|r| r.subphase.is_some())
    }

    pub fn subjects(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for row in &self.rows {
            if !out.contains(&row.subject.as_str()) {
                out.push(&row.subject);
            }
        }
        out
    }

    pub fn value(&self, subject: &str, phase: &str, subphase: Option<&str>) -> Option<f64> {
        self.rows
            .iter()
            .find(|r| r.subject == subject && r.phase == phase && r.subphase.as_deref() == subphase)
            .map(|r| r.value)
    }

    /// Mean across subjects per (condition, phase, subphase), in row order
    pub fn group_means(&self) -> Vec<(Option<String>, String, Option<String>, f64)> {
        let mut groups: IndexMap<(Option<String>, String, Option<String>), (f64, usize)> =
            IndexMap::new();
        for row in &self.rows {
            let key = (row.condition.clone(), row.phase.clone(), row.subphase.clone());
            let (sum, n) = groups.entry(key).or_insert((0.0, 0));
            *sum += row.value;
            *n += 1;
        }
        groups
            .into_iter()
            .map(|((c, p, s), (sum, n))| (c, p, s, sum / n as f64))
            .collect()
    }

    pub(crate) fn retain<F>(&mut self, f: F)
    where
        F: FnMut(&ResultRow) -> bool,
    {
        self.rows.retain(f)
    }

    pub(crate) fn rows_mut(&mut self) -> &mut [ResultRow] {
        &mut self.rows
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnsembleMember {
    pub subject: String,
    pub condition: Option<String>,
    pub series: TimeSeries,
}

/// All subjects' series of one phase (or subphase), ready for overlay
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseEnsemble {
    pub key: UnitKey,
    pub members: Vec<EnsembleMember>,
}

impl PhaseEnsemble {
    /// Samples × members matrix, shorter members padded with NaN
    pub fn to_matrix(&self) -> Array2<f64> {
        let rows = self.members.iter().map(|m| m.series.len()).max().unwrap_or(0);
        let mut matrix = Array2::from_elem((rows, self.members.len()), f64::NAN);
        for (j, member) in self.members.iter().enumerate() {
            for (i, &v) in member.series.values().iter().enumerate() {
                matrix[[i, j]] = v;
            }
        }
        matrix
    }

    /// Sample-wise mean across members, ignoring missing samples
    pub fn mean_series(&self) -> Option<TimeSeries> {
        self.summary(|values| values.iter().sum::<f64>() / values.len() as f64)
    }

    /// Sample-wise standard error of the mean; NaN where fewer than two members remain
    pub fn sem_series(&self) -> Option<TimeSeries> {
        self.summary(|values| {
            let n = values.len();
            if n < 2 {
                return f64::NAN;
            }
            let mean = values.iter().sum::<f64>() / n as f64;
            let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
            var.sqrt() / (n as f64).sqrt()
        })
    }

    fn summary<F>(&self, f: F) -> Option<TimeSeries>
    where
        F: Fn(&[f64]) -> f64,
    {
        let longest = self.members.iter().max_by_key(|m| m.series.len())?;
        let matrix = self.to_matrix();
        let values = matrix
            .rows()
            .into_iter()
            .map(|row| {
                let present: Vec<f64> = row.iter().copied().filter(|v| !v.is_nan()).collect();
                f(&present)
            })
            .collect();
        TimeSeries::new(
            longest.series.start(),
            longest.series.offsets().to_vec(),
            values,
        )
        .ok()
    }
}

/// Phase-major regrouping of a [`SubjectDataDict`]
#[derive(Debug, Clone, PartialEq)]
pub struct MergedEnsemble {
    layout: DataLayout,
    subjects: Vec<String>,
    phases: Vec<PhaseEnsemble>,
}

impl MergedEnsemble {
    /// Groups per-subject units by key, keeping first-appearance order
    pub(crate) fn from_units(layout: DataLayout, units: Vec<SubjectUnits>) -> Self {
        let mut subjects = Vec::new();
        let mut groups: IndexMap<UnitKey, Vec<EnsembleMember>> = IndexMap::new();
        for (subject, subject_units) in units {
            if subject_units.is_empty() {
                continue;
            }
            subjects.push(subject.clone());
            for (key, series) in subject_units {
                groups.entry(key).or_default().push(EnsembleMember {
                    subject: subject.clone(),
                    condition: None,
                    series,
                });
            }
        }
        MergedEnsemble {
            layout,
            subjects,
            phases: groups
                .into_iter()
                .map(|(key, members)| PhaseEnsemble { key, members })
                .collect(),
        }
    }

    pub fn layout(&self) -> DataLayout {
        self.layout
    }

    pub fn subjects(&self) -> &[String] {
        &self.subjects
    }

    pub fn phases(&self) -> &[PhaseEnsemble] {
        &self.phases
    }

    pub fn phase(&self, phase: &str) -> Option<&PhaseEnsemble> {
        self.phases
            .iter()
            .find(|p| p.key.phase == phase && p.key.subphase.is_none())
    }

    pub fn get(&self, key: &UnitKey) -> Option<&PhaseEnsemble> {
        self.phases.iter().find(|p| p.key == *key)
    }

    /// Regroups back to subject-major nesting. Conditions are dropped.
    pub fn unmerge(&self) -> SubjectDataDict {
        let units = self
            .subjects
            .iter()
            .map(|subject| {
                let subject_units = self
                    .phases
                    .iter()
                    .filter_map(|p| {
                        p.members
                            .iter()
                            .find(|m| m.subject == *subject)
                            .map(|m| (p.key.clone(), m.series.clone()))
                    })
                    .collect();
                (subject.clone(), subject_units)
            })
            .collect();
        SubjectDataDict::from_units(self.layout, units)
    }

    pub(crate) fn phases_mut(&mut self) -> &mut Vec<PhaseEnsemble> {
        &mut self.phases
    }

    pub(crate) fn retain_subjects<F>(&mut self, mut keep: F)
    where
        F: FnMut(&str) -> bool,
    {
        self.subjects.retain(|s| keep(s));
        for phase in &mut self.phases {
            phase.members.retain(|m| keep(&m.subject));
        }
        self.phases.retain(|p| !p.members.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use chrono::{TimeZone, Utc};

    fn member(subject: &str, values: Vec<f64>) -> EnsembleMember {
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        EnsembleMember {
            subject: subject.to_string(),
            condition: None,
            series: TimeSeries::regular(t0, 1.0, values).unwrap(),
        }
    }

    #[test]
    fn test_matrix_is_nan_padded() {
        let ensemble = PhaseEnsemble {
            key: UnitKey::phase("Recovery"),
            members: vec![member("a", vec![1.0, 2.0, 3.0]), member("b", vec![4.0])],
        };
        let m = ensemble.to_matrix();
        assert_eq!(m.shape(), &[3, 2]);
        assert_eq!(m[[0, 1]], 4.0);
        assert!(m[[2, 1]].is_nan());
    }

    #[test]
    fn test_mean_and_sem() {
        let ensemble = PhaseEnsemble {
            key: UnitKey::phase("Recovery"),
            members: vec![member("a", vec![1.0, 2.0, 3.0]), member("b", vec![3.0, 4.0])],
        };
        let mean = ensemble.mean_series().unwrap();
        assert_eq!(mean.values(), &[2.0, 3.0, 3.0]);
        let sem = ensemble.sem_series().unwrap();
        // std of {1, 3} is sqrt(2), divided by sqrt(2)
        assert_abs_diff_eq!(sem.values()[0], 1.0, epsilon = 1e-12);
        assert!(sem.values()[2].is_nan());
    }

    #[test]
    fn test_group_means() {
        let rows = vec![
            ResultRow {
                subject: "a".into(),
                condition: Some("Control".into()),
                phase: "Baseline".into(),
                subphase: None,
                value: 60.0,
            },
            ResultRow {
                subject: "b".into(),
                condition: Some("Control".into()),
                phase: "Baseline".into(),
                subphase: None,
                value: 80.0,
            },
        ];
        let table = AggregatedResult::new(rows);
        let means = table.group_means();
        assert_eq!(means.len(), 1);
        assert_abs_diff_eq!(means[0].3, 70.0);
        assert!(table.has_conditions());
        assert!(!table.has_subphases());
    }
}
