//! Saliva biomarker features (cortisol, amylase, ...) over a long-format sample table.

use crate::aggregation::Aggregated;
use crate::error::{Error, Result, UnitId};
use log::debug;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SamplePhase {
    PreStressor,
    PostStressor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SalivaSample {
    pub subject: String,
    pub condition: Option<String>,
    /// Position of the sample in the subject's sampling schedule
    pub sample: usize,
    /// Sampling time in minutes relative to stressor onset
    pub time: f64,
    pub phase: SamplePhase,
    pub value: f64,
}

/// Validated saliva samples of one biomarker
#[derive(Debug, Clone, PartialEq)]
pub struct SalivaRawDataFrame {
    biomarker: String,
    samples: Vec<SalivaSample>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub subject: String,
    pub condition: Option<String>,
    pub feature: String,
    pub value: f64,
}

pub type FeatureTable = Vec<FeatureRow>;

impl SalivaRawDataFrame {
    /// Sorts samples per subject and checks that sample indices are unique,
    /// that times strictly increase with the index, and that no pre-stressor
    /// sample follows a post-stressor one.
    pub fn new(biomarker: &str, mut samples: Vec<SalivaSample>) -> Result<Self> {
        if biomarker.is_empty() {
            return Err(Error::structure("biomarker name is empty"));
        }
        if let Some(bad) = samples.iter().find(|s| !s.value.is_finite() || !s.time.is_finite()) {
            return Err(Error::structure(format!(
                "sample {} of subject '{}' is not a finite value",
                bad.sample, bad.subject
            )));
        }
        // stable sort keeps the input order of subjects
        let order: Vec<(String, Option<String>)> = groups_in_order(&samples);
        samples.sort_by_key(|s| {
            let group = order
                .iter()
                .position(|(subj, cond)| *subj == s.subject && *cond == s.condition)
                .unwrap_or(usize::MAX);
            (group, s.sample)
        });

        for pair in samples.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            if a.subject != b.subject || a.condition != b.condition {
                continue;
            }
            if a.sample == b.sample {
                return Err(Error::structure(format!(
                    "subject '{}' has sample {} twice",
                    a.subject, a.sample
                )));
            }
            if !(b.time > a.time) {
                return Err(Error::structure(format!(
                    "sample times of subject '{}' do not increase with the sample index",
                    a.subject
                )));
            }
            if a.phase == SamplePhase::PostStressor && b.phase == SamplePhase::PreStressor {
                return Err(Error::structure(format!(
                    "subject '{}' has a pre-stressor sample after a post-stressor one",
                    a.subject
                )));
            }
        }
        Ok(SalivaRawDataFrame {
            biomarker: biomarker.to_string(),
            samples,
        })
    }

    pub fn biomarker(&self) -> &str {
        &self.biomarker
    }

    pub fn samples(&self) -> &[SalivaSample] {
        &self.samples
    }

    /// Samples grouped by (subject, condition), each group ordered by sample index
    pub fn groups(&self) -> Vec<(&str, Option<&str>, Vec<&SalivaSample>)> {
        let mut out: Vec<(&str, Option<&str>, Vec<&SalivaSample>)> = Vec::new();
        for s in &self.samples {
            match out
                .iter_mut()
                .find(|(subj, cond, _)| *subj == s.subject && *cond == s.condition.as_deref())
            {
                Some((_, _, group)) => group.push(s),
                None => out.push((&s.subject, s.condition.as_deref(), vec![s])),
            }
        }
        out
    }

    fn feature_name(&self, suffix: &str) -> String {
        format!("{}_{}", self.biomarker, suffix)
    }

    fn per_group<F>(&self, mut f: F) -> Aggregated<FeatureTable>
    where
        F: FnMut(&[&SalivaSample]) -> Result<Vec<(String, f64)>>,
    {
        let mut rows = Vec::new();
        let mut errors = Vec::new();
        for (subject, condition, group) in self.groups() {
            match f(&group) {
                Ok(features) => rows.extend(features.into_iter().map(|(feature, value)| FeatureRow {
                    subject: subject.to_string(),
                    condition: condition.map(str::to_string),
                    feature,
                    value,
                })),
                Err(e) => {
                    debug!("No saliva features for '{}': {}", subject, e);
                    errors.push((UnitId::subject(subject), e));
                }
            }
        }
        Aggregated {
            output: rows,
            errors,
        }
    }

    /// Largest post-stressor value minus the first sample, optionally in percent of it
    pub fn max_increase(&self, percent: bool) -> Aggregated<FeatureTable> {
        let name = self.feature_name(if percent { "max_inc_percent" } else { "max_inc" });
        self.per_group(|group| {
            let s0 = group[0].value;
            let max_post = group
                .iter()
                .filter(|s| s.phase == SamplePhase::PostStressor)
                .map(|s| s.value)
                .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.max(v))))
                .ok_or_else(|| Error::insufficient("no post-stressor samples"))?;
            let increase = max_post - s0;
            let value = if percent {
                if s0 == 0.0 {
                    return Err(Error::processing("first sample is zero, no relative increase"));
                }
                100.0 * increase / s0
            } else {
                increase
            };
            Ok(vec![(name.clone(), value)])
        })
    }

    /// Area under the curve with respect to ground (trapezoid over sample
    /// time) and with respect to increase (ground area minus the rectangle
    /// below the first sample).
    pub fn auc(&self) -> Aggregated<FeatureTable> {
        let (auc_g, auc_i) = (self.feature_name("auc_g"), self.feature_name("auc_i"));
        self.per_group(|group| {
            if group.len() < 2 {
                return Err(Error::insufficient("area under the curve needs two samples"));
            }
            let ground: f64 = group
                .windows(2)
                .map(|w| (w[1].time - w[0].time) * (w[0].value + w[1].value) / 2.0)
                .sum();
            let duration = group[group.len() - 1].time - group[0].time;
            let increase = ground - group[0].value * duration;
            Ok(vec![(auc_g.clone(), ground), (auc_i.clone(), increase)])
        })
    }

    /// Mean, standard deviation, minimum, maximum, sample index of the maximum, and skewness
    pub fn standard_features(&self) -> Aggregated<FeatureTable> {
        let names: Vec<String> = ["mean", "std", "min", "max", "argmax", "skew"]
            .iter()
            .map(|s| self.feature_name(s))
            .collect();
        self.per_group(|group| {
            let values: Vec<f64> = group.iter().map(|s| s.value).collect();
            let n = values.len() as f64;
            let mean = values.iter().sum::<f64>() / n;
            let std = if values.len() > 1 {
                (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
            } else {
                f64::NAN
            };
            let min = values.iter().copied().fold(f64::INFINITY, f64::min);
            let (argmax, max) = group
                .iter()
                .map(|s| (s.sample, s.value))
                .fold((0, f64::NEG_INFINITY), |best, cur| if cur.1 > best.1 { cur } else { best });
            let stats = [mean, std, min, max, argmax as f64, skewness(&values)];
            Ok(names.iter().cloned().zip(stats).collect())
        })
    }

    pub fn initial_value(&self) -> Aggregated<FeatureTable> {
        let name = self.feature_name("ini_val");
        self.per_group(|group| Ok(vec![(name.clone(), group[0].value)]))
    }
}

fn groups_in_order(samples: &[SalivaSample]) -> Vec<(String, Option<String>)> {
    let mut out: Vec<(String, Option<String>)> = Vec::new();
    for s in samples {
        if !out.iter().any(|(subj, cond)| *subj == s.subject && *cond == s.condition) {
            out.push((s.subject.clone(), s.condition.clone()));
        }
    }
    out
}

/// Bias-corrected sample skewness, NaN below three values
fn skewness(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    if values.len() < 3 {
        return f64::NAN;
    }
    let mean = values.iter().sum::<f64>() / n;
    let m2 = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let m3 = values.iter().map(|v| (v - mean).powi(3)).sum::<f64>() / n;
    if m2 == 0.0 {
        return 0.0;
    }
    let g1 = m3 / m2.powf(1.5);
    g1 * (n * (n - 1.0)).sqrt() / (n - 2.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn sample(subject: &str, idx: usize, time: f64, value: f64) -> SalivaSample {
        SalivaSample {
            subject: subject.to_string(),
            condition: None,
            sample: idx,
            time,
            phase: if time < 0.0 {
                SamplePhase::PreStressor
            } else {
                SamplePhase::PostStressor
            },
            value,
        }
    }

    fn cortisol() -> SalivaRawDataFrame {
        SalivaRawDataFrame::new(
            "cortisol",
            vec![
                sample("vp01", 0, -1.0, 4.0),
                sample("vp01", 1, 10.0, 8.0),
                sample("vp01", 2, 20.0, 6.0),
                sample("vp02", 0, -1.0, 5.0),
            ],
        )
        .unwrap()
    }

    fn value(table: &FeatureTable, subject: &str, feature: &str) -> f64 {
        table
            .iter()
            .find(|r| r.subject == subject && r.feature == feature)
            .unwrap()
            .value
    }

    #[test]
    fn test_validation() {
        let unordered = SalivaRawDataFrame::new(
            "cortisol",
            vec![sample("vp01", 0, 10.0, 1.0), sample("vp01", 1, 5.0, 1.0)],
        );
        assert!(matches!(unordered, Err(Error::Structure(_))));

        let duplicate = SalivaRawDataFrame::new(
            "cortisol",
            vec![sample("vp01", 0, 0.0, 1.0), sample("vp01", 0, 5.0, 1.0)],
        );
        assert!(duplicate.is_err());

        let mut late_pre = sample("vp01", 1, 5.0, 1.0);
        late_pre.phase = SamplePhase::PreStressor;
        let contradicting =
            SalivaRawDataFrame::new("cortisol", vec![sample("vp01", 0, 1.0, 1.0), late_pre]);
        assert!(contradicting.is_err());
    }

    #[test]
    fn test_samples_are_sorted_per_subject() {
        let df = SalivaRawDataFrame::new(
            "amylase",
            vec![sample("vp02", 1, 10.0, 2.0), sample("vp02", 0, 0.0, 1.0)],
        )
        .unwrap();
        assert_eq!(df.samples()[0].sample, 0);
    }

    #[test]
    fn test_max_increase() {
        let out = cortisol().max_increase(false);
        assert_abs_diff_eq!(value(&out.output, "vp01", "cortisol_max_inc"), 4.0);
        // vp02 has no post-stressor sample
        assert_eq!(out.errors.len(), 1);
        assert!(matches!(out.errors[0].1, Error::InsufficientData(_)));

        let pct = cortisol().max_increase(true);
        assert_abs_diff_eq!(value(&pct.output, "vp01", "cortisol_max_inc_percent"), 100.0);
    }

    #[test]
    fn test_auc() {
        let out = cortisol().auc();
        // (11 * 6) + (10 * 7) = 136
        assert_abs_diff_eq!(value(&out.output, "vp01", "cortisol_auc_g"), 136.0);
        assert_abs_diff_eq!(value(&out.output, "vp01", "cortisol_auc_i"), 136.0 - 4.0 * 21.0);
    }

    #[test]
    fn test_standard_features() {
        let out = cortisol().standard_features();
        let t = &out.output;
        assert_abs_diff_eq!(value(t, "vp01", "cortisol_mean"), 6.0);
        assert_abs_diff_eq!(value(t, "vp01", "cortisol_std"), 2.0);
        assert_eq!(value(t, "vp01", "cortisol_argmax"), 1.0);
        assert_abs_diff_eq!(value(t, "vp01", "cortisol_skew"), 0.0, epsilon = 1e-12);
        assert!(value(t, "vp02", "cortisol_std").is_nan());
        assert_abs_diff_eq!(value(&cortisol().initial_value().output, "vp02", "cortisol_ini_val"), 5.0);
    }

    #[test]
    fn test_skewness() {
        // pandas: pd.Series([1, 2, 10]).skew()
        assert_abs_diff_eq!(skewness(&[1.0, 2.0, 10.0]), 1.6523167403329906, epsilon = 1e-9);
    }
}
