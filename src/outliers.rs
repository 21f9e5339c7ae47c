//! Rule-based classification of erroneous beats.
//!
//! Every rule looks at the RR interval series of a [`BeatSeries`] and flags
//! individual beats. Flags of all enabled rules are combined with a
//! [`Composition`] policy into one [`BeatClass`] per beat.

use crate::beats::{BeatClass, BeatSeries};
use crate::error::{Error, Result};
use log::debug;
use serde::{Deserialize, Serialize};

pub const DEFAULT_STATISTICAL_RR_THRESHOLD: f64 = 2.576;
pub const DEFAULT_STATISTICAL_RR_DIFF_THRESHOLD: f64 = 1.96;
pub const DEFAULT_PHYSIOLOGICAL_RANGE: (f64, f64) = (50.0, 180.0);

/// Interface for outlier rules working on a full RR interval series
pub trait OutlierCriterion {
    /// One flag per interval, `true` meaning the beat is an outlier
    fn flags(&self, rr_ms: &[f64]) -> Vec<bool>;

    fn is_statistical(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OutlierRule {
    /// |z-score| of the RR interval above `threshold`
    StatisticalRr { threshold: f64 },
    /// |z-score| of successive RR differences above `threshold`
    StatisticalRrDiff { threshold: f64 },
    /// Instantaneous heart rate outside `[min_bpm, max_bpm]`
    Physiological { min_bpm: f64, max_bpm: f64 },
}

impl OutlierRule {
    pub fn statistical_rr() -> Self {
        OutlierRule::StatisticalRr {
            threshold: DEFAULT_STATISTICAL_RR_THRESHOLD,
        }
    }

    pub fn statistical_rr_diff() -> Self {
        OutlierRule::StatisticalRrDiff {
            threshold: DEFAULT_STATISTICAL_RR_DIFF_THRESHOLD,
        }
    }

    pub fn physiological() -> Self {
        OutlierRule::Physiological {
            min_bpm: DEFAULT_PHYSIOLOGICAL_RANGE.0,
            max_bpm: DEFAULT_PHYSIOLOGICAL_RANGE.1,
        }
    }

    fn validate(&self) -> Result<()> {
        match *self {
            OutlierRule::StatisticalRr { threshold } | OutlierRule::StatisticalRrDiff { threshold } => {
                if !(threshold.is_finite() && threshold > 0.0) {
                    return Err(Error::config(format!(
                        "z-score threshold must be positive, got {}",
                        threshold
                    )));
                }
            }
            OutlierRule::Physiological { min_bpm, max_bpm } => {
                if !(min_bpm > 0.0 && max_bpm > min_bpm && max_bpm.is_finite()) {
                    return Err(Error::config(format!(
                        "invalid physiological range ({}, {})",
                        min_bpm, max_bpm
                    )));
                }
            }
        }
        Ok(())
    }

    fn kind(&self) -> std::mem::Discriminant<OutlierRule> {
        std::mem::discriminant(self)
    }
}

/// z-scores using the sample standard deviation; all zero for constant input
fn z_scores(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    if n < 2 {
        return vec![0.0; n];
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    let std = (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64).sqrt();
    // rounding noise of a constant series must not produce flags
    if std <= 1e-9 * mean.abs().max(1.0) {
        return vec![0.0; n];
    }
    values.iter().map(|v| (v - mean) / std).collect()
}

impl OutlierCriterion for OutlierRule {
    fn flags(&self, rr_ms: &[f64]) -> Vec<bool> {
        match *self {
            OutlierRule::StatisticalRr { threshold } => z_scores(rr_ms)
                .into_iter()
                .map(|z| z.abs() > threshold)
                .collect(),
            OutlierRule::StatisticalRrDiff { threshold } => {
                let mut diffs = Vec::with_capacity(rr_ms.len());
                if !rr_ms.is_empty() {
                    diffs.push(0.0);
                }
                diffs.extend(rr_ms.windows(2).map(|w| w[1] - w[0]));
                z_scores(&diffs)
                    .into_iter()
                    .map(|z| z.abs() > threshold)
                    .collect()
            }
            OutlierRule::Physiological { min_bpm, max_bpm } => rr_ms
                .iter()
                .map(|&rr| {
                    let bpm = 60_000.0 / rr;
                    !(bpm >= min_bpm && bpm <= max_bpm)
                })
                .collect(),
        }
    }

    fn is_statistical(&self) -> bool {
        !matches!(self, OutlierRule::Physiological { .. })
    }
}

/// How flags of several rules combine into one decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Composition {
    /// A beat is an outlier if any rule flags it
    #[default]
    Any,
    /// A beat is an outlier only if every rule flags it
    All,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutlierConfig {
    pub rules: Vec<OutlierRule>,
    pub composition: Composition,
}

impl Default for OutlierConfig {
    fn default() -> Self {
        OutlierConfig {
            rules: vec![
                OutlierRule::statistical_rr(),
                OutlierRule::statistical_rr_diff(),
                OutlierRule::physiological(),
            ],
            composition: Composition::Any,
        }
    }
}

impl OutlierConfig {
    pub fn new(rules: Vec<OutlierRule>, composition: Composition) -> Result<Self> {
        let config = OutlierConfig { rules, composition };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.rules.is_empty() {
            return Err(Error::config("outlier correction needs at least one rule"));
        }
        for (i, rule) in self.rules.iter().enumerate() {
            rule.validate()?;
            if self.rules[..i].iter().any(|r| r.kind() == rule.kind()) {
                return Err(Error::config(format!("outlier rule {:?} given twice", rule)));
            }
        }
        Ok(())
    }
}

/// Classifies every beat of `beats`. Pure: the same input always gives the
/// same classification.
pub fn classify(beats: &BeatSeries, config: &OutlierConfig) -> Result<Vec<BeatClass>> {
    config.validate()?;
    let rr = beats.rr_ms();
    let rule_flags: Vec<(bool, Vec<bool>)> = config
        .rules
        .iter()
        .map(|rule| (rule.is_statistical(), rule.flags(rr)))
        .collect();

    let classes: Vec<BeatClass> = (0..rr.len())
        .map(|i| {
            let hits = rule_flags.iter().filter(|(_, f)| f[i]);
            let flagged = match config.composition {
                Composition::Any => rule_flags.iter().any(|(_, f)| f[i]),
                Composition::All => rule_flags.iter().all(|(_, f)| f[i]),
            };
            if !flagged {
                return BeatClass::Normal;
            }
            let (mut statistical, mut physiological) = (false, false);
            for (is_stat, _) in hits {
                if *is_stat {
                    statistical = true;
                } else {
                    physiological = true;
                }
            }
            match (statistical, physiological) {
                (true, true) => BeatClass::OutlierCombined,
                (false, true) => BeatClass::OutlierPhysiological,
                _ => BeatClass::OutlierStatistical,
            }
        })
        .collect();

    debug!(
        "classify: {}/{} beats flagged ({:?} over {} rules)",
        classes.iter().filter(|c| c.is_outlier()).count(),
        classes.len(),
        config.composition,
        config.rules.len()
    );

    Ok(classes)
}

/// Classifies `beats` and returns a new series carrying the classification
pub fn correct(beats: &BeatSeries, config: &OutlierConfig) -> Result<BeatSeries> {
    beats.with_classes(classify(beats, config)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(rr_ms: &[f64]) -> BeatSeries {
        let mut t = 0.0;
        let mut peaks = vec![t];
        for rr in rr_ms {
            t += rr / 1000.0;
            peaks.push(t);
        }
        BeatSeries::from_peaks(peaks).unwrap()
    }

    #[test]
    fn test_clean_series_has_no_outliers() {
        let beats = series(&[800.0; 50]);
        let classes = classify(&beats, &OutlierConfig::default()).unwrap();
        assert!(classes.iter().all(|c| *c == BeatClass::Normal));
    }

    #[test]
    fn test_physiological_rule() {
        let mut rr = vec![800.0; 30];
        rr[10] = 250.0; // 240 bpm
        let beats = series(&rr);
        let config =
            OutlierConfig::new(vec![OutlierRule::physiological()], Composition::Any).unwrap();
        let classes = classify(&beats, &config).unwrap();
        assert_eq!(classes[11], BeatClass::OutlierPhysiological);
        assert_eq!(classes.iter().filter(|c| c.is_outlier()).count(), 1);
    }

    #[test]
    fn test_combined_label() {
        let mut rr: Vec<f64> = (0..60).map(|i| 800.0 + (i % 3) as f64 * 10.0).collect();
        rr[30] = 250.0;
        let beats = series(&rr);
        let classes = classify(&beats, &OutlierConfig::default()).unwrap();
        assert_eq!(classes[31], BeatClass::OutlierCombined);
    }

    #[test]
    fn test_all_composition_is_stricter() {
        let mut rr: Vec<f64> = (0..60).map(|i| 800.0 + (i % 4) as f64 * 5.0).collect();
        rr[20] = 1150.0; // 52 bpm: plausible but statistically extreme
        let beats = series(&rr);
        let any = OutlierConfig::new(
            vec![OutlierRule::statistical_rr(), OutlierRule::physiological()],
            Composition::Any,
        )
        .unwrap();
        let all = OutlierConfig {
            composition: Composition::All,
            ..any.clone()
        };
        let any_classes = classify(&beats, &any).unwrap();
        let all_classes = classify(&beats, &all).unwrap();
        assert_eq!(any_classes[21], BeatClass::OutlierStatistical);
        assert_eq!(all_classes[21], BeatClass::Normal);
    }

    #[test]
    fn test_classification_is_deterministic() {
        let rr: Vec<f64> = (0..40).map(|i| 700.0 + ((i * 37) % 11) as f64 * 20.0).collect();
        let beats = series(&rr);
        let config = OutlierConfig::default();
        assert_eq!(
            classify(&beats, &config).unwrap(),
            classify(&beats, &config).unwrap()
        );
    }

    #[test]
    fn test_invalid_config() {
        assert!(OutlierConfig::new(vec![], Composition::Any).is_err());
        assert!(OutlierConfig::new(
            vec![OutlierRule::Physiological {
                min_bpm: 120.0,
                max_bpm: 60.0
            }],
            Composition::Any
        )
        .is_err());
        assert!(OutlierConfig::new(
            vec![OutlierRule::statistical_rr(), OutlierRule::statistical_rr()],
            Composition::Any
        )
        .is_err());
    }
}
