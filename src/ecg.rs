use crate::beats::BeatSeries;
use crate::data::PhaseNode;
use crate::detection::BeatDetector;
use crate::error::{Error, Result};
use crate::outliers::{self, OutlierConfig};
use crate::signal::{seconds_between, Signal, TimeInterval, TimeSeries};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

/// Name of the single phase used when no time intervals are given
pub const DEFAULT_PHASE: &str = "Data";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EcgOptions {
    pub outlier_correction: OutlierConfig,
    /// Phases shorter than this (seconds) are not analyzed
    pub min_phase_duration: f64,
    /// Fraction of flagged beats above which a data-quality warning is raised
    pub max_outlier_fraction: f64,
}

impl Default for EcgOptions {
    fn default() -> Self {
        EcgOptions {
            outlier_correction: OutlierConfig::default(),
            min_phase_duration: 10.0,
            max_outlier_fraction: 0.5,
        }
    }
}

impl EcgOptions {
    fn validate(&self) -> Result<()> {
        self.outlier_correction.validate()?;
        if !(self.min_phase_duration.is_finite() && self.min_phase_duration >= 0.0) {
            return Err(Error::config("minimum phase duration must be non-negative"));
        }
        if !(0.0..=1.0).contains(&self.max_outlier_fraction) {
            return Err(Error::config("outlier fraction limit must lie in [0, 1]"));
        }
        Ok(())
    }
}

/// Processing output of one phase
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseResult {
    pub interval: TimeInterval,
    /// Detected beats carrying their outlier classification
    pub beats: BeatSeries,
    /// Heart rate (bpm) per beat, offsets relative to the phase start
    pub heart_rate: TimeSeries,
}

#[derive(Debug, Clone, Default)]
pub struct EcgResult {
    pub phases: Vec<(String, PhaseResult)>,
    pub errors: Vec<(String, Error)>,
    pub warnings: Vec<String>,
}

impl EcgResult {
    pub fn phase(&self, name: &str) -> Option<&PhaseResult> {
        self.phases.iter().find(|(n, _)| n == name).map(|(_, r)| r)
    }

    /// Heart-rate series of all successful phases, in phase order
    pub fn heart_rate_tree(&self) -> PhaseNode<TimeSeries> {
        PhaseNode::Branch(
            self.phases
                .iter()
                .map(|(name, result)| (name.clone(), PhaseNode::Leaf(result.heart_rate.clone())))
                .collect(),
        )
    }
}

/// Turns one raw ECG recording into per-phase beats and heart rate
#[derive(Debug, Clone)]
pub struct EcgProcessor<'a> {
    signal: &'a Signal,
    intervals: Vec<TimeInterval>,
}

impl<'a> EcgProcessor<'a> {
    /// Validates that `intervals` are sorted, gap-free, non-overlapping and
    /// cover the whole signal (within one sample period).
    pub fn new(signal: &'a Signal, intervals: Option<Vec<TimeInterval>>) -> Result<Self> {
        let intervals = match intervals {
            None => vec![TimeInterval::new(DEFAULT_PHASE, signal.start(), signal.end())],
            Some(intervals) => {
                validate_intervals(signal, &intervals)?;
                intervals
            }
        };
        Ok(EcgProcessor { signal, intervals })
    }

    pub fn intervals(&self) -> &[TimeInterval] {
        &self.intervals
    }

    /// Runs detection, outlier correction and heart-rate derivation for every
    /// phase. A failing phase is reported in `errors` and does not stop the
    /// remaining phases; invalid options fail the whole call.
    pub fn process(&self, detector: &dyn BeatDetector, options: &EcgOptions) -> Result<EcgResult> {
        options.validate()?;
        let mut result = EcgResult::default();

        for interval in &self.intervals {
            match self.process_phase(interval, detector, options) {
                Ok(phase) => {
                    let fraction = phase.beats.outlier_fraction();
                    if fraction > options.max_outlier_fraction {
                        let msg = format!(
                            "{}: {:.0}% of beats flagged as outliers",
                            interval.name,
                            fraction * 100.0
                        );
                        warn!("Data quality: {}", msg);
                        result.warnings.push(msg);
                    }
                    result.phases.push((interval.name.clone(), phase));
                }
                Err(e) => {
                    warn!("Phase '{}' failed: {}", interval.name, e);
                    result.errors.push((interval.name.clone(), e));
                }
            }
        }

        info!(
            "Processed {} phases ({} failed)",
            self.intervals.len(),
            result.errors.len()
        );
        Ok(result)
    }

    fn process_phase(
        &self,
        interval: &TimeInterval,
        detector: &dyn BeatDetector,
        options: &EcgOptions,
    ) -> Result<PhaseResult> {
        let samples = self.signal.slice(interval.start, interval.end);
        let fs = self.signal.sampling_rate();
        let duration = samples.len() as f64 / fs;
        if duration < options.min_phase_duration {
            return Err(Error::processing(format!(
                "phase '{}' has {:.1}s of data, need at least {:.1}s",
                interval.name, duration, options.min_phase_duration
            )));
        }

        let peaks = detector
            .detect(samples, fs)
            .map_err(|e| Error::processing(format!("beat detection failed: {}", e)))?;
        if peaks.len() < 3 {
            return Err(Error::processing(format!(
                "only {} beats detected in phase '{}'",
                peaks.len(),
                interval.name
            )));
        }
        debug!("Phase '{}': {} beats detected", interval.name, peaks.len());

        // slicing rounds to whole samples; keep beat times relative to the interval start
        let slice_offset = (seconds_between(self.signal.start(), interval.start).max(0.0) * fs)
            .round()
            / fs
            - seconds_between(self.signal.start(), interval.start).max(0.0);
        let peaks: Vec<f64> = peaks.into_iter().map(|p| p + slice_offset).collect();

        let beats = BeatSeries::from_peaks(peaks)
            .map_err(|e| Error::processing(format!("invalid beats: {}", e)))?;
        let beats = outliers::correct(&beats, &options.outlier_correction)?;
        let heart_rate = beats.heart_rate_series(interval.start)?;

        Ok(PhaseResult {
            interval: interval.clone(),
            beats,
            heart_rate,
        })
    }
}

fn validate_intervals(signal: &Signal, intervals: &[TimeInterval]) -> Result<()> {
    if intervals.is_empty() {
        return Err(Error::config("time intervals must not be empty"));
    }
    let tolerance = signal.sample_period() + 1e-6;

    for (i, interval) in intervals.iter().enumerate() {
        if interval.name.is_empty() {
            return Err(Error::config("time interval names must not be empty"));
        }
        if intervals[..i].iter().any(|other| other.name == interval.name) {
            return Err(Error::config(format!(
                "time interval '{}' given twice",
                interval.name
            )));
        }
        if interval.end <= interval.start {
            return Err(Error::config(format!(
                "time interval '{}' ends before it starts",
                interval.name
            )));
        }
    }

    for pair in intervals.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        if next.start < prev.start {
            return Err(Error::config(format!(
                "time intervals are not sorted: '{}' starts before '{}'",
                next.name, prev.name
            )));
        }
        let gap = seconds_between(prev.end, next.start);
        if gap.abs() > tolerance {
            return Err(Error::config(format!(
                "time intervals '{}' and '{}' {} by {:.3}s",
                prev.name,
                next.name,
                if gap > 0.0 { "leave a gap" } else { "overlap" },
                gap.abs()
            )));
        }
    }

    let head = seconds_between(signal.start(), intervals[0].start);
    let tail = seconds_between(intervals[intervals.len() - 1].end, signal.end());
    if head > tolerance || tail > tolerance {
        return Err(Error::config(format!(
            "time intervals leave {:.3}s at the start and {:.3}s at the end of the signal uncovered",
            head.max(0.0),
            tail.max(0.0)
        )));
    }
    Ok(())
}
