use crate::error::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Seconds between two instants, with microsecond resolution.
pub fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    let delta = to - from;
    match delta.num_microseconds() {
        Some(us) => us as f64 / 1e6,
        None => delta.num_milliseconds() as f64 / 1e3,
    }
}

pub fn shift(t: DateTime<Utc>, seconds: f64) -> DateTime<Utc> {
    t + Duration::microseconds((seconds * 1e6).round() as i64)
}

/// A raw recording sampled at a fixed rate
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    start: DateTime<Utc>,
    sampling_rate: f64,
    samples: Vec<f64>,
}

impl Signal {
    pub fn new(start: DateTime<Utc>, sampling_rate: f64, samples: Vec<f64>) -> Result<Self> {
        if !(sampling_rate.is_finite() && sampling_rate > 0.0) {
            return Err(Error::config(format!(
                "sampling rate must be positive, got {}",
                sampling_rate
            )));
        }
        Ok(Signal {
            start,
            sampling_rate,
            samples,
        })
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        shift(self.start, self.duration())
    }

    pub fn sampling_rate(&self) -> f64 {
        self.sampling_rate
    }

    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Recording length in seconds
    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / self.sampling_rate
    }

    pub fn sample_period(&self) -> f64 {
        1.0 / self.sampling_rate
    }

    /// Samples falling in `[from, to)`, both given as absolute times.
    pub fn slice(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> &[f64] {
        let idx = |t: DateTime<Utc>| {
            let offset = seconds_between(self.start, t).max(0.0);
            ((offset * self.sampling_rate).round() as usize).min(self.samples.len())
        };
        let (a, b) = (idx(from), idx(to));
        if a >= b {
            &[]
        } else {
            &self.samples[a..b]
        }
    }

    /// New signal holding only `[from, to)`, starting at the first kept sample
    pub fn crop(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Signal> {
        let first = (seconds_between(self.start, from).max(0.0) * self.sampling_rate).round();
        let samples = self.slice(from, to).to_vec();
        if samples.is_empty() {
            return Err(Error::insufficient("no samples in the requested range"));
        }
        Signal::new(
            shift(self.start, first / self.sampling_rate),
            self.sampling_rate,
            samples,
        )
    }
}

/// A named, absolute time range of a recording
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeInterval {
    pub name: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeInterval {
    pub fn new(name: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        TimeInterval {
            name: name.to_string(),
            start,
            end,
        }
    }

    pub fn duration(&self) -> f64 {
        seconds_between(self.start, self.end)
    }
}

/// Irregular or regular series of values, indexed by seconds elapsed since `start`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    start: DateTime<Utc>,
    offsets: Vec<f64>,
    values: Vec<f64>,
}

impl TimeSeries {
    pub fn new(start: DateTime<Utc>, offsets: Vec<f64>, values: Vec<f64>) -> Result<Self> {
        if offsets.len() != values.len() {
            return Err(Error::structure(format!(
                "time series has {} offsets but {} values",
                offsets.len(),
                values.len()
            )));
        }
        if offsets.windows(2).any(|w| !(w[1] > w[0])) {
            return Err(Error::structure(
                "time series offsets must be strictly increasing",
            ));
        }
        Ok(TimeSeries {
            start,
            offsets,
            values,
        })
    }

    /// Evenly spaced series, `period` seconds apart, starting at offset 0
    pub fn regular(start: DateTime<Utc>, period: f64, values: Vec<f64>) -> Result<Self> {
        if !(period.is_finite() && period > 0.0) {
            return Err(Error::config(format!("period must be positive, got {}", period)));
        }
        let offsets = (0..values.len()).map(|i| i as f64 * period).collect();
        Self::new(start, offsets, values)
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn offsets(&self) -> &[f64] {
        &self.offsets
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.offsets.iter().copied().zip(self.values.iter().copied())
    }

    /// Elapsed time between the first and the last sample
    pub fn span(&self) -> f64 {
        match (self.offsets.first(), self.offsets.last()) {
            (Some(first), Some(last)) => last - first,
            _ => 0.0,
        }
    }

    pub fn mean(&self) -> Option<f64> {
        if self.values.is_empty() {
            None
        } else {
            Some(self.values.iter().sum::<f64>() / self.values.len() as f64)
        }
    }

    /// Median spacing between consecutive samples
    pub fn sample_period(&self) -> Option<f64> {
        if self.offsets.len() < 2 {
            return None;
        }
        let mut diffs: Vec<f64> = self.offsets.windows(2).map(|w| w[1] - w[0]).collect();
        diffs.sort_by(|a, b| a.total_cmp(b));
        Some(diffs[diffs.len() / 2])
    }

    pub fn map_values<F>(&self, f: F) -> TimeSeries
    where
        F: Fn(f64) -> f64,
    {
        TimeSeries {
            start: self.start,
            offsets: self.offsets.clone(),
            values: self.values.iter().map(|&v| f(v)).collect(),
        }
    }

    /// Linear interpolation onto `0, period, 2 * period, ...` relative to the
    /// first sample. Values outside the data are never extrapolated. The
    /// series start is kept, so offsets still count from it.
    pub fn resample(&self, period: f64) -> Result<TimeSeries> {
        if !(period.is_finite() && period > 0.0) {
            return Err(Error::config(format!(
                "resampling period must be positive, got {}",
                period
            )));
        }
        if self.is_empty() {
            return Ok(self.clone());
        }
        let origin = self.offsets[0];
        let span = self.span();
        let steps = (span / period + 1e-9).floor() as usize;

        let mut values = Vec::with_capacity(steps + 1);
        let mut j = 0;
        for k in 0..=steps {
            let t = origin + k as f64 * period;
            while j + 1 < self.offsets.len() && self.offsets[j + 1] < t {
                j += 1;
            }
            let value = if j + 1 >= self.offsets.len() || self.offsets[j] >= t {
                self.values[j]
            } else {
                let (t1, t2) = (self.offsets[j], self.offsets[j + 1]);
                let (v1, v2) = (self.values[j], self.values[j + 1]);
                v1 + (v2 - v1) * (t - t1) / (t2 - t1)
            };
            values.push(value);
        }

        let offsets = (0..values.len()).map(|k| origin + k as f64 * period).collect();
        TimeSeries::new(self.start, offsets, values)
    }

    /// Offset of the last sample, i.e. the time covered since `start`
    pub fn extent(&self) -> f64 {
        self.offsets.last().copied().unwrap_or(0.0)
    }

    /// Samples whose offset from `start` lies in `[from, to)` (or `[from, to]`
    /// when `closed`), rebased so the window starts at `from`.
    pub fn window(&self, from: f64, to: f64, closed: bool) -> TimeSeries {
        const EPS: f64 = 1e-9;
        let (offsets, values): (Vec<f64>, Vec<f64>) = self
            .iter()
            .filter(|&(t, _)| {
                t >= from - EPS
                    && if closed {
                        t <= to + EPS
                    } else {
                        t < to - EPS
                    }
            })
            .map(|(t, v)| (t - from, v))
            .unzip();
        TimeSeries {
            start: shift(self.start, from),
            offsets,
            values,
        }
    }

    /// Drops trailing samples more than `max_span` seconds after the first one
    pub fn truncate_span(&self, max_span: f64) -> TimeSeries {
        let origin = self.offsets.first().copied().unwrap_or(0.0);
        let keep = self
            .offsets
            .iter()
            .take_while(|&&t| t - origin <= max_span + 1e-9)
            .count();
        TimeSeries {
            start: self.start,
            offsets: self.offsets[..keep].to_vec(),
            values: self.values[..keep].to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
    }

    #[test]
    fn test_offsets_must_increase() {
        assert!(TimeSeries::new(t0(), vec![0.0, 1.0, 1.0], vec![1.0, 2.0, 3.0]).is_err());
        assert!(TimeSeries::new(t0(), vec![0.0, 1.0], vec![1.0]).is_err());
    }

    #[test]
    fn test_resample_linear() {
        let ts = TimeSeries::new(t0(), vec![0.0, 2.0, 4.0], vec![60.0, 80.0, 70.0]).unwrap();
        let resampled = ts.resample(1.0).unwrap();
        assert_eq!(resampled.offsets(), &[0.0, 1.0, 2.0, 3.0, 4.0]);
        assert_abs_diff_eq!(resampled.values()[1], 70.0, epsilon = 1e-9);
        assert_abs_diff_eq!(resampled.values()[3], 75.0, epsilon = 1e-9);
    }

    #[test]
    fn test_resample_irregular_origin() {
        let ts = TimeSeries::new(t0(), vec![0.4, 1.2, 2.9], vec![1.0, 2.0, 3.0]).unwrap();
        let resampled = ts.resample(1.0).unwrap();
        assert_eq!(resampled.len(), 3);
        assert_eq!(resampled.start(), t0());
        assert_eq!(resampled.offsets(), &[0.4, 1.4, 2.4]);
        assert_abs_diff_eq!(resampled.values()[0], 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_window_rebases() {
        let ts = TimeSeries::regular(t0(), 1.0, (0..10).map(|v| v as f64).collect()).unwrap();
        let w = ts.window(3.0, 6.0, false);
        assert_eq!(w.values(), &[3.0, 4.0, 5.0]);
        assert_eq!(w.offsets(), &[0.0, 1.0, 2.0]);
        let closed = ts.window(6.0, 9.0, true);
        assert_eq!(closed.values(), &[6.0, 7.0, 8.0, 9.0]);

        // offsets count from the series start, not from the first sample
        let late = TimeSeries::new(t0(), vec![2.5, 3.5, 4.5], vec![1.0, 2.0, 3.0]).unwrap();
        let w = late.window(3.0, 5.0, false);
        assert_eq!(w.values(), &[2.0, 3.0]);
        assert_eq!(w.offsets(), &[0.5, 1.5]);
        assert_eq!(w.start(), shift(t0(), 3.0));
        assert_eq!(late.extent(), 4.5);
    }

    #[test]
    fn test_signal_slice() {
        let signal = Signal::new(t0(), 4.0, (0..40).map(|v| v as f64).collect()).unwrap();
        assert_abs_diff_eq!(signal.duration(), 10.0);
        let part = signal.slice(shift(t0(), 2.0), shift(t0(), 3.0));
        assert_eq!(part, &[8.0, 9.0, 10.0, 11.0]);
        assert!(Signal::new(t0(), 0.0, vec![]).is_err());
    }

    #[test]
    fn test_signal_crop() {
        let signal = Signal::new(t0(), 4.0, (0..40).map(|v| v as f64).collect()).unwrap();
        let cropped = signal.crop(shift(t0(), 2.0), shift(t0(), 5.0)).unwrap();
        assert_eq!(cropped.start(), shift(t0(), 2.0));
        assert_eq!(cropped.len(), 12);
        assert_eq!(cropped.samples()[0], 8.0);
        assert!(signal.crop(shift(t0(), 20.0), shift(t0(), 30.0)).is_err());
    }
}
