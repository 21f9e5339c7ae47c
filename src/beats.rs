use crate::error::{Error, Result};
use crate::signal::TimeSeries;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Classification of a single detected beat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BeatClass {
    Normal,
    /// Flagged by a statistical rule only
    OutlierStatistical,
    /// Flagged by the physiological range rule only
    OutlierPhysiological,
    /// Flagged by both statistical and physiological rules
    OutlierCombined,
}

impl BeatClass {
    pub fn is_outlier(&self) -> bool {
        !matches!(self, BeatClass::Normal)
    }
}

/// Detected R-peaks of one phase together with their RR intervals.
///
/// Raw detections are never removed; correction only changes `classes`, and
/// the corrected interval series is computed on demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeatSeries {
    peaks: Vec<f64>,
    rr_ms: Vec<f64>,
    classes: Vec<BeatClass>,
}

impl BeatSeries {
    /// Builds a series from peak times in seconds.
    ///
    /// The first beat has no predecessor, so its interval is imputed with the
    /// mean of all following intervals.
    pub fn from_peaks(peaks: Vec<f64>) -> Result<Self> {
        if peaks.len() < 2 {
            return Err(Error::insufficient(format!(
                "need at least 2 beats, got {}",
                peaks.len()
            )));
        }
        if peaks.iter().any(|p| !p.is_finite()) || peaks.windows(2).any(|w| !(w[1] > w[0])) {
            return Err(Error::processing("beat times must be finite and strictly increasing"));
        }

        let mut rr_ms = Vec::with_capacity(peaks.len());
        rr_ms.push(0.0);
        rr_ms.extend(peaks.windows(2).map(|w| (w[1] - w[0]) * 1000.0));
        rr_ms[0] = rr_ms[1..].iter().sum::<f64>() / (rr_ms.len() - 1) as f64;

        let classes = vec![BeatClass::Normal; peaks.len()];
        Ok(BeatSeries {
            peaks,
            rr_ms,
            classes,
        })
    }

    /// Returns a copy carrying the given classification
    pub fn with_classes(&self, classes: Vec<BeatClass>) -> Result<Self> {
        if classes.len() != self.peaks.len() {
            return Err(Error::processing(format!(
                "classification has {} entries for {} beats",
                classes.len(),
                self.peaks.len()
            )));
        }
        Ok(BeatSeries {
            peaks: self.peaks.clone(),
            rr_ms: self.rr_ms.clone(),
            classes,
        })
    }

    pub fn peaks(&self) -> &[f64] {
        &self.peaks
    }

    pub fn rr_ms(&self) -> &[f64] {
        &self.rr_ms
    }

    pub fn classes(&self) -> &[BeatClass] {
        &self.classes
    }

    pub fn len(&self) -> usize {
        self.peaks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peaks.is_empty()
    }

    pub fn outlier_count(&self) -> usize {
        self.classes.iter().filter(|c| c.is_outlier()).count()
    }

    pub fn outlier_fraction(&self) -> f64 {
        if self.classes.is_empty() {
            0.0
        } else {
            self.outlier_count() as f64 / self.classes.len() as f64
        }
    }

    /// RR intervals with flagged beats replaced by linear interpolation between
    /// the nearest normal neighbours. Leading and trailing outliers take the
    /// nearest normal value. Index 0 is the imputed interval of the first beat.
    pub fn corrected_rr(&self) -> Result<Vec<f64>> {
        interpolate_outliers(&self.rr_ms, &self.classes)
    }

    /// The `len() - 1` measured inter-beat intervals, corrected like
    /// [`corrected_rr`](Self::corrected_rr) but without the imputed first one
    /// taking part in the interpolation.
    pub fn corrected_intervals(&self) -> Result<Vec<f64>> {
        interpolate_outliers(&self.rr_ms[1..], &self.classes[1..])
    }

    /// Instantaneous heart rate per beat (60000 / corrected RR in ms)
    pub fn heart_rate(&self) -> Result<Vec<f64>> {
        Ok(self
            .corrected_rr()?
            .into_iter()
            .map(|rr| 60_000.0 / rr)
            .collect())
    }

    /// Heart rate indexed by beat time, relative to `start`
    pub fn heart_rate_series(&self, start: DateTime<Utc>) -> Result<TimeSeries> {
        TimeSeries::new(start, self.peaks.clone(), self.heart_rate()?)
    }
}

fn interpolate_outliers(rr_ms: &[f64], classes: &[BeatClass]) -> Result<Vec<f64>> {
    let valid: Vec<usize> = (0..rr_ms.len())
        .filter(|&i| !classes[i].is_outlier())
        .collect();
    if valid.is_empty() {
        return Err(Error::processing("all beats were flagged as outliers"));
    }
    if valid.len() == rr_ms.len() {
        return Ok(rr_ms.to_vec());
    }

    let mut corrected = rr_ms.to_vec();
    let mut next = 0;
    for i in 0..corrected.len() {
        if !classes[i].is_outlier() {
            continue;
        }
        while next < valid.len() && valid[next] < i {
            next += 1;
        }
        corrected[i] = match (next.checked_sub(1).map(|p| valid[p]), valid.get(next)) {
            (Some(a), Some(&b)) => {
                let weight = (i - a) as f64 / (b - a) as f64;
                rr_ms[a] + (rr_ms[b] - rr_ms[a]) * weight
            }
            (Some(a), None) => rr_ms[a],
            (None, Some(&b)) => rr_ms[b],
            (None, None) => unreachable!("valid is non-empty"),
        };
    }
    Ok(corrected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_constant_interval_gives_sixty_bpm() {
        let beats = BeatSeries::from_peaks((0..20).map(|i| i as f64).collect()).unwrap();
        for hr in beats.heart_rate().unwrap() {
            assert_eq!(hr, 60.0);
        }
    }

    #[test]
    fn test_first_interval_is_imputed() {
        let beats = BeatSeries::from_peaks(vec![0.0, 0.8, 1.8, 2.7]).unwrap();
        assert_abs_diff_eq!(beats.rr_ms()[0], 900.0, epsilon = 1e-9);
        assert_abs_diff_eq!(beats.rr_ms()[2], 1000.0, epsilon = 1e-9);
    }

    #[test]
    fn test_no_outliers_is_identity() {
        let beats = BeatSeries::from_peaks(vec![0.0, 0.8, 1.7, 2.5, 3.4]).unwrap();
        assert_eq!(beats.corrected_rr().unwrap(), beats.rr_ms());
    }

    #[test]
    fn test_outliers_are_interpolated() {
        let beats = BeatSeries::from_peaks(vec![0.0, 1.0, 2.0, 2.3, 4.0, 5.2]).unwrap();
        let mut classes = vec![BeatClass::Normal; 6];
        classes[3] = BeatClass::OutlierStatistical;
        classes[4] = BeatClass::OutlierPhysiological;
        let flagged = beats.with_classes(classes).unwrap();
        let corrected = flagged.corrected_rr().unwrap();
        // neighbours: beat 2 (1000 ms) and beat 5 (1200 ms)
        assert_abs_diff_eq!(corrected[3], 1000.0 + 200.0 / 3.0, epsilon = 1e-9);
        assert_abs_diff_eq!(corrected[4], 1000.0 + 400.0 / 3.0, epsilon = 1e-9);
        assert_eq!(flagged.rr_ms()[3], beats.rr_ms()[3]);
        assert_eq!(flagged.len(), 6);
    }

    #[test]
    fn test_edge_outliers_take_nearest_value() {
        let beats = BeatSeries::from_peaks(vec![0.0, 1.0, 2.0, 3.5]).unwrap();
        let classes = vec![
            BeatClass::OutlierCombined,
            BeatClass::Normal,
            BeatClass::Normal,
            BeatClass::OutlierStatistical,
        ];
        let corrected = beats.with_classes(classes).unwrap().corrected_rr().unwrap();
        assert_eq!(corrected[0], 1000.0);
        assert_eq!(corrected[3], 1000.0);
    }

    #[test]
    fn test_intervals_skip_imputed_value() {
        let beats = BeatSeries::from_peaks(vec![0.0, 1.0, 2.0, 3.5]).unwrap();
        let classes = vec![
            BeatClass::Normal,
            BeatClass::OutlierStatistical,
            BeatClass::Normal,
            BeatClass::Normal,
        ];
        let flagged = beats.with_classes(classes).unwrap();
        // rr_ms[0] is the imputed mean (1166.7 ms) and must not leak in
        let intervals = flagged.corrected_intervals().unwrap();
        assert_eq!(intervals.len(), 3);
        assert_abs_diff_eq!(intervals[0], 1000.0, epsilon = 1e-9);
        assert_abs_diff_eq!(intervals[2], 1500.0, epsilon = 1e-9);
    }

    #[test]
    fn test_all_flagged_fails() {
        let beats = BeatSeries::from_peaks(vec![0.0, 1.0, 2.0]).unwrap();
        let flagged = beats
            .with_classes(vec![BeatClass::OutlierStatistical; 3])
            .unwrap();
        assert!(matches!(flagged.corrected_rr(), Err(Error::Processing(_))));
    }

    #[test]
    fn test_rejects_unsorted_peaks() {
        assert!(BeatSeries::from_peaks(vec![0.0, 2.0, 1.0]).is_err());
        assert!(matches!(
            BeatSeries::from_peaks(vec![1.0]),
            Err(Error::InsufficientData(_))
        ));
    }
}
