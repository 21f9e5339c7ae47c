use crate::error::{Error, Result};
use log::{debug, trace};
use sci_rs::signal::filter::{design::Sos, sosfiltfilt_dyn};
use std::f64::consts::PI;

/// Locates R-peaks in a raw ECG segment.
pub trait BeatDetector {
    /// Returns peak times in seconds from the first sample, strictly increasing.
    fn detect(&self, samples: &[f64], sampling_rate: f64) -> Result<Vec<f64>>;
}

/// Moving-average peak detector in the style of HeartPy.
///
/// The signal is scaled, a rolling mean is computed, and for a ladder of
/// threshold lifts the candidate peak set with the smallest RR standard
/// deviation and a plausible mean rate wins.
#[derive(Debug, Clone)]
pub struct MovingAverageDetector {
    /// Rolling mean window in seconds
    pub window_seconds: f64,
    pub bpm_min: f64,
    pub bpm_max: f64,
    /// Apply a notch filter near DC before detection
    pub remove_baseline: bool,
    pub baseline_cutoff: f64,
}

impl Default for MovingAverageDetector {
    fn default() -> Self {
        MovingAverageDetector {
            window_seconds: 0.75,
            bpm_min: 40.0,
            bpm_max: 180.0,
            remove_baseline: true,
            baseline_cutoff: 0.05,
        }
    }
}

const MA_PERCS: [f64; 18] = [
    5.0, 10.0, 15.0, 20.0, 25.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0, 90.0, 100.0, 110.0, 120.0,
    150.0, 200.0, 300.0,
];

impl BeatDetector for MovingAverageDetector {
    fn detect(&self, samples: &[f64], sampling_rate: f64) -> Result<Vec<f64>> {
        if !(sampling_rate.is_finite() && sampling_rate > 0.0) {
            return Err(Error::config(format!(
                "sampling rate must be positive, got {}",
                sampling_rate
            )));
        }
        let window = (self.window_seconds * sampling_rate) as usize;
        if samples.len() < 2 * window.max(1) {
            return Err(Error::insufficient(format!(
                "{} samples are too short for peak detection",
                samples.len()
            )));
        }

        let filtered = if self.remove_baseline {
            remove_baseline_wander(samples, sampling_rate, self.baseline_cutoff)?
        } else {
            samples.to_vec()
        };
        let scaled = scale_data(&filtered, 0.0, 1024.0);
        let rol_mean = rolling_mean(&scaled, self.window_seconds, sampling_rate);
        let peaks = fit_peaks(&scaled, &rol_mean, sampling_rate, self.bpm_min, self.bpm_max);

        Ok(peaks.into_iter().map(|i| i as f64 / sampling_rate).collect())
    }
}

/// Design notch digital filter.
///
/// `w0` is the frequency to remove in the same units as `fs`; `q` is the
/// quality factor (`w0 / bandwidth`). Returns `(b, a)` coefficients.
fn design_notch_filter(w0: f64, q: f64, fs: f64) -> Result<([f64; 3], [f64; 3])> {
    let w0 = 2.0 * w0 / fs;
    if !(w0 > 0.0 && w0 < 1.0) {
        return Err(Error::config(format!(
            "notch frequency must lie between 0 and Nyquist, got normalized {}",
            w0
        )));
    }

    let bw = w0 / q * PI;
    let w0 = w0 * PI;

    let beta = (bw / 2.0).tan();
    let gain = 1.0 / (1.0 + beta);

    let b = [gain, -2.0 * w0.cos() * gain, gain];
    let a = [1.0, -2.0 * gain * w0.cos(), 2.0 * gain - 1.0];
    Ok((b, a))
}

/// Removes baseline wander using a zero-phase notch filter near DC
pub fn remove_baseline_wander(data: &[f64], sample_rate: f64, cutoff: f64) -> Result<Vec<f64>> {
    // fixed Q to match HeartPy
    let (b, a) = design_notch_filter(cutoff, 0.005, sample_rate)?;
    let sos = vec![Sos::new(b, [1.0, a[1] / a[0], a[2] / a[0]])];
    Ok(sosfiltfilt_dyn(data.iter(), &sos))
}

/// Scale data to the given range
pub fn scale_data(data: &[f64], lower: f64, upper: f64) -> Vec<f64> {
    let min_val = data.iter().fold(f64::INFINITY, |a, &b| a.min(b));
    let max_val = data.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
    let range = max_val - min_val;
    if !(range > 0.0) {
        return vec![lower; data.len()];
    }
    data.iter()
        .map(|&x| (upper - lower) * ((x - min_val) / range) + lower)
        .collect()
}

/// Centered uniform filter, like scipy's uniform_filter1d
fn rolling_mean(data: &[f64], window_size: f64, sample_rate: f64) -> Vec<f64> {
    let size = (window_size * sample_rate) as usize;
    let half = size / 2;
    trace!("Rolling mean window size: {} samples", size);

    let mut prefix = Vec::with_capacity(data.len() + 1);
    prefix.push(0.0);
    for &x in data {
        prefix.push(prefix[prefix.len() - 1] + x);
    }

    (0..data.len())
        .map(|i| {
            let start = i.saturating_sub(half);
            let end = (i + half + 1).min(data.len());
            (prefix[end] - prefix[start]) / (end - start) as f64
        })
        .collect()
}

/// Indices of the local maxima of every run of samples above the lifted rolling mean
fn detect_peaks(data: &[f64], rol_mean: &[f64], ma_perc: f64) -> Vec<usize> {
    let mn = rol_mean.iter().map(|&x| x / 100.0).sum::<f64>() / rol_mean.len() as f64 * ma_perc;

    let above: Vec<usize> = data
        .iter()
        .zip(rol_mean.iter())
        .enumerate()
        .filter(|(_, (&d, &r))| d > r + mn)
        .map(|(i, _)| i)
        .collect();

    if above.is_empty() {
        return Vec::new();
    }

    let mut peaks = Vec::new();
    let mut run_start = 0;
    for k in 1..=above.len() {
        if k == above.len() || above[k] - above[k - 1] > 1 {
            let run = &above[run_start..k];
            if let Some(&best) = run.iter().max_by(|&&a, &&b| data[a].total_cmp(&data[b])) {
                peaks.push(best);
            }
            run_start = k;
        }
    }
    peaks
}

fn rr_std(peaks: &[usize], sample_rate: f64) -> f64 {
    let rr: Vec<f64> = peaks
        .windows(2)
        .map(|w| (w[1] - w[0]) as f64 / sample_rate * 1000.0)
        .collect();
    if rr.len() < 2 {
        return f64::INFINITY;
    }
    let mean = rr.iter().sum::<f64>() / rr.len() as f64;
    (rr.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (rr.len() - 1) as f64).sqrt()
}

fn fit_peaks(
    data: &[f64],
    rol_mean: &[f64],
    sample_rate: f64,
    bpm_min: f64,
    bpm_max: f64,
) -> Vec<usize> {
    let duration = data.len() as f64 / sample_rate;
    let mut best: Option<(f64, f64, Vec<usize>)> = None;

    for ma_perc in MA_PERCS {
        let peaks = detect_peaks(data, rol_mean, ma_perc);
        let bpm = peaks.len() as f64 / duration * 60.0;
        let rrsd = rr_std(&peaks, sample_rate);
        trace!(
            "ma_perc: {}, peaks: {}, bpm: {:.1}, rrsd: {:.1}",
            ma_perc,
            peaks.len(),
            bpm,
            rrsd
        );

        if !(rrsd.is_finite() && bpm >= bpm_min && bpm <= bpm_max) {
            continue;
        }
        if best.as_ref().map_or(true, |(best_rrsd, _, _)| rrsd < *best_rrsd) {
            best = Some((rrsd, ma_perc, peaks));
        }
    }

    match best {
        Some((rrsd, ma_perc, peaks)) => {
            debug!(
                "Selected {} peaks - rrsd: {:.1}, ma_perc: {}",
                peaks.len(),
                rrsd,
                ma_perc
            );
            peaks
        }
        None => {
            debug!("No valid peaks found with any ma_perc");
            Vec::new()
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Gaussian spikes at the given beat times on a flat baseline
    pub(crate) fn synthetic_ecg(beat_times: &[f64], fs: f64, duration: f64) -> Vec<f64> {
        let n = (duration * fs) as usize;
        let mut out = vec![0.0; n];
        for &bt in beat_times {
            let center = (bt * fs).round() as i64;
            for k in -8..=8i64 {
                let idx = center + k;
                if idx >= 0 && (idx as usize) < n {
                    let dt = (idx as f64 / fs - bt) / 0.01;
                    out[idx as usize] += (-dt * dt).exp();
                }
            }
        }
        out
    }

    #[test]
    fn test_detects_regular_beats() {
        let fs = 256.0;
        let beats: Vec<f64> = (0..75).map(|i| 0.4 + i as f64 * 0.8).collect();
        let ecg = synthetic_ecg(&beats, fs, 60.0);
        let detector = MovingAverageDetector {
            remove_baseline: false,
            ..Default::default()
        };
        let peaks = detector.detect(&ecg, fs).unwrap();
        assert_eq!(peaks.len(), beats.len());
        for (found, truth) in peaks.iter().zip(beats.iter()) {
            assert!((found - truth).abs() <= 1.0 / fs);
        }
    }

    #[test]
    fn test_too_short_signal() {
        let detector = MovingAverageDetector::default();
        assert!(matches!(
            detector.detect(&[0.0; 100], 256.0),
            Err(Error::InsufficientData(_))
        ));
    }

    #[test]
    fn test_flat_signal_has_no_peaks() {
        let detector = MovingAverageDetector {
            remove_baseline: false,
            ..Default::default()
        };
        assert!(detector.detect(&vec![1.0; 2560], 256.0).unwrap().is_empty());
    }

    #[test]
    fn test_scale_data() {
        assert_eq!(scale_data(&[1.0, 2.0, 3.0], 0.0, 1024.0), vec![0.0, 512.0, 1024.0]);
    }
}
