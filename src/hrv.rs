//! Heart-rate variability metrics computed from the corrected inter-beat
//! intervals. The imputed interval of the first beat never enters a metric.
//!
//! Three metric families are available:
//! - time domain: MeanNN, MedianNN, SDNN, RMSSD, SDSD, CVNN, pNN20, pNN50
//! - frequency domain: VLF, LF, HF and total power, LF/HF, normalized LF/HF
//! - nonlinear: Poincaré SD1, SD2, SD1/SD2 and ellipse area S
//!
//! A family that lacks beats fails on its own; the others are still computed.

use crate::beats::BeatSeries;
use crate::error::{Error, Result};
use crate::outliers::{self, OutlierConfig};
use log::debug;
use rustfft::{num_complex::Complex, FftPlanner};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

pub const MIN_BEATS_TIME: usize = 3;
pub const MIN_BEATS_NONLINEAR: usize = 4;
pub const MIN_BEATS_FREQUENCY: usize = 100;

/// Resampling rate of the RR series before spectral estimation (Hz)
const INTERPOLATION_RATE: f64 = 4.0;

const VLF_BAND: (f64, f64) = (0.0033, 0.04);
const LF_BAND: (f64, f64) = (0.04, 0.15);
const HF_BAND: (f64, f64) = (0.15, 0.4);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HrvFamily {
    Time,
    Frequency,
    Nonlinear,
}

impl HrvFamily {
    pub fn min_beats(&self) -> usize {
        match self {
            HrvFamily::Time => MIN_BEATS_TIME,
            HrvFamily::Frequency => MIN_BEATS_FREQUENCY,
            HrvFamily::Nonlinear => MIN_BEATS_NONLINEAR,
        }
    }
}

/// One-sided power spectrum of an evenly sampled series
#[derive(Debug, Clone, PartialEq)]
pub struct Spectrum {
    pub frequencies: Vec<f64>,
    pub power: Vec<f64>,
}

impl Spectrum {
    /// Integrated power in `[low, high)`
    pub fn band_power(&self, (low, high): (f64, f64)) -> f64 {
        if self.frequencies.len() < 2 {
            return 0.0;
        }
        let df = self.frequencies[1] - self.frequencies[0];
        self.frequencies
            .iter()
            .zip(self.power.iter())
            .filter(|(&f, _)| f >= low && f < high)
            .map(|(_, &p)| p * df)
            .sum()
    }
}

/// Spectral estimation routine used by the frequency-domain family
pub trait SpectralEstimator {
    fn power_spectrum(&self, signal: &[f64], sample_rate: f64) -> Result<Spectrum>;
}

/// Welch's method with a Hann window and 50% overlap
#[derive(Debug, Clone)]
pub struct Welch {
    pub segment_length: usize,
}

impl Default for Welch {
    fn default() -> Self {
        Welch { segment_length: 256 }
    }
}

/// Create a Hann window of the specified size
fn create_hann_window(size: usize) -> Vec<f64> {
    (0..size)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f64 / size as f64).cos()))
        .collect()
}

impl SpectralEstimator for Welch {
    fn power_spectrum(&self, signal: &[f64], sample_rate: f64) -> Result<Spectrum> {
        let segment_length = self.segment_length.min(signal.len());
        if segment_length < 4 {
            return Err(Error::insufficient(format!(
                "{} samples are too few for spectral estimation",
                signal.len()
            )));
        }

        let overlap = segment_length / 2;
        let step = segment_length - overlap;
        let num_segments = (signal.len() - segment_length) / step + 1;

        let window = create_hann_window(segment_length);
        let window_power: f64 = window.iter().map(|w| w * w).sum();

        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(segment_length);
        let mut psd = vec![0.0; segment_length / 2 + 1];

        for i in 0..num_segments {
            let segment = &signal[i * step..i * step + segment_length];
            let mean = segment.iter().sum::<f64>() / segment_length as f64;
            let mut buffer: Vec<Complex<f64>> = segment
                .iter()
                .zip(window.iter())
                .map(|(&x, &w)| Complex::new((x - mean) * w, 0.0))
                .collect();
            fft.process(&mut buffer);

            for (j, p) in psd.iter_mut().enumerate() {
                *p += buffer[j].norm_sqr();
            }
        }

        // density scaling, one-sided
        let scale = 1.0 / (sample_rate * window_power * num_segments as f64);
        let last = psd.len() - 1;
        for (j, p) in psd.iter_mut().enumerate() {
            *p *= scale;
            if j != 0 && !(segment_length % 2 == 0 && j == last) {
                *p *= 2.0;
            }
        }

        let freq_resolution = sample_rate / segment_length as f64;
        Ok(Spectrum {
            frequencies: (0..psd.len()).map(|j| j as f64 * freq_resolution).collect(),
            power: psd,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HrvOptions {
    pub families: Vec<HrvFamily>,
    /// Reclassify beats with this configuration before computing metrics
    pub recorrect: Option<OutlierConfig>,
}

impl Default for HrvOptions {
    fn default() -> Self {
        HrvOptions {
            families: vec![HrvFamily::Time, HrvFamily::Frequency, HrvFamily::Nonlinear],
            recorrect: None,
        }
    }
}

/// Single row of named metrics plus the families that could not be computed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HrvResult {
    pub metrics: Vec<(String, f64)>,
    pub errors: Vec<(HrvFamily, Error)>,
}

impl HrvResult {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.metrics.iter().find(|(n, _)| n == name).map(|(_, v)| *v)
    }
}

pub fn compute_hrv(beats: &BeatSeries, options: &HrvOptions) -> Result<HrvResult> {
    compute_hrv_with(beats, options, &Welch::default())
}

/// Computes the requested metric families. Configuration errors fail the
/// call; missing data only fails the affected family.
pub fn compute_hrv_with(
    beats: &BeatSeries,
    options: &HrvOptions,
    estimator: &dyn SpectralEstimator,
) -> Result<HrvResult> {
    if options.families.is_empty() {
        return Err(Error::config("no HRV metric family selected"));
    }
    let beats = match &options.recorrect {
        Some(config) => outliers::correct(beats, config)?,
        None => beats.clone(),
    };
    let rr = beats.corrected_intervals()?;

    let mut result = HrvResult::default();
    for &family in &options.families {
        if result.errors.iter().any(|(f, _)| *f == family)
            || result.metrics.iter().any(|(n, _)| family_of(n) == Some(family))
        {
            continue;
        }
        let computed = if beats.len() < family.min_beats() {
            Err(Error::insufficient(format!(
                "{:?} HRV needs at least {} beats, got {}",
                family,
                family.min_beats(),
                beats.len()
            )))
        } else {
            match family {
                HrvFamily::Time => Ok(time_domain(&rr)),
                HrvFamily::Frequency => frequency_domain(&rr, estimator),
                HrvFamily::Nonlinear => Ok(nonlinear(&rr)),
            }
        };
        match computed {
            Ok(metrics) => result.metrics.extend(metrics),
            Err(e) => {
                debug!("HRV family {:?} skipped: {}", family, e);
                result.errors.push((family, e));
            }
        }
    }
    Ok(result)
}

fn family_of(metric: &str) -> Option<HrvFamily> {
    match metric {
        "HRV_MeanNN" | "HRV_MedianNN" | "HRV_SDNN" | "HRV_RMSSD" | "HRV_SDSD" | "HRV_CVNN"
        | "HRV_pNN20" | "HRV_pNN50" => Some(HrvFamily::Time),
        "HRV_VLF" | "HRV_LF" | "HRV_HF" | "HRV_TP" | "HRV_LFHF" | "HRV_LFn" | "HRV_HFn" => {
            Some(HrvFamily::Frequency)
        }
        "HRV_SD1" | "HRV_SD2" | "HRV_SD1SD2" | "HRV_S" => Some(HrvFamily::Nonlinear),
        _ => None,
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn sample_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    (values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64).sqrt()
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let n = sorted.len();
    if n % 2 == 0 {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    } else {
        sorted[n / 2]
    }
}

fn time_domain(rr: &[f64]) -> Vec<(String, f64)> {
    let diffs: Vec<f64> = rr.windows(2).map(|w| w[1] - w[0]).collect();
    let mean_nn = mean(rr);
    let sdnn = sample_std(rr);
    let rmssd = (diffs.iter().map(|d| d * d).sum::<f64>() / diffs.len() as f64).sqrt();
    let nn20 = diffs.iter().filter(|d| d.abs() > 20.0).count();
    let nn50 = diffs.iter().filter(|d| d.abs() > 50.0).count();

    vec![
        ("HRV_MeanNN".to_string(), mean_nn),
        ("HRV_MedianNN".to_string(), median(rr)),
        ("HRV_SDNN".to_string(), sdnn),
        ("HRV_RMSSD".to_string(), rmssd),
        ("HRV_SDSD".to_string(), sample_std(&diffs)),
        ("HRV_CVNN".to_string(), sdnn / mean_nn),
        (
            "HRV_pNN20".to_string(),
            nn20 as f64 / diffs.len() as f64 * 100.0,
        ),
        (
            "HRV_pNN50".to_string(),
            nn50 as f64 / diffs.len() as f64 * 100.0,
        ),
    ]
}

/// Linear interpolation of the RR tachogram onto an even grid
fn interpolate_rr(rr: &[f64], sample_rate: f64) -> Vec<f64> {
    let mut time_points = Vec::with_capacity(rr.len());
    let mut t = 0.0;
    for &interval in rr {
        t += interval / 1000.0;
        time_points.push(t);
    }

    let first = time_points[0];
    let num_samples = ((t - first) * sample_rate) as usize + 1;
    let mut interpolated = Vec::with_capacity(num_samples);
    let mut j = 0;
    for k in 0..num_samples {
        let t = first + k as f64 / sample_rate;
        while j + 2 < time_points.len() && time_points[j + 1] < t {
            j += 1;
        }
        let (t1, t2) = (time_points[j], time_points[j + 1]);
        let alpha = ((t - t1) / (t2 - t1)).clamp(0.0, 1.0);
        interpolated.push(rr[j] + alpha * (rr[j + 1] - rr[j]));
    }
    interpolated
}

fn frequency_domain(rr: &[f64], estimator: &dyn SpectralEstimator) -> Result<Vec<(String, f64)>> {
    let tachogram = interpolate_rr(rr, INTERPOLATION_RATE);
    let m = mean(&tachogram);
    let detrended: Vec<f64> = tachogram.iter().map(|x| x - m).collect();
    let spectrum = estimator.power_spectrum(&detrended, INTERPOLATION_RATE)?;

    let vlf = spectrum.band_power(VLF_BAND);
    let lf = spectrum.band_power(LF_BAND);
    let hf = spectrum.band_power(HF_BAND);
    let total = vlf + lf + hf;
    let ratio = |a: f64, b: f64| if b > 0.0 { a / b } else { f64::NAN };

    Ok(vec![
        ("HRV_VLF".to_string(), vlf),
        ("HRV_LF".to_string(), lf),
        ("HRV_HF".to_string(), hf),
        ("HRV_TP".to_string(), total),
        ("HRV_LFHF".to_string(), ratio(lf, hf)),
        ("HRV_LFn".to_string(), ratio(lf, lf + hf)),
        ("HRV_HFn".to_string(), ratio(hf, lf + hf)),
    ])
}

fn nonlinear(rr: &[f64]) -> Vec<(String, f64)> {
    let diffs: Vec<f64> = rr.windows(2).map(|w| w[1] - w[0]).collect();
    let sdsd = sample_std(&diffs);
    let sdnn = sample_std(rr);
    let sd1 = (0.5 * sdsd * sdsd).sqrt();
    let sd2 = (2.0 * sdnn * sdnn - 0.5 * sdsd * sdsd).max(0.0).sqrt();

    vec![
        ("HRV_SD1".to_string(), sd1),
        ("HRV_SD2".to_string(), sd2),
        (
            "HRV_SD1SD2".to_string(),
            if sd2 > 0.0 { sd1 / sd2 } else { f64::NAN },
        ),
        ("HRV_S".to_string(), PI * sd1 * sd2),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn beats_from_rr(rr: &[f64]) -> BeatSeries {
        let mut t = 0.0;
        let mut peaks = vec![t];
        for r in rr {
            t += r / 1000.0;
            peaks.push(t);
        }
        BeatSeries::from_peaks(peaks).unwrap()
    }

    #[test]
    fn test_time_domain_values() {
        let rr = [1000.0, 1010.0, 1020.0, 1030.0, 1040.0];
        let metrics = time_domain(&rr);
        let get = |n: &str| metrics.iter().find(|(k, _)| k == n).unwrap().1;
        assert_abs_diff_eq!(get("HRV_MeanNN"), 1020.0, epsilon = 1e-9);
        assert_abs_diff_eq!(get("HRV_RMSSD"), 10.0, epsilon = 1e-9);
        assert_abs_diff_eq!(get("HRV_SDSD"), 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(get("HRV_pNN50"), 0.0);
    }

    #[test]
    fn test_metrics_use_measured_intervals_only() {
        // intervals 1000, 1200, 800, 1400 ms
        let beats = BeatSeries::from_peaks(vec![0.0, 1.0, 2.2, 3.0, 4.4]).unwrap();
        let options = HrvOptions {
            families: vec![HrvFamily::Time, HrvFamily::Nonlinear],
            recorrect: None,
        };
        let result = compute_hrv(&beats, &options).unwrap();
        assert!(result.errors.is_empty());
        assert_abs_diff_eq!(result.get("HRV_MeanNN").unwrap(), 1100.0, epsilon = 1e-6);
        assert_abs_diff_eq!(
            result.get("HRV_RMSSD").unwrap(),
            432.04937989385735,
            epsilon = 1e-6
        );
        assert_abs_diff_eq!(
            result.get("HRV_SDNN").unwrap(),
            258.19888974716116,
            epsilon = 1e-6
        );
        assert_abs_diff_eq!(result.get("HRV_pNN50").unwrap(), 100.0);
    }

    #[test]
    fn test_minimum_beats_per_family() {
        // 3 beats: enough for time domain, not for Poincaré
        let beats = beats_from_rr(&[800.0, 900.0]);
        let result = compute_hrv(&beats, &HrvOptions::default()).unwrap();
        assert!(result.get("HRV_RMSSD").is_some());
        assert!(result.get("HRV_SD1").is_none());
        assert!(result
            .errors
            .iter()
            .any(|(f, e)| *f == HrvFamily::Nonlinear && matches!(e, Error::InsufficientData(_))));
    }

    #[test]
    fn test_short_series_only_fails_frequency() {
        let rr: Vec<f64> = (0..30).map(|i| 800.0 + (i % 5) as f64 * 12.0).collect();
        let result = compute_hrv(&beats_from_rr(&rr), &HrvOptions::default()).unwrap();
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].0, HrvFamily::Frequency);
        assert!(matches!(result.errors[0].1, Error::InsufficientData(_)));
        assert!(result.get("HRV_RMSSD").is_some());
        assert!(result.get("HRV_SD1").is_some());
        assert!(result.get("HRV_LF").is_none());
    }

    #[test]
    fn test_respiratory_modulation_shows_in_hf() {
        // RR modulated at ~0.25 Hz, well inside the HF band
        let mut rr = Vec::new();
        let mut t = 0.0;
        while rr.len() < 400 {
            let r = 900.0 + 40.0 * (2.0 * PI * 0.25 * t).sin();
            rr.push(r);
            t += r / 1000.0;
        }
        let options = HrvOptions {
            families: vec![HrvFamily::Frequency],
            recorrect: None,
        };
        let result = compute_hrv(&beats_from_rr(&rr), &options).unwrap();
        assert!(result.errors.is_empty());
        let hf = result.get("HRV_HF").unwrap();
        let lf = result.get("HRV_LF").unwrap();
        assert!(hf > 10.0 * lf, "hf {} lf {}", hf, lf);
    }

    #[test]
    fn test_poincare_constant_series() {
        let metrics = nonlinear(&[800.0; 10]);
        assert_abs_diff_eq!(metrics[0].1, 0.0);
        assert_abs_diff_eq!(metrics[1].1, 0.0);
        assert!(metrics[2].1.is_nan());
    }

    #[test]
    fn test_welch_finds_sine() {
        let fs = 4.0;
        let signal: Vec<f64> = (0..1024)
            .map(|i| (2.0 * PI * 0.25 * i as f64 / fs).sin())
            .collect();
        let spectrum = Welch::default().power_spectrum(&signal, fs).unwrap();
        let peak = spectrum
            .power
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| spectrum.frequencies[i])
            .unwrap();
        assert_abs_diff_eq!(peak, 0.25, epsilon = fs / 256.0);
        // Parseval: a unit sine carries 0.5 of power
        assert_abs_diff_eq!(spectrum.band_power((0.0, 2.1)), 0.5, epsilon = 0.05);
    }

    #[test]
    fn test_no_family_is_config_error() {
        let beats = beats_from_rr(&[800.0; 5]);
        let options = HrvOptions {
            families: vec![],
            recorrect: None,
        };
        assert!(matches!(
            compute_hrv(&beats, &options),
            Err(Error::Configuration(_))
        ));
    }
}
