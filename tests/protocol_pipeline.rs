use approx::assert_abs_diff_eq;
use chrono::{DateTime, TimeZone, Utc};
use psyphys::aggregation::{
    compute_ensemble, compute_results, split_series, AggregationPlan, NormalizeMode, Stage,
    SubphaseSplit,
};
use psyphys::detection::BeatDetector;
use psyphys::signal::shift;
use psyphys::{
    BeatSeries, DataLayout, EcgOptions, EcgProcessor, Error, PhaseNode, Protocol,
    ProtocolStructure, Signal, SubjectDataDict, TimeInterval, TimeSeries, UnitId,
};
use serde_json::json;

const FS: f64 = 10.0;

/// Reads the beat period (seconds) from the first sample of each phase
struct PeriodFromAmplitude;

impl BeatDetector for PeriodFromAmplitude {
    fn detect(&self, samples: &[f64], sampling_rate: f64) -> psyphys::Result<Vec<f64>> {
        let period = samples[0];
        let duration = samples.len() as f64 / sampling_rate;
        let n = (duration / period).floor() as usize;
        Ok((0..n).map(|k| k as f64 * period).collect())
    }
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
}

fn structure() -> ProtocolStructure {
    ProtocolStructure::from_json(&json!({
        "Baseline": null,
        "Stress": {"Talk": 60, "Math": 0},
        "Recovery": null
    }))
    .unwrap()
}

/// `(phase, seconds, beat period)` → heart-rate tree from the ECG pipeline
fn heart_rate(phases: &[(&str, f64, f64)]) -> PhaseNode<TimeSeries> {
    let mut samples = Vec::new();
    let mut intervals = Vec::new();
    let mut elapsed = 0.0;
    for &(name, seconds, period) in phases {
        samples.extend(std::iter::repeat(period).take((seconds * FS) as usize));
        intervals.push(TimeInterval::new(
            name,
            shift(t0(), elapsed),
            shift(t0(), elapsed + seconds),
        ));
        elapsed += seconds;
    }
    let signal = Signal::new(t0(), FS, samples).unwrap();
    let result = EcgProcessor::new(&signal, Some(intervals))
        .unwrap()
        .process(&PeriodFromAmplitude, &EcgOptions::default())
        .unwrap();
    assert!(result.errors.is_empty());
    result.heart_rate_tree()
}

/// vp01: 60 / 120 / 80 bpm with a 300 s recovery; vp02: 80 / 96 / 60 bpm with a 60 s recovery
fn study_data() -> SubjectDataDict {
    let trees = vec![
        (
            "vp01".to_string(),
            heart_rate(&[("Baseline", 120.0, 1.0), ("Stress", 180.0, 0.5), ("Recovery", 300.0, 0.75)]),
        ),
        (
            "vp02".to_string(),
            heart_rate(&[("Baseline", 120.0, 0.75), ("Stress", 180.0, 0.625), ("Recovery", 60.0, 1.0)]),
        ),
    ];
    SubjectDataDict::new(DataLayout::Phase, trees, &structure()).unwrap()
}

#[test]
fn test_constant_rr_heart_rate() {
    let beats = BeatSeries::from_peaks(vec![0.0, 1.0, 2.0, 3.0, 4.0]).unwrap();
    assert_eq!(beats.heart_rate().unwrap(), vec![60.0; 5]);
    // nothing flagged: the corrected view is the raw series
    assert_eq!(beats.corrected_rr().unwrap(), beats.rr_ms());
}

#[test]
fn test_pipeline_results() {
    let out = compute_results(&study_data(), &structure(), &AggregationPlan::results_default())
        .unwrap();
    assert!(out.errors.is_empty());
    let table = out.output;
    assert_eq!(table.len(), 6);
    assert_abs_diff_eq!(table.value("vp01", "Baseline", None).unwrap(), 60.0, epsilon = 1e-6);
    assert_abs_diff_eq!(table.value("vp01", "Stress", None).unwrap(), 120.0, epsilon = 1e-6);
    assert_abs_diff_eq!(table.value("vp02", "Recovery", None).unwrap(), 60.0, epsilon = 1e-6);
}

#[test]
fn test_normalization_identity() {
    let data = study_data();
    for (mode, identity) in [(NormalizeMode::Subtract, 0.0), (NormalizeMode::Divide, 1.0)] {
        let plan = AggregationPlan::results(vec![
            Stage::ResampleSec(1.0),
            Stage::NormalizeTo {
                reference: "Baseline".into(),
                mode,
            },
            Stage::MeanPerSubject,
        ])
        .unwrap();
        let out = compute_results(&data, &structure(), &plan).unwrap();
        assert!(out.errors.is_empty());
        for subject in ["vp01", "vp02"] {
            let value = out.output.value(subject, "Baseline", None).unwrap();
            assert_abs_diff_eq!(value, identity, epsilon = 1e-9);
        }
    }
}

#[test]
fn test_cut_phases_trims_to_shortest() {
    let plan = AggregationPlan::ensemble(vec![
        Stage::MergeDict,
        Stage::CutPhases,
        Stage::ResampleSec(1.0),
    ])
    .unwrap();
    let out = compute_ensemble(&study_data(), &structure(), &plan).unwrap();
    let recovery = out.output.phase("Recovery").unwrap();
    assert_eq!(recovery.members.len(), 2);
    for member in &recovery.members {
        assert_eq!(member.series.len(), 60);
        assert_abs_diff_eq!(member.series.span(), 59.0);
    }
    // phases of equal span keep their length
    let baseline = out.output.phase("Baseline").unwrap();
    assert!(baseline.members.iter().all(|m| m.series.len() == 120));
    assert_eq!(recovery.to_matrix().shape(), &[60, 2]);
}

#[test]
fn test_merge_round_trip() {
    let data = study_data();
    let plan = AggregationPlan::ensemble(vec![Stage::MergeDict]).unwrap();
    let merged = compute_ensemble(&data, &structure(), &plan).unwrap().output;
    assert_eq!(merged.subjects(), &["vp01".to_string(), "vp02".to_string()]);
    assert_eq!(merged.unmerge(), data);
}

#[test]
fn test_split_into_subphases() {
    let plan = AggregationPlan::results(vec![
        Stage::MeanPerSubject,
        Stage::ResampleSec(1.0),
        Stage::SplitIntoSubphases(SubphaseSplit::Fixed(vec![
            ("early".into(), 60.0),
            ("late".into(), 60.0),
        ])),
    ])
    .unwrap();
    let out = compute_results(&study_data(), &structure(), &plan).unwrap();
    // vp02's 60 s recovery cannot hold 120 s of subphases
    assert_eq!(out.errors.len(), 1);
    assert_eq!(out.errors[0].0, UnitId::subject_phase("vp02", "Recovery"));
    assert!(matches!(out.errors[0].1, Error::Alignment(_)));
    assert!(out.output.value("vp02", "Stress", Some("late")).is_some());
    assert!(out.output.value("vp02", "Recovery", Some("early")).is_none());
}

#[test]
fn test_split_covers_phase_exactly() {
    let series = TimeSeries::regular(t0(), 1.0, (0..120).map(|v| v as f64).collect()).unwrap();
    let parts = split_series(
        &series,
        &[("a".into(), 30.0), ("b".into(), 50.0), ("c".into(), 40.0)],
    )
    .unwrap();
    let joined: Vec<f64> = parts
        .iter()
        .flat_map(|(_, ts)| ts.values().iter().copied())
        .collect();
    assert_eq!(joined, series.values());

    let too_long = split_series(&series, &[("a".into(), 60.0), ("b".into(), 62.0)]);
    assert!(matches!(too_long, Err(Error::Alignment(_))));
}

#[test]
fn test_mist_open_subphase() {
    let structure = ProtocolStructure::from_json(&json!({
        "Before": null,
        "MIST": {"MIST1": {"BL": 60, "AT": 240, "FB": 0}},
        "After": null
    }))
    .unwrap();
    let data = SubjectDataDict::new(
        DataLayout::Phase,
        vec![(
            "vp01".to_string(),
            heart_rate(&[("MIST1", 390.0, 1.0)]),
        )],
        &structure,
    )
    .unwrap();
    let plan = AggregationPlan::ensemble(vec![Stage::ResampleSec(1.0), Stage::MergeDict]).unwrap();
    let merged = compute_ensemble(&data, &structure, &plan).unwrap().output;
    let series = &merged.phase("MIST1").unwrap().members[0].series;

    let windows = structure.subphase_durations("MIST1").unwrap();
    let parts = split_series(series, &windows).unwrap();
    let lengths: Vec<usize> = parts.iter().map(|(_, ts)| ts.len()).collect();
    assert_eq!(lengths, vec![60, 240, 90]);

    let observed = [("FB", parts[2].1.len() as f64)];
    assert_eq!(structure.inferred_duration("MIST1", &observed), Some(390.0));
    assert_eq!(structure.total_duration("MIST1"), None);
}

#[test]
fn test_registry_ids() {
    let mut protocol = Protocol::new("TSST", structure());
    let data = study_data();
    let plan = AggregationPlan::results_default();

    protocol.compute_results("hr", &data, &plan, false).unwrap();
    protocol.compute_results("hr_norm", &data, &plan, false).unwrap();
    assert!(matches!(
        protocol.compute_results("hr", &data, &plan, false),
        Err(Error::DuplicateId(_))
    ));
    protocol.compute_results("hr", &data, &plan, true).unwrap();
    assert_eq!(protocol.registry().result_ids(), vec!["hr", "hr_norm"]);
}
