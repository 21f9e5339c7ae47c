use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, warn};
use psyphys::aggregation::{AggregationPlan, ConditionLookup, Stage, SubphaseSplit};
use psyphys::config::Args;
use psyphys::data::{DataLayout, PhaseNode, SubjectDataDict};
use psyphys::data_loading::{
    find_recordings, open, read_conditions, read_ecg_file, read_intervals, read_saliva,
    read_structure,
};
use psyphys::detection::MovingAverageDetector;
use psyphys::ecg::{EcgOptions, EcgProcessor, DEFAULT_PHASE};
use psyphys::hrv::{compute_hrv, HrvOptions, HrvResult};
use psyphys::outliers::{Composition, OutlierConfig, OutlierRule};
use psyphys::output;
use psyphys::protocol::Protocol;
use psyphys::signal::{Signal, TimeInterval, TimeSeries};
use psyphys::structure::ProtocolStructure;
use psyphys::{Error, UnitId};

const RESULT_ID: &str = "heart_rate";

struct SubjectOutput {
    heart_rate: PhaseNode<TimeSeries>,
    hrv: Vec<(String, HrvResult)>,
}

fn outlier_config(args: &Args) -> Result<OutlierConfig> {
    let composition = if args.all_rules {
        Composition::All
    } else {
        Composition::Any
    };
    Ok(OutlierConfig::new(
        vec![
            OutlierRule::StatisticalRr {
                threshold: args.rr_threshold,
            },
            OutlierRule::StatisticalRrDiff {
                threshold: args.rr_diff_threshold,
            },
            OutlierRule::Physiological {
                min_bpm: args.min_bpm,
                max_bpm: args.max_bpm,
            },
        ],
        composition,
    )?)
}

/// Restricts the recording to the span covered by the phase intervals
fn crop_to_intervals(signal: &Signal, intervals: &[TimeInterval]) -> Result<Signal> {
    match (intervals.first(), intervals.last()) {
        (Some(first), Some(last)) => Ok(signal.crop(first.start, last.end)?),
        _ => Ok(signal.clone()),
    }
}

fn process_subject(
    subject: &str,
    signal: &Signal,
    intervals: Option<Vec<TimeInterval>>,
    detector: &MovingAverageDetector,
    ecg_options: &EcgOptions,
    hrv_options: &HrvOptions,
) -> Result<SubjectOutput> {
    let processor = EcgProcessor::new(signal, intervals)
        .with_context(|| format!("Invalid phase intervals for {}", subject))?;
    let result = processor.process(detector, ecg_options)?;

    for (phase, e) in &result.errors {
        println!("  {} / {}: {}", subject, phase, e);
    }
    for warning in &result.warnings {
        println!("  {}: {}", subject, warning);
    }

    let mut hrv = Vec::new();
    for (phase, phase_result) in &result.phases {
        let metrics = match compute_hrv(&phase_result.beats, hrv_options) {
            Ok(metrics) => metrics,
            Err(e) => {
                println!("  {} / {}: no HRV: {}", subject, phase, e);
                continue;
            }
        };
        for (family, e) in &metrics.errors {
            debug!("{} / {}: no {:?} HRV: {}", subject, phase, family, e);
        }
        hrv.push((phase.clone(), metrics));
    }

    Ok(SubjectOutput {
        heart_rate: result.heart_rate_tree(),
        hrv,
    })
}

fn shared_stages(args: &Args) -> Vec<Stage> {
    let mut stages = vec![Stage::ResampleSec(args.resample_sec)];
    if let Some(reference) = &args.normalize_to {
        stages.push(Stage::NormalizeTo {
            reference: reference.clone(),
            mode: args.normalize_mode.0,
        });
    }
    if !args.select_phases.is_empty() {
        stages.push(Stage::SelectPhases(args.select_phases.clone()));
    }
    stages
}

fn print_errors(what: &str, errors: &[(UnitId, Error)]) {
    if errors.is_empty() {
        return;
    }
    println!("{}: {} units dropped", what, errors.len());
    for (unit, e) in errors {
        println!("  {}: {}", unit, e);
    }
}

fn main() -> Result<()> {
    // Initialize logger
    env_logger::init();

    let args = Args::parse();

    // clap enforces that --structure and --intervals come together
    let structure = match &args.structure {
        Some(path) => read_structure(open(path)?)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => ProtocolStructure::single_phase(DEFAULT_PHASE)?,
    };
    let intervals = match &args.intervals {
        Some(path) => Some(read_intervals(open(path)?)?),
        None => None,
    };
    let conditions: Option<ConditionLookup> = match &args.conditions {
        Some(path) => Some(read_conditions(open(path)?, args.lenient_conditions)?),
        None => None,
    };

    let detector = MovingAverageDetector {
        remove_baseline: !args.keep_baseline,
        ..Default::default()
    };
    let ecg_options = EcgOptions {
        outlier_correction: outlier_config(&args)?,
        ..Default::default()
    };
    let hrv_options = HrvOptions {
        families: args.hrv.0.clone(),
        recorrect: None,
    };

    let recordings = find_recordings(&args.input_dir)?;
    println!("Found {} recordings", recordings.len());

    let mut trees = Vec::new();
    let mut hrv_rows = Vec::new();
    for (subject, path) in &recordings {
        println!("Processing {}", subject);
        let signal = read_ecg_file(path, args.sampling_rate)?;

        let subject_intervals = match &intervals {
            Some(table) => match table.iter().find(|(s, _)| s == subject) {
                Some((_, phases)) => Some(phases.clone()),
                None => {
                    warn!("No phase intervals for {}, skipping", subject);
                    continue;
                }
            },
            None => None,
        };
        let signal = match &subject_intervals {
            Some(phases) => crop_to_intervals(&signal, phases)?,
            None => signal,
        };

        let out = process_subject(
            subject,
            &signal,
            subject_intervals,
            &detector,
            &ecg_options,
            &hrv_options,
        )?;
        hrv_rows.extend(
            out.hrv
                .into_iter()
                .map(|(phase, metrics)| (subject.clone(), phase, metrics)),
        );
        match &out.heart_rate {
            PhaseNode::Branch(phases) if phases.is_empty() => {
                warn!("No usable phase for {}", subject)
            }
            _ => trees.push((subject.clone(), out.heart_rate)),
        }
    }

    let data = SubjectDataDict::new(DataLayout::Phase, trees, &structure)
        .context("Heart rate phases do not match the protocol structure")?;
    let mut protocol = Protocol::new(&args.protocol_name, structure);

    let mut result_stages = shared_stages(&args);
    if args.split_subphases {
        result_stages.push(Stage::SplitIntoSubphases(SubphaseSplit::FromStructure));
    }
    result_stages.push(Stage::MeanPerSubject);
    let mut ensemble_stages = shared_stages(&args);
    if args.cut_phases {
        ensemble_stages.push(Stage::CutPhases);
    }
    ensemble_stages.push(Stage::MergeDict);
    if let Some(lookup) = &conditions {
        result_stages.push(Stage::AddConditions(lookup.clone()));
        ensemble_stages.push(Stage::AddConditions(lookup.clone()));
    }

    let errors = protocol.compute_results(
        RESULT_ID,
        &data,
        &AggregationPlan::results(result_stages)?,
        false,
    )?;
    print_errors("Results", &errors);
    let errors = protocol.compute_ensemble(
        RESULT_ID,
        &data,
        &AggregationPlan::ensemble(ensemble_stages)?,
        false,
    )?;
    print_errors("Ensemble", &errors);

    let saliva = match &args.saliva {
        Some(path) => {
            let df = read_saliva(open(path)?, &args.biomarker)?;
            let mut features = Vec::new();
            for aggregated in [df.initial_value(), df.max_increase(false), df.auc(), df.standard_features()] {
                print_errors("Saliva", &aggregated.errors);
                features.extend(aggregated.output);
            }
            Some(features)
        }
        None => None,
    };

    if let Some(results) = protocol.result(RESULT_ID) {
        for (condition, phase, subphase, mean) in results.group_means() {
            println!(
                "  {}{}{}: {:.1} bpm",
                condition.map(|c| format!("{} / ", c)).unwrap_or_default(),
                phase,
                subphase.map(|s| format!(" / {}", s)).unwrap_or_default(),
                mean
            );
        }
    }

    if let Some(prefix) = &args.csv_output {
        if let Some(results) = protocol.result(RESULT_ID) {
            output::write_to_file(prefix, "hr", |f| output::write_results(f, results))?;
        }
        if let Some(ensemble) = protocol.ensemble(RESULT_ID) {
            output::write_to_file(prefix, "hr_ensemble", |f| output::write_ensemble(f, ensemble))?;
            output::write_to_file(prefix, "hr_ensemble_summary", |f| {
                output::write_ensemble_summary(f, ensemble)
            })?;
        }
        output::write_to_file(prefix, "hrv", |f| output::write_hrv(f, &hrv_rows))?;
        if let Some(features) = &saliva {
            output::write_to_file(prefix, &args.biomarker, |f| output::write_features(f, features))?;
        }
    }

    Ok(())
}
