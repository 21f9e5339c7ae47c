use crate::hrv::HrvResult;
use crate::results::{AggregatedResult, MergedEnsemble};
use crate::saliva::FeatureTable;
use anyhow::Result;
use std::io::Write;
use std::path::{Path, PathBuf};

/// `<dir>/<stem>_<suffix>.<ext>` next to `base_path`, creating the directory
pub fn output_path(base_path: &str, suffix: &str) -> Result<PathBuf> {
    let path = Path::new(base_path);
    let dir = path.parent().unwrap_or(Path::new("."));

    // Create directory if it doesn't exist
    std::fs::create_dir_all(dir)?;

    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("results");
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("csv");
    Ok(dir.join(format!("{}_{}.{}", stem, suffix, ext)))
}

fn opt(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("")
}

/// Long table with optional condition and subphase columns
pub fn write_results<W: Write>(writer: W, result: &AggregatedResult) -> Result<()> {
    let mut writer = csv::Writer::from_writer(writer);
    let (conditions, subphases) = (result.has_conditions(), result.has_subphases());

    let mut header = vec!["subject"];
    if conditions {
        header.push("condition");
    }
    header.push("phase");
    if subphases {
        header.push("subphase");
    }
    header.push("value");
    writer.write_record(&header)?;

    for row in result.rows() {
        let value = row.value.to_string();
        let mut record = vec![row.subject.as_str()];
        if conditions {
            record.push(opt(&row.condition));
        }
        record.push(&row.phase);
        if subphases {
            record.push(opt(&row.subphase));
        }
        record.push(&value);
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

/// One line per (subject, phase), one column per metric seen in any row
pub fn write_hrv<W: Write>(writer: W, rows: &[(String, String, HrvResult)]) -> Result<()> {
    let mut writer = csv::Writer::from_writer(writer);
    let mut metrics: Vec<&str> = Vec::new();
    for (_, _, result) in rows {
        for (name, _) in &result.metrics {
            if !metrics.contains(&name.as_str()) {
                metrics.push(name);
            }
        }
    }

    let mut header = vec!["subject", "phase"];
    header.extend(metrics.iter().copied());
    writer.write_record(&header)?;

    for (subject, phase, result) in rows {
        let mut record = vec![subject.clone(), phase.clone()];
        record.extend(
            metrics
                .iter()
                .map(|m| result.get(m).map(|v| v.to_string()).unwrap_or_default()),
        );
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

/// Every ensemble sample in long format
pub fn write_ensemble<W: Write>(writer: W, ensemble: &MergedEnsemble) -> Result<()> {
    let mut writer = csv::Writer::from_writer(writer);
    writer.write_record(["phase", "subphase", "subject", "condition", "time", "value"])?;
    for phase in ensemble.phases() {
        for member in &phase.members {
            for (t, v) in member.series.iter() {
                writer.write_record([
                    phase.key.phase.as_str(),
                    opt(&phase.key.subphase),
                    &member.subject,
                    opt(&member.condition),
                    &t.to_string(),
                    &v.to_string(),
                ])?;
            }
        }
    }
    writer.flush()?;
    Ok(())
}

/// Sample-wise mean and standard error across subjects, per phase
pub fn write_ensemble_summary<W: Write>(writer: W, ensemble: &MergedEnsemble) -> Result<()> {
    let mut writer = csv::Writer::from_writer(writer);
    writer.write_record(["phase", "subphase", "time", "mean", "sem"])?;
    for phase in ensemble.phases() {
        let (Some(mean), Some(sem)) = (phase.mean_series(), phase.sem_series()) else {
            continue;
        };
        for ((t, m), (_, s)) in mean.iter().zip(sem.iter()) {
            writer.write_record([
                phase.key.phase.as_str(),
                opt(&phase.key.subphase),
                &t.to_string(),
                &m.to_string(),
                &s.to_string(),
            ])?;
        }
    }
    writer.flush()?;
    Ok(())
}

pub fn write_features<W: Write>(writer: W, table: &FeatureTable) -> Result<()> {
    let mut writer = csv::Writer::from_writer(writer);
    writer.write_record(["subject", "condition", "feature", "value"])?;
    for row in table {
        writer.write_record([
            row.subject.as_str(),
            opt(&row.condition),
            &row.feature,
            &row.value.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

/// Creates `<prefix>_<suffix>.csv` and runs `write` on it
pub fn write_to_file<F>(base_path: &str, suffix: &str, write: F) -> Result<()>
where
    F: FnOnce(std::fs::File) -> Result<()>,
{
    let full_path = output_path(base_path, suffix)?;
    println!("Writing results to {}", full_path.display());
    let file = std::fs::File::create(&full_path)?;
    write(file)
}
