use crate::aggregation::ConditionLookup;
use crate::saliva::{SalivaRawDataFrame, SalivaSample, SamplePhase};
use crate::signal::{Signal, TimeInterval};
use crate::structure::ProtocolStructure;
use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use log::debug;
use serde::Deserialize;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Parses `2024-05-01 09:00:00.250` (UTC) or an RFC 3339 timestamp
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .with_context(|| format!("Invalid timestamp '{}'", s))?;
    Ok(naive.and_utc())
}

/// All `<subject>.csv` files below `dir`, sorted by subject id
pub fn find_recordings(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut recordings = Vec::new();
    for entry in WalkDir::new(dir).follow_links(true) {
        let entry = entry.with_context(|| format!("Failed to walk {}", dir.display()))?;
        let path = entry.path();
        if !entry.file_type().is_file()
            || path.extension().and_then(|s| s.to_str()) != Some("csv")
        {
            continue;
        }
        if let Some(subject) = path.file_stem().and_then(|s| s.to_str()) {
            recordings.push((subject.to_string(), path.to_path_buf()));
        }
    }
    recordings.sort_by(|a, b| a.0.cmp(&b.0));
    debug!("Found {} recordings in {}", recordings.len(), dir.display());
    Ok(recordings)
}

#[derive(Debug, Deserialize)]
struct EcgRecord {
    timestamp: String,
    ecg: f64,
}

/// Reads an ECG recording with `timestamp,ecg` columns. Only the first
/// timestamp is used; samples are assumed to be evenly spaced.
pub fn read_ecg<R: Read>(reader: R, sampling_rate: f64) -> Result<Signal> {
    let mut rdr = csv::Reader::from_reader(reader);
    let mut start = None;
    let mut samples = Vec::new();
    for (i, record) in rdr.deserialize::<EcgRecord>().enumerate() {
        let record = record.with_context(|| format!("Bad ECG row {}", i + 1))?;
        if start.is_none() {
            start = Some(parse_timestamp(&record.timestamp)?);
        }
        samples.push(record.ecg);
    }
    let start = start.ok_or_else(|| anyhow!("ECG recording is empty"))?;
    Ok(Signal::new(start, sampling_rate, samples)?)
}

pub fn read_ecg_file(path: &Path, sampling_rate: f64) -> Result<Signal> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    read_ecg(BufReader::new(file), sampling_rate)
        .with_context(|| format!("Failed to read ECG from {}", path.display()))
}

#[derive(Debug, Deserialize)]
struct IntervalRecord {
    subject: String,
    phase: String,
    start: String,
    end: String,
}

/// Reads `subject,phase,start,end` rows, grouped by subject in file order
pub fn read_intervals<R: Read>(reader: R) -> Result<Vec<(String, Vec<TimeInterval>)>> {
    let mut rdr = csv::Reader::from_reader(reader);
    let mut out: Vec<(String, Vec<TimeInterval>)> = Vec::new();
    for (i, record) in rdr.deserialize::<IntervalRecord>().enumerate() {
        let record = record.with_context(|| format!("Bad interval row {}", i + 1))?;
        let interval = TimeInterval::new(
            &record.phase,
            parse_timestamp(&record.start)?,
            parse_timestamp(&record.end)?,
        );
        match out.iter_mut().find(|(s, _)| *s == record.subject) {
            Some((_, intervals)) => intervals.push(interval),
            None => out.push((record.subject, vec![interval])),
        }
    }
    Ok(out)
}

#[derive(Debug, Deserialize)]
struct ConditionRecord {
    subject: String,
    condition: String,
}

pub fn read_conditions<R: Read>(reader: R, lenient: bool) -> Result<ConditionLookup> {
    let mut rdr = csv::Reader::from_reader(reader);
    let entries = rdr
        .deserialize::<ConditionRecord>()
        .map(|r| r.map(|r| (r.subject, r.condition)))
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("Bad condition row")?;
    Ok(ConditionLookup::new(entries, lenient)?)
}

pub fn read_structure<R: Read>(reader: R) -> Result<ProtocolStructure> {
    let value: serde_json::Value =
        serde_json::from_reader(reader).context("Protocol structure is not valid JSON")?;
    Ok(ProtocolStructure::from_json(&value)?)
}

#[derive(Debug, Deserialize)]
struct SalivaRecord {
    subject: String,
    #[serde(default)]
    condition: Option<String>,
    sample: usize,
    time: f64,
    phase: String,
    value: f64,
}

/// Reads `subject,condition,sample,time,phase,value` rows, `phase` being `pre` or `post`
pub fn read_saliva<R: Read>(reader: R, biomarker: &str) -> Result<SalivaRawDataFrame> {
    let mut rdr = csv::Reader::from_reader(reader);
    let mut samples = Vec::new();
    for (i, record) in rdr.deserialize::<SalivaRecord>().enumerate() {
        let record = record.with_context(|| format!("Bad saliva row {}", i + 1))?;
        let phase = match record.phase.trim() {
            "pre" => SamplePhase::PreStressor,
            "post" => SamplePhase::PostStressor,
            other => bail!("Unknown sample phase '{}' in row {}", other, i + 1),
        };
        samples.push(SalivaSample {
            subject: record.subject,
            condition: record.condition.filter(|c| !c.is_empty()),
            sample: record.sample,
            time: record.time,
            phase,
            value: record.value,
        });
    }
    Ok(SalivaRawDataFrame::new(biomarker, samples)?)
}

/// Opens `path` and hands it to one of the readers above
pub fn open(path: &Path) -> Result<BufReader<File>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    Ok(BufReader::new(file))
}
