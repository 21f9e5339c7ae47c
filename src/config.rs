use crate::aggregation::NormalizeMode;
use crate::hrv::HrvFamily;
use clap::Parser;
use std::path::PathBuf;
use std::str::FromStr;

/// Normalization mode as given on the command line
#[derive(Debug, Clone, Copy)]
pub struct NormalizeArg(pub NormalizeMode);

impl FromStr for NormalizeArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sub" | "subtract" => Ok(NormalizeArg(NormalizeMode::Subtract)),
            "div" | "divide" => Ok(NormalizeArg(NormalizeMode::Divide)),
            _ => Err(format!(
                "Invalid normalization mode: {}. Use 'subtract' or 'divide'",
                s
            )),
        }
    }
}

/// Comma-separated HRV families, e.g. `time,nonlinear`
#[derive(Debug, Clone)]
pub struct HrvFamilies(pub Vec<HrvFamily>);

impl FromStr for HrvFamilies {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split(',')
            .map(|f| match f.trim() {
                "time" => Ok(HrvFamily::Time),
                "frequency" | "freq" => Ok(HrvFamily::Frequency),
                "nonlinear" => Ok(HrvFamily::Nonlinear),
                other => Err(format!(
                    "Invalid HRV family: {}. Use time, frequency or nonlinear",
                    other
                )),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(HrvFamilies)
    }
}

/// Process ECG recordings of a study protocol into heart rate and HRV results
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Directory with one `<subject>.csv` ECG recording (timestamp,ecg) per subject
    pub input_dir: PathBuf,

    /// Protocol structure as JSON, e.g. {"Baseline": null, "Stress": {"Talk": 300, "Math": 0}}
    #[arg(long, requires = "intervals")]
    pub structure: Option<PathBuf>,

    /// Protocol name used in log messages
    #[arg(long, default_value = "Study")]
    pub protocol_name: String,

    /// Phase boundaries as CSV (subject,phase,start,end). Without it each
    /// recording is analyzed as a single phase named "Data"
    #[arg(long, requires = "structure")]
    pub intervals: Option<PathBuf>,

    /// Subject conditions as CSV (subject,condition)
    #[arg(long)]
    pub conditions: Option<PathBuf>,

    /// Skip subjects without a condition instead of failing
    #[arg(long)]
    pub lenient_conditions: bool,

    /// ECG sampling rate in Hz
    #[arg(long, env = "ECG_SAMPLING_RATE", default_value = "256.0")]
    pub sampling_rate: f64,

    /// CSV output file prefix (e.g. /path/to/output/prefix)
    #[arg(long)]
    pub csv_output: Option<String>,

    /// Resampling step in seconds before aggregation
    #[arg(long, default_value = "1.0")]
    pub resample_sec: f64,

    /// Reference phase for normalization
    #[arg(long)]
    pub normalize_to: Option<String>,

    /// Normalization mode (subtract or divide)
    #[arg(long, default_value = "subtract")]
    pub normalize_mode: NormalizeArg,

    /// Only aggregate these phases (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub select_phases: Vec<String>,

    /// Split phases into the subphases declared in the structure file
    #[arg(long)]
    pub split_subphases: bool,

    /// Trim every phase to the shortest subject in the ensemble output
    #[arg(long)]
    pub cut_phases: bool,

    /// HRV families to compute
    #[arg(long, default_value = "time,frequency,nonlinear")]
    pub hrv: HrvFamilies,

    /// Flag a beat only when every outlier rule agrees (default: any rule)
    #[arg(long)]
    pub all_rules: bool,

    /// Statistical RR threshold (z-score)
    #[arg(long, default_value = "2.576")]
    pub rr_threshold: f64,

    /// Statistical successive-difference threshold (z-score)
    #[arg(long, default_value = "1.96")]
    pub rr_diff_threshold: f64,

    /// Lowest plausible heart rate in bpm
    #[arg(long, default_value = "50.0")]
    pub min_bpm: f64,

    /// Highest plausible heart rate in bpm
    #[arg(long, default_value = "180.0")]
    pub max_bpm: f64,

    /// Saliva samples as CSV (subject,condition,sample,time,phase,value)
    #[arg(long)]
    pub saliva: Option<PathBuf>,

    /// Name of the saliva biomarker
    #[arg(long, default_value = "cortisol")]
    pub biomarker: String,

    /// Skip baseline wander removal before peak detection
    #[arg(long)]
    pub keep_baseline: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structure_and_intervals_go_together() {
        assert!(Args::try_parse_from(["psyphys", "data"]).is_ok());
        assert!(Args::try_parse_from(["psyphys", "data", "--structure", "tsst.json"]).is_err());
        assert!(Args::try_parse_from(["psyphys", "data", "--intervals", "phases.csv"]).is_err());
        let args = Args::try_parse_from([
            "psyphys",
            "data",
            "--structure",
            "tsst.json",
            "--intervals",
            "phases.csv",
            "--hrv",
            "time,nonlinear",
        ])
        .unwrap();
        assert_eq!(args.hrv.0, vec![HrvFamily::Time, HrvFamily::Nonlinear]);
    }
}
