pub mod aggregation;
pub mod beats;
pub mod config;
pub mod data;
pub mod data_loading;
pub mod detection;
pub mod ecg;
pub mod error;
pub mod hrv;
pub mod outliers;
pub mod output;
pub mod protocol;
pub mod results;
pub mod saliva;
pub mod signal;
pub mod structure;

pub use aggregation::{compute_ensemble, compute_results, Aggregated, AggregationPlan, Stage};
pub use beats::{BeatClass, BeatSeries};
pub use data::{DataLayout, PhaseNode, SubjectDataDict, UnitKey};
pub use ecg::{EcgOptions, EcgProcessor, EcgResult};
pub use error::{Error, Result, UnitId};
pub use hrv::{compute_hrv, HrvFamily, HrvOptions, HrvResult};
pub use outliers::{Composition, OutlierConfig, OutlierRule};
pub use protocol::{Protocol, ResultsRegistry};
pub use results::{AggregatedResult, MergedEnsemble, PhaseEnsemble};
pub use signal::{Signal, TimeInterval, TimeSeries};
pub use structure::ProtocolStructure;
