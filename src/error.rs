use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Invalid or contradictory configuration. Always fatal to the call.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Malformed protocol structure or table, rejected at construction.
    #[error("structure error: {0}")]
    Structure(String),
    /// Subphase durations do not fit the data of a phase.
    #[error("alignment error: {0}")]
    Alignment(String),
    #[error("insufficient data: {0}")]
    InsufficientData(String),
    /// A subject or phase is missing from a lookup table.
    #[error("lookup error: {0}")]
    Lookup(String),
    #[error("identifier '{0}' already exists")]
    DuplicateId(String),
    /// Detection or correction failed on one unit of a batch.
    #[error("processing error: {0}")]
    Processing(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    pub fn structure(msg: impl Into<String>) -> Self {
        Error::Structure(msg.into())
    }

    pub fn alignment(msg: impl Into<String>) -> Self {
        Error::Alignment(msg.into())
    }

    pub fn insufficient(msg: impl Into<String>) -> Self {
        Error::InsufficientData(msg.into())
    }

    pub fn lookup(msg: impl Into<String>) -> Self {
        Error::Lookup(msg.into())
    }

    pub fn processing(msg: impl Into<String>) -> Self {
        Error::Processing(msg.into())
    }
}

/// Identifies the unit (subject and/or phase) an isolated error belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId {
    pub subject: Option<String>,
    pub phase: Option<String>,
}

impl UnitId {
    pub fn subject(subject: &str) -> Self {
        UnitId {
            subject: Some(subject.to_string()),
            phase: None,
        }
    }

    pub fn phase(phase: &str) -> Self {
        UnitId {
            subject: None,
            phase: Some(phase.to_string()),
        }
    }

    pub fn subject_phase(subject: &str, phase: &str) -> Self {
        UnitId {
            subject: Some(subject.to_string()),
            phase: Some(phase.to_string()),
        }
    }
}

impl std::fmt::Display for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.subject, &self.phase) {
            (Some(s), Some(p)) => write!(f, "{}/{}", s, p),
            (Some(s), None) => write!(f, "{}", s),
            (None, Some(p)) => write!(f, "{}", p),
            (None, None) => write!(f, "<global>"),
        }
    }
}
