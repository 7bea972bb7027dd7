use thiserror::Error;

/// Error taxonomy shared across every stage (spec.md §7).
///
/// `Configuration` is the only variant that is fatal to the whole
/// process; everything else is a contract output a stage core decides
/// how to act on (skip-and-ack, retry, surface-and-don't-ack).
#[derive(Error, Debug)]
pub enum ReconError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid environment variable {name}: {reason}")]
    InvalidEnvVar { name: String, reason: String },

    #[error("store error: {0}")]
    Store(String),

    #[error("stream bus error: {0}")]
    Stream(String),

    #[error("message parse error: {0}")]
    Parse(String),

    #[error("probe error: {0}")]
    Probe(String),

    #[error("external tool error: {0}")]
    ExternalTool(String),

    #[error("contract violation: {0}")]
    Contract(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
