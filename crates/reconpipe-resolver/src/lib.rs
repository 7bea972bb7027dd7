pub mod backfill;
pub mod canonical;
pub mod config;
pub mod decompose;
pub mod probe;
pub mod stage;

pub use backfill::{run_backfill, BackfillCounters};
pub use canonical::{canonicalize, url_hash, CanonicalizeError};
pub use config::ResolverConfig;
pub use decompose::{decompose, Decomposed};
pub use probe::{ProbeOutcome, ReqwestUrlProbe, UrlProbe};
pub use stage::ResolverStageCore;
