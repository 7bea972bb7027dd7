pub mod batch;
pub mod completion;
pub mod error;
pub mod scan_job;
pub mod stage;

pub use batch::{resolve_targets, ResolvedTarget};
pub use completion::{append_completion, run_streaming_loop};
pub use error::WorkerError;
pub use reconpipe_common::config::{RunMode as Mode, StageConfig as WorkerEnv};
pub use scan_job::report_scan_job_counts;
pub use stage::{run, StageCore, StageOutcome};
