use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("missing required variable: {0}")]
    MissingVariable(String),
    #[error(transparent)]
    Config(#[from] reconpipe_common::ReconError),
    #[error(transparent)]
    Store(#[from] reconpipe_store::StoreError),
    #[error(transparent)]
    Stream(#[from] reconpipe_stream::StreamError),
    #[error(transparent)]
    Stage(#[from] anyhow::Error),
}
