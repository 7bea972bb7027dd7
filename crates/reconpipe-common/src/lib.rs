pub mod config;
pub mod domain;
pub mod error;
pub mod parent_domain;
pub mod stream_message;

pub use config::{required_env, StageConfig};
pub use error::ReconError;
pub use parent_domain::parent_domain;
pub use stream_message::StreamMessage;
