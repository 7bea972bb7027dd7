pub mod aggregator;
pub mod stage;

pub use aggregator::{SubprocessAggregator, UrlAggregator};
pub use stage::HistoricalStageCore;
