pub mod aggregator;
pub mod classifier;
pub mod history;

pub use classifier::{Frame, FrameClassifier};
pub use history::{HistoryLimits, HistoryStore};
