// Sensor module: discovery-driven triggers

pub mod discovery;
pub mod polling;

pub use discovery::{order_candidates, DiscoverySource, S3DiscoverySource};
pub use polling::{PollingSensor, SensorEvaluation, NO_NEW_KEYS_REASON};
