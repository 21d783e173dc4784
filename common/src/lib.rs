// Common library for the partitioned trigger engine: partitions, triggers,
// seen-key tracking, retry policy and run execution

pub mod config;
pub mod errors;
pub mod executor;
pub mod models;
pub mod partition;
pub mod request;
pub mod retry;
pub mod schedule;
pub mod scheduler;
pub mod seen;
pub mod sensor;
pub mod storage;
pub mod telemetry;
