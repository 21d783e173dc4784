// Storage module for S3-compatible object storage and Redis

pub mod redis_client;
pub mod s3;

pub use redis_client::RedisClient;
pub use s3::{ObjectSummary, S3Client};
