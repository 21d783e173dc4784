// Stock pipeline: get_s3_data -> process_data -> put_redis_data
//
// CSV rows are `date,close,volume,open,high,low` with dates as YYYY/MM/DD.

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use common::errors::{ConfigurationError, StepError, StorageError};
use common::executor::{transform, Pipeline, Step, StepContext, StepDef, StepInput, StepOutput};
use common::storage::{RedisClient, S3Client};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, instrument};

pub const GET_S3_DATA: &str = "get_s3_data";
pub const PROCESS_DATA: &str = "process_data";
pub const PUT_REDIS_DATA: &str = "put_redis_data";

const DATE_FORMAT: &str = "%Y/%m/%d";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stock {
    pub date: NaiveDateTime,
    pub close: f64,
    pub volume: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
}

impl Stock {
    /// Parse one CSV record
    pub fn from_record(record: &csv::StringRecord) -> Result<Self, StepError> {
        if record.len() < 6 {
            return Err(StepError::Fatal(format!(
                "expected 6 columns, got {}",
                record.len()
            )));
        }

        let date = NaiveDate::parse_from_str(record[0].trim(), DATE_FORMAT)
            .map_err(|e| StepError::Fatal(format!("invalid date '{}': {}", &record[0], e)))?;

        Ok(Self {
            date: date.and_time(NaiveTime::MIN),
            close: parse_float(record, 1)?,
            // Volumes may be written as floats ("1000.0")
            volume: parse_float(record, 2)? as i64,
            open: parse_float(record, 3)?,
            high: parse_float(record, 4)?,
            low: parse_float(record, 5)?,
        })
    }
}

fn parse_float(record: &csv::StringRecord, index: usize) -> Result<f64, StepError> {
    record[index]
        .trim()
        .parse::<f64>()
        .map_err(|e| StepError::Fatal(format!("invalid number '{}': {}", &record[index], e)))
}

/// Parse a headerless stock CSV document
pub fn parse_stocks(data: &[u8]) -> Result<Vec<Stock>, StepError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_reader(data);

    reader
        .records()
        .map(|record| {
            let record = record.map_err(|e| StepError::Fatal(format!("invalid CSV: {}", e)))?;
            Stock::from_record(&record)
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregation {
    pub date: NaiveDateTime,
    pub high: f64,
}

impl Aggregation {
    /// Redis key: the aggregation date
    pub fn redis_key(&self) -> String {
        self.date.to_string()
    }

    /// Redis value: the high, always with a fractional part
    pub fn redis_value(&self) -> String {
        if self.high.is_finite() && self.high.fract() == 0.0 {
            format!("{:.1}", self.high)
        } else {
            self.high.to_string()
        }
    }
}

/// The `n` aggregations with the greatest high, greatest first
pub fn top_aggregations(stocks: &[Stock], n: usize) -> Vec<Aggregation> {
    let mut sorted: Vec<&Stock> = stocks.iter().collect();
    sorted.sort_by(|a, b| b.high.total_cmp(&a.high));
    sorted
        .into_iter()
        .take(n)
        .map(|stock| Aggregation {
            date: stock.date,
            high: stock.high,
        })
        .collect()
}

/// Object store read access used by the extract step
#[async_trait]
pub trait ObjectReader: Send + Sync {
    async fn get_object(&self, key: &str) -> Result<Vec<u8>, StorageError>;
}

#[async_trait]
impl ObjectReader for S3Client {
    async fn get_object(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        S3Client::get_object(self, key).await
    }
}

/// Key-value sink used by the load step
#[async_trait]
pub trait KeyValueSink: Send + Sync {
    async fn put_data(&self, key: &str, value: &str) -> Result<(), StorageError>;
}

#[async_trait]
impl KeyValueSink for RedisClient {
    async fn put_data(&self, key: &str, value: &str) -> Result<(), StorageError> {
        RedisClient::put_data(self, key, value).await
    }
}

/// Reads the CSV object named by the step's `s3_key` config
pub struct GetS3Data {
    reader: Arc<dyn ObjectReader>,
}

#[async_trait]
impl Step for GetS3Data {
    #[instrument(skip_all, fields(run_key = %ctx.run_key()))]
    async fn run(&self, ctx: &StepContext, _input: StepInput) -> Result<StepOutput, StepError> {
        let key = ctx.config_str("s3_key")?;
        let data = self.reader.get_object(key).await?;
        let stocks = parse_stocks(&data)?;
        debug!(s3_key = %key, rows = stocks.len(), "Stocks loaded");
        Ok(StepOutput::Value(to_value(&stocks)?))
    }
}

/// Writes one aggregation as `SET <date> <high>`
pub struct PutRedisData {
    sink: Arc<dyn KeyValueSink>,
}

#[async_trait]
impl Step for PutRedisData {
    #[instrument(skip_all, fields(run_key = %ctx.run_key()))]
    async fn run(&self, ctx: &StepContext, input: StepInput) -> Result<StepOutput, StepError> {
        let aggregation: Aggregation = from_input(&input, PROCESS_DATA)?;
        self.sink
            .put_data(&aggregation.redis_key(), &aggregation.redis_value())
            .await?;
        info!(date = %aggregation.redis_key(), high = aggregation.high, "Aggregation stored");
        Ok(StepOutput::Nothing)
    }
}

/// Aggregation with the greatest high; with `nlargest = N` configured, fans
/// out the top N aggregations instead
fn process_data(ctx: &StepContext, input: StepInput) -> Result<StepOutput, StepError> {
    let stocks: Vec<Stock> = from_input(&input, GET_S3_DATA)?;
    if stocks.is_empty() {
        return Err(StepError::Fatal("no stocks to aggregate".to_string()));
    }

    match ctx.config_u64("nlargest")? {
        Some(n) => {
            let aggregations = top_aggregations(&stocks, n as usize);
            let values = aggregations
                .iter()
                .map(to_value)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(StepOutput::Fanout(values))
        }
        None => {
            let top = top_aggregations(&stocks, 1);
            let aggregation = top
                .first()
                .ok_or_else(|| StepError::Fatal("no stocks to aggregate".to_string()))?;
            Ok(StepOutput::Value(to_value(aggregation)?))
        }
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, StepError> {
    serde_json::to_value(value).map_err(|e| StepError::Fatal(format!("serialization failed: {}", e)))
}

fn from_input<T: for<'de> Deserialize<'de>>(input: &StepInput, dep: &str) -> Result<T, StepError> {
    let value = input
        .get(dep)
        .cloned()
        .ok_or_else(|| StepError::Fatal(format!("missing input from '{}'", dep)))?;
    serde_json::from_value(value)
        .map_err(|e| StepError::Fatal(format!("invalid input from '{}': {}", dep, e)))
}

/// Build the three-step stock pipeline over the given resources
pub fn stock_pipeline(
    reader: Arc<dyn ObjectReader>,
    sink: Arc<dyn KeyValueSink>,
) -> Result<Pipeline, ConfigurationError> {
    Pipeline::new(
        "stock_pipeline",
        vec![
            StepDef::new(GET_S3_DATA, Arc::new(GetS3Data { reader })),
            StepDef::new(PROCESS_DATA, transform(process_data)).after(GET_S3_DATA),
            StepDef::new(PUT_REDIS_DATA, Arc::new(PutRedisData { sink })).after(PROCESS_DATA),
        ],
    )
}
