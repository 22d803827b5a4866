use common_kafka::kafka_consumer::RecvErr;
use common_kafka::kafka_producer::KafkaProduceError;
use thiserror::Error;
use topk_core::StoreError;

/// Errors of the provider adapter service.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("invalid adapter url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("adapter url cannot be a base: {0}")]
    NotABaseUrl(String),
    #[error("provider request failed: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("provider responded with {status}")]
    UnexpectedStatus { status: reqwest::StatusCode },
}

/// Errors of a single crawl, or of the consumption loop.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("store error: {0}")]
    StoreError(#[from] StoreError),
    #[error("fetch failed: {0}")]
    FetchError(#[from] ProviderError),
    #[error("failed to publish {failed} of {total} events: {first}")]
    PublishError {
        failed: usize,
        total: usize,
        first: KafkaProduceError,
    },
    #[error("failed to receive a crawl job: {0}")]
    RecvError(#[from] RecvErr),
}
