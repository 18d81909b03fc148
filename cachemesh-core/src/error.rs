use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache not found: {0}")]
    CacheNotFound(String),

    #[error("cache load failed: {0}")]
    CacheLoad(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("frame desync: {0}")]
    FrameDesync(String),

    #[error("cluster communication error: {0}")]
    ClusterCommunication(String),

    #[error("circuit open for peer {0}")]
    CircuitOpen(String),

    #[error("backpressure: {0}")]
    Backpressure(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("shutdown error: {0}")]
    Shutdown(String),
}

impl Error {
    /// Transport-layer failures are retryable; protocol rejections are not.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Io(_) | Error::ClusterCommunication(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
