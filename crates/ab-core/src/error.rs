use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to encode compute request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Invalid result line from compute process: {0:?}")]
    InvalidResult(String),
}

pub type Result<T> = std::result::Result<T, Error>;
