use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("byte {byte} is outside the {vocab_size}-character vocabulary")]
    OutOfVocabulary { byte: u8, vocab_size: usize },

    #[error("serializing model: {0}")]
    Serialize(String),

    #[error("malformed model artifact: {0}")]
    Deserialize(String),

    #[error("model has no recurrent stack yet")]
    NotBuilt,
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
