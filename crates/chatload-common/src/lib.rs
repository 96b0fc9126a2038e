pub type Result<T> = core::result::Result<T, ChatloadError>;

#[derive(thiserror::Error, Debug)]
pub enum ChatloadError {
    #[error("invalid config: {0}")]
    Config(String),
    #[error("invalid duration '{0}': expected forms like 500ms, 10s, 2m or 1h")]
    Duration(String),
    #[error("invalid threshold '{expr}': {reason}")]
    Threshold { expr: String, reason: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("http error: {0}")]
    Http(String),
    #[error("{0}")]
    Message(String),
}

pub mod config;
pub mod duration;
