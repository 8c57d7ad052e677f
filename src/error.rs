use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MirrorError {
    #[error("IO operation failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// 镜像列表缺失或格式错误，启动时为致命错误
    #[error("Failed to load mirror list {path:?}: {reason}")]
    MirrorList { path: PathBuf, reason: String },

    #[error("{0}")]
    Custom(String),
}

pub type Result<T> = std::result::Result<T, MirrorError>;
