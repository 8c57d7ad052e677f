use crate::error::{MirrorError, Result};
use crate::types::MirrorSource;
use crate::utils;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

/// Environment variable carrying the process state directory.
pub const STATE_DIR_ENV: &str = "STATE_DIRECTORY";

pub const MIRRORS_FILE: &str = "mirrors.json";
pub const QUALITY_FILE: &str = "smartmirror_quality.json";
pub const CONFIG_FILE: &str = "smartmirror_config.json";

/// 状态目录及其中的三个文件
#[derive(Debug, Clone)]
pub struct StatePaths {
    dir: PathBuf,
}

impl StatePaths {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Resolve the state directory
    /// Strategy:
    /// 1. Explicit override (CLI `--state-dir`)
    /// 2. `$STATE_DIRECTORY`, as set by the service manager
    /// 3. Fallback to the per-user data dir (~/.local/share/smartmirror)
    pub fn resolve(override_dir: Option<PathBuf>) -> Self {
        if let Some(dir) = override_dir {
            return Self::new(dir);
        }
        if let Some(dir) = std::env::var_os(STATE_DIR_ENV).filter(|v| !v.is_empty()) {
            return Self::new(dir);
        }
        match ProjectDirs::from("", "", "smartmirror") {
            Some(proj_dirs) => Self::new(proj_dirs.data_dir()),
            None => Self::new("."),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn mirrors(&self) -> PathBuf {
        self.dir.join(MIRRORS_FILE)
    }

    pub fn quality(&self) -> PathBuf {
        self.dir.join(QUALITY_FILE)
    }

    pub fn config(&self) -> PathBuf {
        self.dir.join(CONFIG_FILE)
    }
}

/// 读取镜像列表
/// 文件缺失或格式错误都是致命错误
pub async fn load_mirror_sources(path: &Path) -> Result<Vec<MirrorSource>> {
    let content = fs::read_to_string(path)
        .await
        .map_err(|e| MirrorError::MirrorList {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    let sources: Vec<MirrorSource> =
        serde_json::from_str(&content).map_err(|e| MirrorError::MirrorList {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    let sources: Vec<MirrorSource> = sources.into_iter().filter(|s| !s.url.is_empty()).collect();
    debug!("Loaded {} mirror sources from {:?}", sources.len(), path);
    Ok(sources)
}

/// 持久化的服务开关
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(default = "default_enable", alias = "Enable")]
    pub enable: bool,
}

fn default_enable() -> bool {
    true
}

impl Default for Configuration {
    fn default() -> Self {
        Self { enable: true }
    }
}

impl Configuration {
    /// Missing or malformed file falls back to `enable = true`.
    pub async fn load(path: &Path) -> Self {
        let content = match fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) => {
                warn!("Can't load config file {:?}: {}", path, e);
                return Self::default();
            }
        };
        match serde_json::from_str(&content) {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!("Malformed config file {:?}: {}", path, e);
                Self::default()
            }
        }
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        utils::write_json_atomic(path, self).await
    }
}
