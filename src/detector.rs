use crate::prober::{Prober, PROBE_TIMEOUT};
use reqwest::Method;
use std::fmt;
use std::time::Duration;
use tokio::task::JoinHandle;

/// 单次检测的结果, 同时作为进程退出码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hit {
    Official = 1,
    Mirror = 2,
    NotFound = 3,
}

impl Hit {
    pub fn exit_code(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for Hit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Hit::Official => "Official Hit",
            Hit::Mirror => "Mirror Hit",
            Hit::NotFound => "Not Found Any",
        };
        f.write_str(s)
    }
}

/// Check one file on the official host and on a mirror at the same time.
///
/// A mirror answer within the deadline wins. Otherwise the official answer
/// is used, waiting at most one more deadline if the mirror failed early.
pub async fn detect(prober: &Prober, official_url: &str, mirror_url: &str) -> Hit {
    detect_within(prober, official_url, mirror_url, PROBE_TIMEOUT).await
}

async fn detect_within(prober: &Prober, official_url: &str, mirror_url: &str, deadline: Duration) -> Hit {
    let official = spawn_check(prober, Method::HEAD, official_url);
    let mirror = spawn_check(prober, Method::GET, mirror_url);

    match tokio::time::timeout(deadline, mirror).await {
        Ok(Ok(true)) => Hit::Mirror,
        Ok(_) => official_within(official, deadline).await,
        Err(_) => official_within(official, Duration::ZERO).await,
    }
}

fn spawn_check(prober: &Prober, method: Method, url: &str) -> JoinHandle<bool> {
    let prober = prober.clone();
    let url = url.to_string();
    tokio::spawn(async move { !prober.check(method, &url, &[]).await.0.is_empty() })
}

async fn official_within(official: JoinHandle<bool>, wait: Duration) -> Hit {
    match tokio::time::timeout(wait, official).await {
        Ok(Ok(true)) => Hit::Official,
        _ => Hit::NotFound,
    }
}
