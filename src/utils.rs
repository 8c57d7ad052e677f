use crate::error::{MirrorError, Result};
use crate::prober::Prober;
use crate::types::{MirrorSource, Report};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::path::Path;
use tokio::fs;
use url::Url;

/// 原子写入 JSON 文件
/// 先写入同目录下的 `<name>.tmp`，再 rename 覆盖目标文件
pub async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_vec_pretty(value)?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let file_name = path
        .file_name()
        .ok_or_else(|| MirrorError::Custom(format!("Not a file path: {:?}", path)))?
        .to_string_lossy();
    let temp_path = path.with_file_name(format!("{}.tmp", file_name));

    fs::write(&temp_path, content).await?;
    if let Err(e) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(e.into());
    }
    Ok(())
}

/// An absolute URL with a host, e.g. `https://off.example/`.
pub fn valid_url(raw: &str) -> bool {
    match Url::parse(raw) {
        Ok(u) => u.has_host(),
        Err(_) => false,
    }
}

/// Replace the leading `base` of `url` with `replacement`; `None` if `url` does not start with `base`.
pub fn replace_prefix(url: &str, base: &str, replacement: &str) -> Option<String> {
    if base.is_empty() {
        return None;
    }
    url.strip_prefix(base)
        .map(|rest| format!("{}{}", replacement, rest))
}

/// Move `url` from under `base` to under `mirror`.
///
/// The remainder after `base` is joined to `mirror` with exactly one `/`,
/// so `https://off.example` and `https://off.example/` give the same result.
pub fn rebase(url: &str, base: &str, mirror: &str) -> Option<String> {
    if base.is_empty() {
        return None;
    }
    let rest = url.strip_prefix(base)?;
    Some(format!(
        "{}/{}",
        mirror.trim_end_matches('/'),
        rest.trim_start_matches('/')
    ))
}

/// 只保留主机名, 用于上报头 (https://m1.ex/deepin/ -> m1.ex)
pub fn host_of(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(u) => u.host_str().map(str::to_string).unwrap_or_else(|| raw.to_string()),
        Err(_) => raw.to_string(),
    }
}

/// 并发探测所有镜像源
///
/// 逻辑:
/// 1. 为每个镜像源拼出 `<base><path>`
/// 2. 每个镜像一个异步任务 (HEAD, 2 秒超时)
/// 3. 并行等待所有任务完成 (join_all)
/// 4. 成功的按延迟从小到大排在前面，失败的排在后面
pub async fn benchmark_mirrors(prober: &Prober, mirrors: &[MirrorSource], path: &str) -> Vec<Report> {
    let pb = ProgressBar::new(mirrors.len() as u64);
    if let Ok(style) = ProgressStyle::with_template("[{bar:40.cyan/blue}] {percent}% {msg}") {
        pb.set_style(style.progress_chars("|| "));
    }
    pb.set_message("Testing...");

    let path = path.trim_start_matches('/');
    let tasks = mirrors.iter().map(|m| {
        let pb = pb.clone();
        let candidate = format!("{}{}", m.url, path);
        async move {
            let report = prober.probe_one(&m.url, &candidate).await;
            pb.inc(1);
            report
        }
    });

    let mut results = futures::future::join_all(tasks).await;

    pb.finish_with_message("Testing completed.");

    results.sort_by_key(|r| (r.failed, r.delay));
    results
}
