//! HEAD probes against candidate mirrors.
//!
//! [`Prober::probe`] fans out one task per mirror and returns as soon as one
//! of them succeeds. The remaining probes keep running; all of their reports
//! are delivered later through [`PendingReports`].

use crate::error::Result;
use crate::types::Report;
use crate::utils;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, LOCATION, USER_AGENT};
use reqwest::{Client, Method};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

/// 单个请求的超时
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
/// 等待首个成功结果的时间, 超过则回退到官方地址
pub const FIRST_SUCCESS_DEADLINE: Duration = Duration::from_secs(2);
/// 整批探测的硬性截止时间
pub const BATCH_DEADLINE: Duration = Duration::from_secs(5);

pub const DETECTOR_NAME: &str = "detector";

// Status codes recorded when no HTTP status could be classified.
pub const STATUS_BUILD_ERROR: i32 = -1;
pub const STATUS_TRANSPORT_ERROR: i32 = -2;
pub const STATUS_UNKNOWN_CLASS: i32 = -3;
pub const STATUS_TIMEOUT: i32 = -4;

const MACHINE_ID_PATH: &str = "/etc/machine-id";
const OS_RELEASE_PATH: &str = "/etc/os-release";

/// 探测请求携带的客户端标识
#[derive(Debug, Clone)]
pub struct ProbeHeaders {
    pub user_agent: String,
    pub machine_id: String,
}

impl ProbeHeaders {
    #[cfg(test)]
    pub fn new(user_agent: &str, machine_id: &str) -> Self {
        Self {
            user_agent: user_agent.to_string(),
            machine_id: machine_id.to_string(),
        }
    }

    /// Reads the distro descriptor and machine id once.
    pub fn detect() -> Self {
        let distro = std::fs::read_to_string(OS_RELEASE_PATH)
            .ok()
            .and_then(|content| pretty_name(&content))
            .unwrap_or_else(|| "unknown".to_string());
        let machine_id = std::fs::read_to_string(MACHINE_ID_PATH)
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        Self {
            user_agent: user_agent(&distro),
            machine_id,
        }
    }
}

/// `detector/<version> <arch> <distro>`
pub fn user_agent(distro: &str) -> String {
    format!(
        "{}/{} {} {}",
        DETECTOR_NAME,
        env!("CARGO_PKG_VERSION"),
        std::env::consts::ARCH,
        distro
    )
}

fn pretty_name(os_release: &str) -> Option<String> {
    os_release
        .lines()
        .find_map(|line| line.strip_prefix("PRETTY_NAME="))
        .map(|v| v.trim().trim_matches('"').to_string())
        .filter(|v| !v.is_empty())
}

/// `M1` header value: `host:T<ms>` for successes, `host:E<status>` for failures.
pub fn report_header(reports: &[Report]) -> String {
    reports
        .iter()
        .map(|r| {
            let status = if r.failed {
                format!("E{}", r.status_code)
            } else {
                format!("T{}", r.delay_ms())
            };
            format!("{}:{}", utils::host_of(&r.mirror), status)
        })
        .collect::<Vec<_>>()
        .join(";")
}

/// Map a response to the usable URL, or `None` for a failure.
///
/// 1xx/2xx keep the candidate, 3xx follow `Location` (resolved against the
/// candidate) when it parses, 4xx/5xx fail.
pub fn classify(status: u16, location: Option<&str>, candidate: &str) -> Option<String> {
    match status / 100 {
        1 | 2 => Some(candidate.to_string()),
        3 => {
            let resolved = location.and_then(|loc| {
                Url::parse(candidate)
                    .ok()
                    .and_then(|base| base.join(loc).ok())
            });
            Some(resolved.map(String::from).unwrap_or_else(|| candidate.to_string()))
        }
        _ => None,
    }
}

/// Reports of a probe batch, available once every probe has finished or the
/// batch deadline has passed.
pub struct PendingReports {
    handle: JoinHandle<Vec<Report>>,
}

impl PendingReports {
    pub async fn wait(self) -> Vec<Report> {
        match self.handle.await {
            Ok(reports) => reports,
            Err(e) => {
                warn!("Probe collector failed: {}", e);
                Vec::new()
            }
        }
    }
}

/// 进程内共享的探测器 (reqwest::Client 内部是 Arc, clone 代价很低)
#[derive(Clone)]
pub struct Prober {
    client: Client,
    headers: ProbeHeaders,
    probe_timeout: Duration,
    first_success_deadline: Duration,
    batch_deadline: Duration,
}

impl Prober {
    pub fn new(headers: ProbeHeaders) -> Result<Self> {
        // 不自动跟随跳转: 3xx 的 Location 由 classify 处理
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            client,
            headers,
            probe_timeout: PROBE_TIMEOUT,
            first_success_deadline: FIRST_SUCCESS_DEADLINE,
            batch_deadline: BATCH_DEADLINE,
        })
    }

    #[cfg(test)]
    pub fn with_deadlines(mut self, probe: Duration, first_success: Duration, batch: Duration) -> Self {
        self.probe_timeout = probe;
        self.first_success_deadline = first_success;
        self.batch_deadline = batch;
        self
    }

    fn header_map(&self, extra: &[(&'static str, String)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        if let Ok(v) = HeaderValue::from_str(&self.headers.user_agent) {
            map.insert(USER_AGENT, v);
        }
        if let Ok(v) = HeaderValue::from_str(&self.headers.machine_id) {
            map.insert(HeaderName::from_static("mid"), v);
        }
        for (name, value) in extra {
            if let Ok(v) = HeaderValue::from_str(value) {
                map.insert(HeaderName::from_static(*name), v);
            }
        }
        map
    }

    /// Send one request and classify it: `(resolved_url, status)`; the URL is
    /// empty when the outcome is a failure.
    pub async fn check(
        &self,
        method: Method,
        url: &str,
        extra: &[(&'static str, String)],
    ) -> (String, i32) {
        let parsed = match Url::parse(url) {
            Ok(u) => u,
            Err(e) => {
                debug!("Can't build request for {}: {}", url, e);
                return (String::new(), STATUS_BUILD_ERROR);
            }
        };

        let request = self
            .client
            .request(method, parsed)
            .headers(self.header_map(extra))
            .timeout(self.probe_timeout);

        match request.send().await {
            Ok(resp) => {
                let status = resp.status().as_u16();
                let location = resp
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok());
                match classify(status, location, url) {
                    Some(resolved) => (resolved, status as i32),
                    None if status >= 600 => (String::new(), STATUS_UNKNOWN_CLASS),
                    None => (String::new(), status as i32),
                }
            }
            Err(e) if e.is_timeout() => (String::new(), STATUS_TIMEOUT),
            Err(e) if e.is_builder() => (String::new(), STATUS_BUILD_ERROR),
            Err(e) => {
                debug!("Request to {} failed: {}", url, e);
                (String::new(), STATUS_TRANSPORT_ERROR)
            }
        }
    }

    pub async fn head(&self, url: &str) -> (String, i32) {
        self.check(Method::HEAD, url, &[]).await
    }

    /// HEAD one candidate URL and time it.
    pub async fn probe_one(&self, mirror: &str, candidate: &str) -> Report {
        let start = Instant::now();
        let (url, status_code) = self.head(candidate).await;
        let report = Report {
            mirror: mirror.to_string(),
            failed: url.is_empty(),
            url,
            delay: start.elapsed(),
            status_code,
        };
        debug!("probe {}", report);
        report
    }

    /// Probe `original` rewritten onto each mirror.
    ///
    /// Returns the first successful URL (empty when none succeeded within the
    /// first-success deadline) and the batch's reports, one per mirror.
    pub async fn probe(
        &self,
        original: &str,
        official: &str,
        mirrors: &[String],
    ) -> (String, PendingReports) {
        if mirrors.is_empty() {
            return (
                String::new(),
                PendingReports {
                    handle: tokio::spawn(async { Vec::new() }),
                },
            );
        }

        let (report_tx, report_rx) = mpsc::channel::<(usize, Report)>(mirrors.len());
        for (index, mirror) in mirrors.iter().enumerate() {
            let candidate = utils::rebase(original, official, mirror)
                .unwrap_or_else(|| original.replacen(official, mirror, 1));
            let prober = self.clone();
            let mirror = mirror.clone();
            let tx = report_tx.clone();
            tokio::spawn(async move {
                let report = prober.probe_one(&mirror, &candidate).await;
                let _ = tx.send((index, report)).await;
            });
        }
        drop(report_tx);

        let (chosen_tx, chosen_rx) = oneshot::channel();
        let handle = tokio::spawn(collect_reports(
            mirrors.to_vec(),
            report_rx,
            chosen_tx,
            self.batch_deadline,
        ));

        let chosen = match tokio::time::timeout(self.first_success_deadline, chosen_rx).await {
            Ok(Ok(Some(url))) => url,
            _ => String::new(),
        };
        (chosen, PendingReports { handle })
    }

    /// 整批探测结束后, 向官方地址发送一次带 M1 头的 HEAD 上报 (结果忽略)
    pub async fn send_report(&self, original: &str, reports: &[Report]) {
        if reports.is_empty() {
            return;
        }
        let header = report_header(reports);
        let _ = self.check(Method::HEAD, original, &[("m1", header)]).await;
    }
}

/// Drain one batch: forward the first success, then gather every report.
/// Probes still pending at the batch deadline are recorded as timed out.
async fn collect_reports(
    mirrors: Vec<String>,
    mut report_rx: mpsc::Receiver<(usize, Report)>,
    chosen_tx: oneshot::Sender<Option<String>>,
    batch_deadline: Duration,
) -> Vec<Report> {
    let started = Instant::now();
    let mut slots: Vec<Option<Report>> = vec![None; mirrors.len()];
    let mut received = 0;
    let mut chosen_tx = Some(chosen_tx);

    let deadline = tokio::time::sleep(batch_deadline);
    tokio::pin!(deadline);

    while received < mirrors.len() {
        tokio::select! {
            msg = report_rx.recv() => {
                let Some((index, report)) = msg else { break };
                if slots[index].is_some() {
                    continue;
                }
                if !report.failed {
                    if let Some(tx) = chosen_tx.take() {
                        let _ = tx.send(Some(report.url.clone()));
                    }
                }
                slots[index] = Some(report);
                received += 1;
            }
            _ = &mut deadline => {
                warn!("Probe batch hit the {:?} deadline with {} pending", batch_deadline, mirrors.len() - received);
                break;
            }
        }
    }

    if let Some(tx) = chosen_tx.take() {
        let _ = tx.send(None);
    }

    let elapsed = started.elapsed();
    slots
        .into_iter()
        .zip(mirrors)
        .map(|(slot, mirror)| {
            slot.unwrap_or(Report {
                mirror,
                url: String::new(),
                delay: elapsed,
                failed: true,
                status_code: STATUS_TIMEOUT,
            })
        })
        .collect()
}
