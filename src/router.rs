//! Smart mirror router.
//!
//! `SmartMirror` answers `Query` calls: it classifies the requested URL,
//! probes a handful of mirrors for package files, and hands every probe
//! report to a single background writer that updates the quality store and
//! rewrites the snapshot.

use crate::config::{self, Configuration, StatePaths};
use crate::error::Result;
use crate::lifecycle::Lifecycle;
use crate::prober::{PendingReports, Prober};
use crate::quality::QualityStore;
use crate::selector::{self, EXPLOIT_COUNT};
use crate::traits::MirrorRouter;
use crate::types::{MirrorSource, Quality, Report, RouteRequest};
use crate::utils;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, info, warn};

/// 探测报告通道容量, 满了则生产者阻塞
pub const REPORT_CHANNEL_CAPACITY: usize = 256;

/// What to do with an incoming URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteAction {
    /// Return the URL unchanged.
    PassThrough,
    /// HEAD the official URL itself and return where it redirects.
    ResolveRelease,
    /// Probe mirrors and return the first one that answers.
    Probe,
}

/// Decide the action for `original` under `official` (enabled service).
pub fn classify_request(original: &str, official: &str) -> RouteAction {
    if !utils::valid_url(original) || !utils::valid_url(official) {
        return RouteAction::PassThrough;
    }
    let Some(rest) = original.strip_prefix(official) else {
        return RouteAction::PassThrough;
    };
    // https://off.example 不能匹配 https://off.example.net/...
    if !official.ends_with('/') && !rest.is_empty() && !rest.starts_with('/') {
        return RouteAction::PassThrough;
    }

    let rest = rest.split(['?', '#']).next().unwrap_or_default();
    let path = format!("/{}", rest.trim_start_matches('/'));

    if path.contains("/pool/") {
        return RouteAction::Probe;
    }
    if path.contains("/dists/") {
        if path.ends_with("Release") {
            return RouteAction::ResolveRelease;
        }
        if path.contains("/by-hash/") {
            return RouteAction::Probe;
        }
    }
    RouteAction::PassThrough
}

/// Substitution used while the service is disabled; ignores quality data.
pub fn disabled_route(req: &RouteRequest) -> String {
    match utils::replace_prefix(&req.original_url, &req.official_base, &req.mirror_hint) {
        Some(url) if utils::valid_url(&url) => url,
        _ => req.original_url.clone(),
    }
}

/// One drained probe batch, sent to the writer.
struct ReportBatch {
    reports: Vec<Report>,
    /// Signalled once the batch is applied and the snapshot write attempted.
    persisted: oneshot::Sender<()>,
}

/// Hand `reports` to the writer and wait until they are on disk.
async fn record_batch(report_tx: &mpsc::Sender<ReportBatch>, reports: Vec<Report>) {
    if reports.is_empty() {
        return;
    }
    let count = reports.len();
    let (persisted, done) = oneshot::channel();
    if report_tx.send(ReportBatch { reports, persisted }).await.is_err() {
        warn!("Quality writer stopped, dropping {} reports", count);
        return;
    }
    let _ = done.await;
}

pub struct SmartMirror {
    sources: Vec<MirrorSource>,
    mirror_urls: Vec<String>,
    store: Arc<QualityStore>,
    prober: Prober,
    config_path: PathBuf,
    config_lock: Mutex<()>,
    enable_tx: watch::Sender<bool>,
    report_tx: mpsc::Sender<ReportBatch>,
    lifecycle: Arc<Lifecycle>,
}

impl SmartMirror {
    /// 启动时加载镜像列表、质量快照和配置
    /// mirrors.json 缺失或格式错误是致命错误
    pub async fn load(paths: &StatePaths, prober: Prober) -> Result<Self> {
        let sources = config::load_mirror_sources(&paths.mirrors()).await?;
        let store = QualityStore::load(&paths.quality(), &sources).await;
        let configuration = Configuration::load(&paths.config()).await;
        info!(
            "Loaded {} mirrors, enable={}, state dir {:?}",
            sources.len(),
            configuration.enable,
            paths.dir()
        );
        Ok(Self::new(paths, sources, store, configuration, prober))
    }

    /// Must be called inside a tokio runtime: spawns the store writer.
    pub fn new(
        paths: &StatePaths,
        sources: Vec<MirrorSource>,
        store: QualityStore,
        configuration: Configuration,
        prober: Prober,
    ) -> Self {
        let mirror_urls = sources.iter().map(|s| s.url.clone()).collect();
        let store = Arc::new(store);
        let lifecycle = Arc::new(Lifecycle::new());
        let (report_tx, report_rx) = mpsc::channel(REPORT_CHANNEL_CAPACITY);
        let (enable_tx, _) = watch::channel(configuration.enable);

        tokio::spawn(run_writer(store.clone(), paths.quality(), report_rx));

        Self {
            sources,
            mirror_urls,
            store,
            prober,
            config_path: paths.config(),
            config_lock: Mutex::new(()),
            enable_tx,
            report_tx,
            lifecycle,
        }
    }

    pub fn sources(&self) -> &[MirrorSource] {
        &self.sources
    }

    #[cfg(test)]
    pub fn store(&self) -> &QualityStore {
        &self.store
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// Known mirrors with their quality, best first.
    pub fn ranked(&self) -> Vec<(MirrorSource, Quality)> {
        self.store
            .rank(&self.mirror_urls)
            .into_iter()
            .filter_map(|url| {
                let source = self.sources.iter().find(|s| s.url == url)?.clone();
                let quality = self.store.get(&url);
                Some((source, quality))
            })
            .collect()
    }

    /// Mirrors every request will probe first.
    pub fn exploit_set(&self) -> Vec<String> {
        self.store
            .rank(&self.mirror_urls)
            .into_iter()
            .take(EXPLOIT_COUNT)
            .collect()
    }

    pub async fn route(&self, req: &RouteRequest) -> String {
        if !self.enable() {
            return disabled_route(req);
        }

        match classify_request(&req.original_url, &req.official_base) {
            RouteAction::PassThrough => req.original_url.clone(),
            RouteAction::ResolveRelease => {
                let (url, status) = self.prober.head(&req.original_url).await;
                if url.is_empty() {
                    warn!("Release lookup failed ({}), fallback {}", status, req.original_url);
                    req.original_url.clone()
                } else {
                    url
                }
            }
            RouteAction::Probe => self.probe_and_route(req).await,
        }
    }

    async fn probe_and_route(&self, req: &RouteRequest) -> String {
        let probe_set = selector::select(&self.store, &self.mirror_urls);
        if probe_set.is_empty() {
            return req.original_url.clone();
        }

        self.lifecycle.dispatched(probe_set.len());
        let (chosen, pending) = self
            .prober
            .probe(&req.original_url, &req.official_base, &probe_set)
            .await;
        self.spawn_report_handler(req.original_url.clone(), probe_set.len(), pending);

        if chosen.is_empty() {
            info!("No mirror answered, fallback {}", req.original_url);
            req.original_url.clone()
        } else {
            chosen
        }
    }

    /// Waits for the batch in the background, records it and sends the
    /// report HEAD. The probes stay outstanding until all of that is done.
    fn spawn_report_handler(&self, original: String, dispatched: usize, pending: PendingReports) {
        let report_tx = self.report_tx.clone();
        let lifecycle = self.lifecycle.clone();
        let prober = self.prober.clone();

        tokio::spawn(async move {
            let reports = pending.wait().await;
            log_batch(&reports);

            record_batch(&report_tx, reports.clone()).await;
            prober.send_report(&original, &reports).await;
            lifecycle.settled(dispatched);
        });
    }

    /// Probe every known mirror for `path` and record the outcome.
    pub async fn check_all(&self, path: &str) -> Vec<Report> {
        let dispatched = self.sources.len();
        self.lifecycle.dispatched(dispatched);
        let reports = utils::benchmark_mirrors(&self.prober, &self.sources, path).await;
        record_batch(&self.report_tx, reports.clone()).await;
        self.lifecycle.settled(dispatched);
        reports
    }
}

#[async_trait]
impl MirrorRouter for SmartMirror {
    async fn query(&self, original: &str, official: &str, mirror_hint: &str) -> String {
        self.lifecycle.touch();
        let req = RouteRequest::new(original, official, mirror_hint);
        let result = self.route(&req).await;
        debug!("query {} -> {}", original, result);
        result
    }

    async fn set_enable(&self, enable: bool) -> Result<()> {
        self.lifecycle.touch();
        let _guard = self.config_lock.lock().await;
        let changed = self.enable_tx.send_replace(enable) != enable;
        if changed {
            info!("Smart mirror enable set to {}", enable);
        }
        Configuration { enable }.save(&self.config_path).await
    }

    fn enable(&self) -> bool {
        *self.enable_tx.borrow()
    }

    fn subscribe_enable(&self) -> watch::Receiver<bool> {
        self.enable_tx.subscribe()
    }

    fn can_quit(&self) -> bool {
        self.lifecycle.can_quit()
    }
}

/// Single consumer of probe reports: apply, persist, then acknowledge.
async fn run_writer(
    store: Arc<QualityStore>,
    quality_path: PathBuf,
    mut report_rx: mpsc::Receiver<ReportBatch>,
) {
    while let Some(batch) = report_rx.recv().await {
        for report in &batch.reports {
            store.apply(report);
        }
        if let Err(e) = store.persist(&quality_path).await {
            warn!("Failed to persist quality to {:?}: {}", quality_path, e);
        }
        let _ = batch.persisted.send(());
    }
    debug!("Quality writer stopped");
}

fn log_batch(reports: &[Report]) {
    let selected = reports
        .iter()
        .filter(|r| !r.failed)
        .min_by_key(|r| r.delay)
        .map(|r| r.mirror.as_str())
        .unwrap_or("-");
    info!(
        "Probe batch done: {} probes, {} failed, fastest {}",
        reports.len(),
        reports.iter().filter(|r| r.failed).count(),
        selected
    );
    for r in reports {
        debug!("detect {}", r);
    }
}
