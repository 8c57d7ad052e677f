//! Mirror quality store.
//!
//! Keeps one [`Quality`] record per mirror base URL and defines the order used
//! to pick mirrors: lower failure ratio first, then lower adjusted delay, then
//! input order.

use crate::error::Result;
use crate::types::{MirrorSource, Quality, Report};
use crate::utils;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::RwLock;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Serialised form of the store: mirror base URL -> record.
pub type QualitySnapshot = BTreeMap<String, Quality>;

pub struct QualityStore {
    records: RwLock<HashMap<String, Quality>>,
    /// 静态延迟修正 (来自 mirrors.json 的 adjust_delay), 只在比较时使用
    adjust_delays: HashMap<String, i64>,
    /// Serialises snapshot writes.
    persist_lock: Mutex<()>,
}

impl QualityStore {
    pub fn new(sources: &[MirrorSource]) -> Self {
        Self::from_snapshot(sources, QualitySnapshot::new())
    }

    pub fn from_snapshot(sources: &[MirrorSource], snapshot: QualitySnapshot) -> Self {
        let adjust_delays = sources
            .iter()
            .filter(|s| s.adjust_delay != 0)
            .map(|s| (s.url.clone(), s.adjust_delay))
            .collect();
        Self {
            records: RwLock::new(snapshot.into_iter().collect()),
            adjust_delays,
            persist_lock: Mutex::new(()),
        }
    }

    /// 从快照文件恢复
    /// 文件缺失: 空 Store; 格式错误: 记录警告后同样从空 Store 开始
    pub async fn load(path: &Path, sources: &[MirrorSource]) -> Self {
        let snapshot = match fs::read_to_string(path).await {
            Ok(content) => match serde_json::from_str::<QualitySnapshot>(&content) {
                Ok(s) => s,
                Err(e) => {
                    warn!("Malformed quality file {:?}, starting empty: {}", path, e);
                    QualitySnapshot::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => QualitySnapshot::new(),
            Err(e) => {
                warn!("Can't read quality file {:?}, starting empty: {}", path, e);
                QualitySnapshot::new()
            }
        };
        debug!("Loaded quality for {} mirrors", snapshot.len());
        Self::from_snapshot(sources, snapshot)
    }

    /// Current record for `mirror`, created with defaults on first reference.
    pub fn get(&self, mirror: &str) -> Quality {
        if let Some(q) = self.read().get(mirror) {
            return *q;
        }
        *self.write().entry(mirror.to_string()).or_default()
    }

    #[cfg(test)]
    pub fn set(&self, mirror: &str, quality: Quality) {
        self.write().insert(mirror.to_string(), quality);
    }

    /// 根据一次探测结果更新对应镜像的记录
    pub fn apply(&self, report: &Report) {
        let mut records = self.write();
        let q = records.entry(report.mirror.clone()).or_default();
        q.record(report);
    }

    /// Stable sort of `mirrors`, best first. One read lock covers the whole call.
    pub fn rank(&self, mirrors: &[String]) -> Vec<String> {
        if mirrors.is_empty() {
            return Vec::new();
        }
        let records = self.read();
        let mut keyed: Vec<(&String, Quality, i64)> = mirrors
            .iter()
            .map(|m| {
                let q = records.get(m).copied().unwrap_or_default();
                (m, q, self.adjust_delay(m))
            })
            .collect();
        drop(records);

        // sort_by 是稳定排序: 完全相同时保持输入顺序
        keyed.sort_by(|(_, lq, la), (_, rq, ra)| compare(lq, *la, rq, *ra));
        keyed.into_iter().map(|(m, _, _)| m.clone()).collect()
    }

    pub fn adjust_delay(&self, mirror: &str) -> i64 {
        self.adjust_delays.get(mirror).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> QualitySnapshot {
        self.read().iter().map(|(k, v)| (k.clone(), *v)).collect()
    }

    /// Write the snapshot with write-then-rename.
    pub async fn persist(&self, path: &Path) -> Result<()> {
        let _guard = self.persist_lock.lock().await;
        let snapshot = self.snapshot();
        utils::write_json_atomic(path, &snapshot).await
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Quality>> {
        self.records.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Quality>> {
        self.records.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// `Less` means `l` is the better mirror.
///
/// Failure ratios are compared cross-multiplied so an unseen mirror (0/0)
/// needs no division; ties fall back to the adjusted average delay.
pub fn compare(l: &Quality, l_adjust: i64, r: &Quality, r_adjust: i64) -> Ordering {
    let lhs = l.failed_count as u128 * r.access_count as u128;
    let rhs = r.failed_count as u128 * l.access_count as u128;
    lhs.cmp(&rhs).then_with(|| {
        let l_delay = i64::try_from(l.average_delay_ms)
            .unwrap_or(i64::MAX)
            .saturating_add(l_adjust);
        let r_delay = i64::try_from(r.average_delay_ms)
            .unwrap_or(i64::MAX)
            .saturating_add(r_adjust);
        l_delay.cmp(&r_delay)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    const M1: &str = "https://m1.ex/";
    const M2: &str = "https://m2.ex/";

    fn q(access: u64, failed: u64, avg: u64) -> Quality {
        Quality {
            access_count: access,
            failed_count: failed,
            average_delay_ms: avg,
        }
    }

    fn report(mirror: &str, delay_ms: u64, failed: bool) -> Report {
        Report {
            mirror: mirror.to_string(),
            url: String::new(),
            delay: Duration::from_millis(delay_ms),
            failed,
            status_code: if failed { 503 } else { 200 },
        }
    }

    fn list(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_get_materialises_default() {
        let store = QualityStore::new(&[]);
        assert_eq!(store.get(M1), Quality::default());
        assert!(store.snapshot().contains_key(M1));
    }

    #[test]
    fn test_apply_updates_counts_and_mean() {
        let store = QualityStore::new(&[]);
        store.set(M1, q(4, 1, 100));

        store.apply(&report(M1, 200, true));
        store.apply(&report(M1, 50, false));

        let got = store.get(M1);
        assert_eq!(got.access_count, 6);
        assert_eq!(got.failed_count, 2);
        // (100*4 + 200) / 5 = 120, (120*5 + 50) / 6 = 108
        assert_eq!(got.average_delay_ms, 108);
        assert!(got.failed_count <= got.access_count);
    }

    #[test]
    fn test_access_count_independent_of_order() {
        let a = QualityStore::new(&[]);
        let b = QualityStore::new(&[]);
        let r1 = report(M1, 10, true);
        let r2 = report(M1, 900, false);

        a.apply(&r1);
        a.apply(&r2);
        b.apply(&r2);
        b.apply(&r1);

        assert_eq!(a.get(M1).access_count, 2);
        assert_eq!(b.get(M1).access_count, 2);
        assert_eq!(a.get(M1).failed_count, b.get(M1).failed_count);
    }

    #[test]
    fn test_rank_prefers_lower_failure_ratio() {
        // 2×50 < 5×80
        let store = QualityStore::new(&[]);
        store.set(M1, q(50, 5, 150));
        store.set(M2, q(80, 2, 110));
        assert_eq!(store.rank(&list(&[M1, M2])), list(&[M2, M1]));
    }

    #[test]
    fn test_rank_ties_use_adjusted_delay() {
        let mut m1 = MirrorSource::new("m1", M1);
        m1.adjust_delay = -100;
        let store = QualityStore::new(&[m1, MirrorSource::new("m2", M2)]);
        store.set(M1, q(10, 0, 150));
        store.set(M2, q(10, 0, 100));
        // 150 - 100 < 100
        assert_eq!(store.rank(&list(&[M2, M1])), list(&[M1, M2]));
    }

    #[test]
    fn test_rank_is_stable_on_full_ties() {
        let store = QualityStore::new(&[]);
        let mirrors = list(&["https://a/", "https://b/", "https://c/", "https://d/"]);
        assert_eq!(store.rank(&mirrors), mirrors);

        let reversed: Vec<String> = mirrors.iter().rev().cloned().collect();
        assert_eq!(store.rank(&reversed), reversed);
        assert!(store.rank(&[]).is_empty());
    }

    #[test]
    fn test_compare_huge_delay_does_not_wrap() {
        let huge = q(1, 0, u64::MAX);
        let fast = q(1, 0, 100);
        assert_eq!(compare(&huge, 0, &fast, 0), Ordering::Greater);
        assert_eq!(compare(&fast, 0, &huge, i64::MAX), Ordering::Less);
        assert_eq!(compare(&huge, i64::MAX, &fast, i64::MIN), Ordering::Greater);
    }

    #[test]
    fn test_compare_is_antisymmetric() {
        let samples = [q(0, 0, 5000), q(10, 2, 100), q(10, 2, 90), q(5, 1, 100), q(3, 3, 10)];
        for a in &samples {
            assert_ne!(compare(a, 0, a, 0), Ordering::Less);
            for b in &samples {
                let ab = compare(a, 0, b, 0);
                let ba = compare(b, 0, a, 0);
                assert!(!(ab == Ordering::Less && ba == Ordering::Less));
                assert_eq!(ab, ba.reverse());
            }
        }
    }

    #[tokio::test]
    async fn test_persist_and_reload_preserves_rank() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("smartmirror_quality.json");
        let sources = vec![MirrorSource::new("m1", M1), MirrorSource::new("m2", M2)];

        let store = QualityStore::new(&sources);
        store.set(M1, q(50, 5, 150));
        store.set(M2, q(80, 2, 110));
        store.apply(&report("https://m3.ex/", 40, false));
        store.persist(&path).await?;

        let reloaded = QualityStore::load(&path, &sources).await;
        assert_eq!(reloaded.snapshot(), store.snapshot());

        let mirrors = list(&["https://m3.ex/", M1, M2, "https://unseen/"]);
        assert_eq!(reloaded.rank(&mirrors), store.rank(&mirrors));
        Ok(())
    }

    #[tokio::test]
    async fn test_load_missing_or_malformed_is_empty() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("smartmirror_quality.json");

        assert!(QualityStore::load(&path, &[]).await.snapshot().is_empty());

        fs::write(&path, "[1, 2").await?;
        assert!(QualityStore::load(&path, &[]).await.snapshot().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_load_legacy_snapshot() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("smartmirror_quality.json");
        fs::write(
            &path,
            r#"{
                "https://m1.ex/": {"detect_count": 50, "access_count": 50, "failed_count": 5, "average_delay": 150},
                "https://m2.ex/": {"detect_count": 80, "access_count": 80, "failed_count": 2, "average_delay": 110}
            }"#,
        )
        .await?;

        let store = QualityStore::load(&path, &[]).await;
        assert_eq!(store.get(M1), q(50, 5, 150));
        assert_eq!(store.rank(&list(&[M1, M2])), list(&[M2, M1]));
        Ok(())
    }
}
