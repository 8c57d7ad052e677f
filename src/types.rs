use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// 首次观测到某个镜像时的平均延迟 (毫秒)
pub const INITIAL_AVERAGE_DELAY_MS: u64 = 5000;

/// 镜像源定义 (来自 mirrors.json)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MirrorSource {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String, // 例如: "[CN] Tsinghua University"
    #[serde(default)]
    pub url: String, // 以 '/' 结尾的 base URL
    #[serde(default)]
    pub name_locale: HashMap<String, String>,
    #[serde(default)]
    pub weight: i64,
    #[serde(default)]
    pub country: String,
    /// Signed bias (ms) added to the measured delay when ranking.
    #[serde(default)]
    pub adjust_delay: i64,
}

impl MirrorSource {
    #[cfg(test)]
    pub fn new(name: &str, url: &str) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            ..Default::default()
        }
    }
}

/// Per-mirror access statistics, persisted in `smartmirror_quality.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quality {
    #[serde(default)]
    pub access_count: u64,
    #[serde(default)]
    pub failed_count: u64,
    #[serde(default = "default_average_delay", rename = "average_delay")]
    pub average_delay_ms: u64,
}

fn default_average_delay() -> u64 {
    INITIAL_AVERAGE_DELAY_MS
}

impl Default for Quality {
    fn default() -> Self {
        Self {
            access_count: 0,
            failed_count: 0,
            average_delay_ms: INITIAL_AVERAGE_DELAY_MS,
        }
    }
}

impl Quality {
    /// Fold one probe outcome into the record.
    pub fn record(&mut self, report: &Report) {
        if report.failed {
            self.failed_count = self.failed_count.saturating_add(1);
        }
        // 快照里的值可能很大, 饱和运算避免溢出
        let total = self
            .average_delay_ms
            .saturating_mul(self.access_count)
            .saturating_add(report.delay_ms());
        self.access_count = self.access_count.saturating_add(1);
        self.average_delay_ms = total / self.access_count;
    }
}

/// 单次探测的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub mirror: String,
    /// Resolved URL, empty when the probe failed.
    pub url: String,
    pub delay: Duration,
    pub failed: bool,
    /// HTTP status, or a negative sentinel from `prober` when no response was classified.
    pub status_code: i32,
}

impl Report {
    pub fn delay_ms(&self) -> u64 {
        self.delay.as_millis() as u64
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed={} {}ms status={}",
            self.mirror,
            self.failed,
            self.delay_ms(),
            self.status_code
        )
    }
}

/// Inputs of one `Query` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRequest {
    pub original_url: String,
    pub official_base: String,
    pub mirror_hint: String,
}

impl RouteRequest {
    pub fn new(original_url: &str, official_base: &str, mirror_hint: &str) -> Self {
        Self {
            original_url: original_url.to_string(),
            official_base: official_base.to_string(),
            mirror_hint: mirror_hint.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(delay_ms: u64, failed: bool) -> Report {
        Report {
            mirror: "https://m1.ex/".to_string(),
            url: String::new(),
            delay: Duration::from_millis(delay_ms),
            failed,
            status_code: if failed { 503 } else { 200 },
        }
    }

    #[test]
    fn test_first_record_replaces_initial_delay() {
        let mut q = Quality::default();
        q.record(&report(80, false));
        assert_eq!(q.access_count, 1);
        assert_eq!(q.failed_count, 0);
        // (5000 * 0 + 80) / 1
        assert_eq!(q.average_delay_ms, 80);
    }

    #[test]
    fn test_running_mean_uses_integer_division() {
        let mut q = Quality {
            access_count: 2,
            failed_count: 1,
            average_delay_ms: 100,
        };
        q.record(&report(51, true));
        assert_eq!(q.access_count, 3);
        assert_eq!(q.failed_count, 2);
        assert_eq!(q.average_delay_ms, (100 * 2 + 51) / 3);
        assert!(q.failed_count <= q.access_count);
    }

    #[test]
    fn test_record_saturates_on_huge_snapshot_values() {
        let mut q = Quality {
            access_count: u64::MAX / 2,
            failed_count: 3,
            average_delay_ms: u64::MAX / 4,
        };
        q.record(&report(10, true));
        assert_eq!(q.access_count, u64::MAX / 2 + 1);
        assert_eq!(q.failed_count, 4);
        assert!(q.average_delay_ms > 0);

        let mut full = Quality {
            access_count: u64::MAX,
            failed_count: u64::MAX,
            average_delay_ms: 1,
        };
        full.record(&report(10, true));
        assert_eq!(full.access_count, u64::MAX);
        assert_eq!(full.failed_count, u64::MAX);
    }

    #[test]
    fn test_mirror_source_ignores_unknown_fields() {
        let raw = r#"{
            "id": "TUNA",
            "name": "[CN] Tsinghua University",
            "url": "http://mirrors.tuna.tsinghua.edu.cn/deepin/",
            "name_locale": {"zh_CN": "[CN] 清华大学"},
            "weight": 60000,
            "country": "CN",
            "adjust_delay": -20,
            "urlFtp": "ftp://ignored"
        }"#;
        let m: MirrorSource = serde_json::from_str(raw).unwrap();
        assert_eq!(m.id, "TUNA");
        assert_eq!(m.adjust_delay, -20);
        assert_eq!(m.weight, 60000);
        assert_eq!(m.name_locale.get("zh_CN").unwrap(), "[CN] 清华大学");
    }

    #[test]
    fn test_quality_missing_fields_take_defaults() {
        let q: Quality = serde_json::from_str(r#"{"detect_count": 9, "access_count": 4}"#).unwrap();
        assert_eq!(q.access_count, 4);
        assert_eq!(q.failed_count, 0);
        assert_eq!(q.average_delay_ms, INITIAL_AVERAGE_DELAY_MS);
    }
}
