use crate::quality::QualityStore;
use rand::Rng;

/// 质量最好的镜像数 (exploit)
pub const EXPLOIT_COUNT: usize = 2;
/// 随机抽样次数 (explore, 有放回, 去重前)
pub const EXPLORE_SAMPLES: usize = 5;
/// 单次请求最多探测的镜像数
pub const MAX_PROBES: usize = 5;

/// Picks the mirrors to probe for one request: the two best-ranked mirrors,
/// followed by up to five random ones so a poor early ranking can recover.
pub fn select(store: &QualityStore, all_mirrors: &[String]) -> Vec<String> {
    select_with_rng(store, all_mirrors, &mut rand::thread_rng())
}

pub fn select_with_rng<R: Rng + ?Sized>(
    store: &QualityStore,
    all_mirrors: &[String],
    rng: &mut R,
) -> Vec<String> {
    if all_mirrors.is_empty() {
        return Vec::new();
    }

    let mut selected: Vec<String> = store
        .rank(all_mirrors)
        .into_iter()
        .take(EXPLOIT_COUNT)
        .collect();

    for _ in 0..EXPLORE_SAMPLES {
        if selected.len() >= MAX_PROBES {
            break;
        }
        let candidate = &all_mirrors[rng.gen_range(0..all_mirrors.len())];
        if !selected.contains(candidate) {
            selected.push(candidate.clone());
        }
    }

    selected.truncate(MAX_PROBES);
    selected
}
