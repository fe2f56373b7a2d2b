//! 帧与图库的匹配
//!
//! 先对每个查询描述符在倒排索引中做 kNN，得到 (查询特征点, 图库特征点) 的对应关系，
//! 再对每张候选图片用两点确定的相似变换做几何一致性检验，内点比例即为相似度

use std::collections::BTreeMap;
use std::ops::{Add, Mul, Sub};
use std::time::Instant;

use log::debug;
use rayon::prelude::*;

use crate::config::EngineConfig;
use crate::index::{IndexSnapshot, decode_label};
use crate::metrics;
use crate::types::{DescriptorSet, ImageId, Keypoint, MatchResult};

/// 参与假设生成的对应关系数量上限
const MAX_HYPOTHESIS_POINTS: usize = 24;
/// 两个点距离太近时求出的变换不稳定
const MIN_BASELINE: f32 = 5.0;
const MIN_SCALE: f32 = 0.25;
const MAX_SCALE: f32 = 4.0;

/// 一组对应关系：查询特征点序号、图库特征点序号、汉明距离
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Correspondence {
    query: usize,
    record: usize,
    distance: u32,
}

/// 用复数表示平面上的点，相似变换即 z' = a * z + b
#[derive(Debug, Clone, Copy, PartialEq)]
struct Point {
    re: f32,
    im: f32,
}

impl Point {
    fn of(kp: &Keypoint) -> Self {
        Self { re: kp.x, im: kp.y }
    }

    fn norm(self) -> f32 {
        self.re.hypot(self.im)
    }

    fn div(self, rhs: Self) -> Option<Self> {
        let d = rhs.re * rhs.re + rhs.im * rhs.im;
        (d > f32::EPSILON).then(|| Self {
            re: (self.re * rhs.re + self.im * rhs.im) / d,
            im: (self.im * rhs.re - self.re * rhs.im) / d,
        })
    }
}

impl Add for Point {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self { re: self.re + rhs.re, im: self.im + rhs.im }
    }
}

impl Sub for Point {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self { re: self.re - rhs.re, im: self.im - rhs.im }
    }
}

impl Mul for Point {
    type Output = Self;

    fn mul(self, rhs: Self) -> Self {
        Self { re: self.re * rhs.re - self.im * rhs.im, im: self.re * rhs.im + self.im * rhs.re }
    }
}

/// 在图库中寻找最佳匹配
///
/// 返回评分严格大于阈值的最高分图片，评分相同时取 ID 较小的
pub fn best_match(snapshot: &IndexSnapshot, query: &DescriptorSet, config: &EngineConfig) -> Option<MatchResult> {
    let start = Instant::now();
    let results = rank(snapshot, query, config);
    let size = (config.frame_size, config.frame_size);
    metrics::inc_match_duration(size, start.elapsed().as_secs_f32());

    let best = results.first().copied()?;
    metrics::inc_match_max_score(size, best.score);
    debug!("最佳匹配: {} 评分 {:.2}，阈值 {}", best.id, best.score, config.matching_threshold);
    (best.score > config.matching_threshold as f32).then_some(best)
}

/// 计算所有候选图片的评分，按评分降序、ID 升序排列，不包含评分为 0 的图片
pub fn rank(snapshot: &IndexSnapshot, query: &DescriptorSet, config: &EngineConfig) -> Vec<MatchResult> {
    if snapshot.is_empty() || query.is_empty() {
        return vec![];
    }

    let candidates = find_correspondences(snapshot, query, config);
    let tolerance = (config.frame_size as f32 * 0.02).max(3.0);

    let mut results = candidates
        .into_par_iter()
        .filter_map(|(id, corrs)| {
            let record = snapshot.get(id)?;
            let inliers = count_inliers(&query.keypoints, &record.descriptors.keypoints, &corrs, tolerance);
            let denom = query.len().min(record.descriptors.len());
            let score = (10.0 * inliers as f32 / denom as f32).min(10.0);
            (inliers > 0).then_some(MatchResult { id, score })
        })
        .collect::<Vec<_>>();

    results.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.id.cmp(&b.id)));
    results
}

/// 对每个查询描述符做 kNN，按图片分组并保证一一对应
fn find_correspondences(
    snapshot: &IndexSnapshot,
    query: &DescriptorSet,
    config: &EngineConfig,
) -> BTreeMap<ImageId, Vec<Correspondence>> {
    let hits = query
        .descriptors
        .par_iter()
        .enumerate()
        .flat_map_iter(|(qi, desc)| {
            snapshot.search(desc, config).into_iter().map(move |n| {
                let (id, record) = decode_label(n.label);
                (id, Correspondence { query: qi, record, distance: n.distance })
            })
        })
        .collect::<Vec<_>>();

    let mut grouped: BTreeMap<ImageId, Vec<Correspondence>> = BTreeMap::new();
    for (id, corr) in hits {
        grouped.entry(id).or_default().push(corr);
    }

    grouped
        .into_iter()
        .filter_map(|(id, corrs)| {
            let corrs = one_to_one(corrs);
            (corrs.len() >= 2).then_some((id, corrs))
        })
        .collect()
}

/// 贪心保留距离最小的对应关系，每个查询点和图库点最多出现一次
fn one_to_one(mut corrs: Vec<Correspondence>) -> Vec<Correspondence> {
    corrs.sort_unstable_by_key(|c| (c.distance, c.query, c.record));
    let mut used_query = std::collections::HashSet::new();
    let mut used_record = std::collections::HashSet::new();
    corrs.retain(|c| {
        if used_query.contains(&c.query) || used_record.contains(&c.record) {
            return false;
        }
        used_query.insert(c.query);
        used_record.insert(c.record);
        true
    });
    corrs
}

/// 遍历前若干个对应关系两两组成的相似变换，返回最多的内点数量
///
/// 对应关系已按距离升序排列，结果与线程调度无关
fn count_inliers(query: &[Keypoint], record: &[Keypoint], corrs: &[Correspondence], tolerance: f32) -> usize {
    let points = corrs
        .iter()
        .map(|c| (Point::of(&record[c.record]), Point::of(&query[c.query])))
        .collect::<Vec<_>>();
    let top = &points[..points.len().min(MAX_HYPOTHESIS_POINTS)];

    let mut best = 0;
    for (i, &(r1, q1)) in top.iter().enumerate() {
        for &(r2, q2) in &top[i + 1..] {
            let dr = r2 - r1;
            if dr.norm() < MIN_BASELINE {
                continue;
            }
            let Some(a) = (q2 - q1).div(dr) else { continue };
            let scale = a.norm();
            if !(MIN_SCALE..=MAX_SCALE).contains(&scale) {
                continue;
            }
            let b = q1 - a * r1;
            let inliers = points.iter().filter(|&&(r, q)| (a * r + b - q).norm() <= tolerance).count();
            if inliers > best {
                best = inliers;
                if best == points.len() {
                    return best;
                }
            }
        }
    }
    best
}
