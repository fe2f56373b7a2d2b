use log::debug;
use rand::prelude::*;
use rand::rngs::StdRng;
use rayon::prelude::*;

use crate::hamming::hamming;

#[derive(Debug, Clone, Default)]
pub struct KModeState<const N: usize> {
    /// 聚类中心到所有向量的总距离
    pub distsum: u64,
    /// 聚类中心
    pub centroids: Vec<[u8; N]>,
    /// 每个聚类中心包含的向量数量
    pub centroid_frequency: Vec<usize>,
}

/// K-modes 聚类算法，用于二进制向量
///
/// 使用固定种子初始化聚类中心，相同输入总是得到相同的结果
pub fn kmodes_binary<const N: usize>(
    data: &[[u8; N]],
    k: usize,
    max_iter: usize,
    seed: u64,
) -> KModeState<N> {
    if data.is_empty() || k == 0 {
        return KModeState::default();
    }
    let k = k.min(data.len());

    let mut rng = StdRng::seed_from_u64(seed);
    let mut centroids: Vec<[u8; N]> = data.choose_multiple(&mut rng, k).cloned().collect();

    let mut distance = u64::MAX;
    let mut centroid_frequency = vec![0; k];

    for iter in 0..max_iter {
        let (assignments, new_distance) = update_assignments(data, &centroids);

        // 如果距离没有变小，则算法收敛
        if new_distance >= distance {
            debug!("k-modes 在第 {iter} 轮收敛，总距离 {distance}");
            break;
        }
        distance = new_distance;

        let (new_centroids, new_frequency): (Vec<[u8; N]>, Vec<usize>) = (0..k)
            .into_par_iter()
            .map(|cluster_id| update_centroid(data, &assignments, cluster_id, &centroids[cluster_id]))
            .unzip();
        centroids = new_centroids;
        centroid_frequency = new_frequency;
    }

    KModeState { distsum: distance, centroids, centroid_frequency }
}

/// 将每个点分配给最近的聚类中心，并返回聚类中心的序号和总距离
pub fn update_assignments<const N: usize>(data: &[[u8; N]], centroids: &[[u8; N]]) -> (Vec<usize>, u64) {
    let (assignments, distances): (Vec<_>, Vec<_>) =
        data.par_iter().map(|point| nearest_centroid(point, centroids)).unzip();
    let distance = distances.iter().map(|&d| d as u64).sum();
    (assignments, distance)
}

/// 返回最近的聚类中心序号和距离，距离相同时取序号较小的
pub fn nearest_centroid<const N: usize>(point: &[u8; N], centroids: &[[u8; N]]) -> (usize, u32) {
    let mut best = (0, u32::MAX);
    for (j, centroid) in centroids.iter().enumerate() {
        let d = hamming::<N>(point, centroid);
        if d < best.1 {
            best = (j, d);
        }
    }
    best
}

/// 更新聚类中心：计算分配给该聚类的所有点每个 bit 的众数
///
/// 空聚类保留原来的中心
fn update_centroid<const N: usize>(
    data: &[[u8; N]],
    assignments: &[usize],
    cluster_id: usize,
    previous: &[u8; N],
) -> ([u8; N], usize) {
    let mut bit_counts = vec![[0u32; 8]; N];
    let mut count = 0u32;
    for (point, _) in data.iter().zip(assignments).filter(|(_, a)| **a == cluster_id) {
        count += 1;
        for (byte_pos, byte) in point.iter().enumerate() {
            for bit_pos in 0..8 {
                bit_counts[byte_pos][bit_pos] += ((byte >> bit_pos) & 1) as u32;
            }
        }
    }

    if count == 0 {
        return (*previous, 0);
    }

    let half = count / 2;
    let mut centroid = [0u8; N];
    for (byte_pos, counts) in bit_counts.iter().enumerate() {
        for (bit_pos, &c) in counts.iter().enumerate() {
            if c > half {
                centroid[byte_pos] |= 1 << bit_pos;
            }
        }
    }
    (centroid, count as usize)
}

/// 计算不平衡因子，1 表示完全均衡
pub fn imbalance_factor(hist: &[usize]) -> f32 {
    let (mut tot, mut uf) = (0.0, 0.0);
    for h in hist {
        let h = *h as f32;
        tot += h;
        uf += h.powf(2.0);
    }
    if tot == 0.0 {
        return 0.0;
    }
    uf * hist.len() as f32 / tot.powf(2.0)
}
