use log::info;

use crate::hamming::hamming;
use crate::kmodes::{imbalance_factor, kmodes_binary, nearest_centroid};

/// 适用于 N 字节二进制向量的粗量化器
pub trait Quantizer<const N: usize>: Send + Sync {
    /// 倒排列表数量
    fn nlist(&self) -> usize;

    /// 返回向量所属的倒排列表
    fn assign(&self, x: &[u8; N]) -> usize;

    /// 返回与向量最接近的 nprobe 个倒排列表，按距离升序排列
    fn search(&self, x: &[u8; N], nprobe: usize) -> Vec<usize>;
}

/// 只有一个倒排列表的量化器，相当于暴力搜索
#[derive(Debug, Clone, Copy, Default)]
pub struct FlatQuantizer;

impl<const N: usize> Quantizer<N> for FlatQuantizer {
    fn nlist(&self) -> usize {
        1
    }

    fn assign(&self, _x: &[u8; N]) -> usize {
        0
    }

    fn search(&self, _x: &[u8; N], _nprobe: usize) -> Vec<usize> {
        vec![0]
    }
}

/// 以 k-modes 聚类中心作为倒排列表的量化器
#[derive(Debug, Clone)]
pub struct CentroidQuantizer<const N: usize> {
    centroids: Vec<[u8; N]>,
}

impl<const N: usize> CentroidQuantizer<N> {
    /// 在给定数据上训练 nlist 个聚类中心
    pub fn train(data: &[[u8; N]], nlist: usize, max_iter: usize, seed: u64) -> Self {
        let state = kmodes_binary(data, nlist, max_iter, seed);
        info!(
            "训练量化器: {} 个向量, {} 个聚类, 不平衡因子 {:.3}",
            data.len(),
            state.centroids.len(),
            imbalance_factor(&state.centroid_frequency)
        );
        Self { centroids: state.centroids }
    }

    pub fn centroids(&self) -> &[[u8; N]] {
        &self.centroids
    }
}

impl<const N: usize> Quantizer<N> for CentroidQuantizer<N> {
    fn nlist(&self) -> usize {
        self.centroids.len()
    }

    fn assign(&self, x: &[u8; N]) -> usize {
        nearest_centroid(x, &self.centroids).0
    }

    fn search(&self, x: &[u8; N], nprobe: usize) -> Vec<usize> {
        let mut dis = self
            .centroids
            .iter()
            .enumerate()
            .map(|(i, c)| (hamming::<N>(x, c), i))
            .collect::<Vec<_>>();
        let nprobe = nprobe.min(dis.len());
        if nprobe == 0 {
            return vec![];
        }
        dis.select_nth_unstable(nprobe - 1);
        dis.truncate(nprobe);
        dis.sort_unstable();
        dis.into_iter().map(|(_, i)| i).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_centroid_search_order() {
        let q = CentroidQuantizer::<1> { centroids: vec![[0b1111], [0b0000], [0b0001], [0b0011]] };
        assert_eq!(q.search(&[0], 3), vec![1, 2, 3]);
        assert_eq!(q.search(&[0], 10).len(), 4);
        assert_eq!(q.assign(&[0b0111]), 0);
    }

    #[test]
    fn test_flat_quantizer() {
        let q = FlatQuantizer;
        assert_eq!(Quantizer::<4>::nlist(&q), 1);
        assert_eq!(Quantizer::<4>::search(&q, &[1, 2, 3, 4], 5), vec![0]);
    }
}
