//! 二进制向量的倒排索引
//!
//! 向量较少时只有一个倒排列表（暴力搜索），数量足够多时用 k-modes 训练量化器，
//! 并在向量数量翻倍后重新训练

pub mod invlists;
pub mod quantizer;

use std::sync::Arc;

pub use invlists::*;
use log::debug;
pub use quantizer::*;
use smallvec::SmallVec;

use crate::hamming::knn_hamming;

/// 每个聚类中心至少需要的训练向量数量
const MIN_POINTS_PER_CENTROID: usize = 30;
/// k-modes 最大迭代次数
const TRAIN_ITERATIONS: usize = 10;
/// 训练使用的随机种子
const TRAIN_SEED: u64 = 0x5eed;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Neighbor {
    pub label: u64,
    pub distance: u32,
}

/// 倒排索引，克隆的开销与倒排列表数量成正比，与向量数量无关
#[derive(Clone)]
pub struct IvfIndex<const N: usize> {
    quantizer: Arc<dyn Quantizer<N>>,
    invlists: ArrayInvertedLists<N>,
    /// 上次训练时的向量数量，0 表示尚未训练
    trained_on: usize,
}

impl<const N: usize> Default for IvfIndex<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> IvfIndex<N> {
    pub fn new() -> Self {
        Self { quantizer: Arc::new(FlatQuantizer), invlists: ArrayInvertedLists::new(1), trained_on: 0 }
    }

    /// 索引中的向量总数
    pub fn ntotal(&self) -> usize {
        self.invlists.total_len()
    }

    pub fn nlist(&self) -> usize {
        self.quantizer.nlist()
    }

    pub fn is_trained(&self) -> bool {
        self.trained_on > 0
    }

    pub fn invlists(&self) -> &ArrayInvertedLists<N> {
        &self.invlists
    }

    /// 添加向量，必要时重新训练量化器
    pub fn add(&mut self, codes: &[[u8; N]], labels: &[u64]) {
        assert_eq!(codes.len(), labels.len(), "codes and labels length mismatch");
        for (code, label) in codes.iter().zip(labels) {
            let list_no = self.quantizer.assign(code);
            self.invlists.add_entries(list_no, std::slice::from_ref(label), std::slice::from_ref(code));
        }
        if self.should_retrain() {
            self.retrain();
        }
    }

    /// 删除满足条件的向量，返回删除的数量
    pub fn remove_if(&mut self, pred: impl Fn(u64) -> bool) -> usize {
        self.invlists.remove_if(pred)
    }

    /// 清空索引并回到未训练状态
    pub fn clear(&mut self) {
        *self = Self::new();
    }

    /// 搜索与 query 最接近的 k 个向量，按 (距离, 标签) 升序排列
    pub fn search(&self, query: &[u8; N], k: usize, nprobe: usize, max_distance: u32) -> SmallVec<[Neighbor; 8]> {
        let mut neighbors: SmallVec<[Neighbor; 8]> = SmallVec::new();
        for list_no in self.quantizer.search(query, nprobe) {
            let (labels, codes) = self.invlists.get_list(list_no);
            neighbors.extend(
                knn_hamming(query, codes, k, max_distance)
                    .into_iter()
                    .map(|(i, distance)| Neighbor { label: labels[i], distance }),
            );
        }
        neighbors.sort_unstable_by_key(|n| (n.distance, n.label));
        neighbors.truncate(k);
        neighbors
    }

    /// 根据向量数量计算目标聚类数量
    fn target_nlist(ntotal: usize) -> usize {
        ((ntotal as f64).sqrt() * 4.0) as usize
    }

    fn should_retrain(&self) -> bool {
        let ntotal = self.ntotal();
        let nlist = Self::target_nlist(ntotal);
        if nlist < 2 || ntotal < nlist * MIN_POINTS_PER_CENTROID {
            return false;
        }
        !self.is_trained() || ntotal >= self.trained_on * 2
    }

    fn retrain(&mut self) {
        let (labels, codes) = self.invlists.drain_all();
        let nlist = Self::target_nlist(codes.len());
        debug!("重新训练倒排索引: {} 个向量, {} -> {} 个列表", codes.len(), self.nlist(), nlist);

        let quantizer = CentroidQuantizer::train(&codes, nlist, TRAIN_ITERATIONS, TRAIN_SEED);
        let mut invlists = ArrayInvertedLists::new(Quantizer::<N>::nlist(&quantizer));
        for (code, label) in codes.iter().zip(&labels) {
            let list_no = quantizer.assign(code);
            invlists.add_entries(list_no, std::slice::from_ref(label), std::slice::from_ref(code));
        }

        debug!("倒排列表不平衡因子: {:.3}", invlists.imbalance());
        self.quantizer = Arc::new(quantizer);
        self.invlists = invlists;
        self.trained_on = codes.len();
    }
}
