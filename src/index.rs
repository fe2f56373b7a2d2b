//! 图库：图片 ID 到特征描述符的映射，以及所有描述符的倒排索引
//!
//! 写操作由一个互斥锁串行化，每次写入生成一份新的快照并原子替换；
//! 匹配线程只持有某一份快照，不会看到写了一半的状态

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use log::{debug, info};
use smallvec::SmallVec;

use crate::config::EngineConfig;
use crate::error::{Result, VsError};
use crate::ivf::{IvfIndex, Neighbor};
use crate::orb::Extraction;
use crate::types::{Descriptor, DescriptorSet, ImageId};

/// 图库中的一张图片
#[derive(Debug, Clone)]
pub struct ImageRecord {
    pub id: ImageId,
    pub descriptors: DescriptorSet,
    /// 入库时的质量评分
    pub score: u8,
}

/// 倒排索引中的标签：高 32 位为图片 ID，低 32 位为特征点序号
pub fn encode_label(id: ImageId, kp_idx: usize) -> u64 {
    ((id as u64) << 32) | kp_idx as u64
}

pub fn decode_label(label: u64) -> (ImageId, usize) {
    ((label >> 32) as ImageId, (label & 0xffff_ffff) as usize)
}

/// 图库在某一时刻的不可变快照
#[derive(Clone, Default)]
pub struct IndexSnapshot {
    ivf: IvfIndex<32>,
    images: BTreeMap<ImageId, Arc<ImageRecord>>,
    /// 大于所有已分配过的 ID，超出 ImageId 范围时表示 ID 已用尽
    next_auto: u64,
}

impl IndexSnapshot {
    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn contains(&self, id: ImageId) -> bool {
        self.images.contains_key(&id)
    }

    pub fn get(&self, id: ImageId) -> Option<&ImageRecord> {
        self.images.get(&id).map(Arc::as_ref)
    }

    /// 按升序返回所有图片 ID
    pub fn ids(&self) -> Vec<ImageId> {
        self.images.keys().copied().collect()
    }

    /// 倒排索引中的描述符总数
    pub fn num_descriptors(&self) -> usize {
        self.ivf.ntotal()
    }

    /// 搜索与 query 最接近的描述符
    pub fn search(&self, query: &Descriptor, config: &EngineConfig) -> SmallVec<[Neighbor; 8]> {
        self.ivf.search(query, config.knn, config.nprobe, config.max_distance)
    }
}

/// 线程安全的图库
#[derive(Default)]
pub struct ImageIndex {
    current: RwLock<Arc<IndexSnapshot>>,
    writer: Mutex<()>,
}

impl ImageIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// 返回当前快照，读锁只在克隆 Arc 时持有
    pub fn snapshot(&self) -> Arc<IndexSnapshot> {
        self.current.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    pub fn contains(&self, id: ImageId) -> bool {
        self.snapshot().contains(id)
    }

    pub fn ids(&self) -> Vec<ImageId> {
        self.snapshot().ids()
    }

    /// 将提取结果加入图库，id 为 None 时自动分配
    ///
    /// 失败时图库保持不变，也不会消耗自动分配的 ID
    pub fn insert(&self, extraction: Extraction, id: Option<ImageId>, config: &EngineConfig) -> Result<ImageId> {
        let Extraction { descriptors, score } = extraction;
        if descriptors.len() < config.min_features || score < config.matching_threshold {
            return Err(VsError::InsufficientFeatures { count: descriptors.len(), score });
        }

        let _guard = self.lock_writer();
        let mut state = IndexSnapshot::clone(&self.snapshot());

        let id = match id {
            Some(id) if state.images.contains_key(&id) => return Err(VsError::DuplicateId(id)),
            Some(id) => id,
            None => ImageId::try_from(state.next_auto).map_err(|_| VsError::IdExhausted)?,
        };
        state.next_auto = state.next_auto.max(id as u64 + 1);

        let labels = (0..descriptors.len()).map(|i| encode_label(id, i)).collect::<Vec<_>>();
        state.ivf.add(&descriptors.descriptors, &labels);
        state.images.insert(id, Arc::new(ImageRecord { id, descriptors, score }));

        debug!("插入图片 {id}，描述符总数 {}", state.ivf.ntotal());
        self.publish(state);
        Ok(id)
    }

    /// 删除图片及其所有描述符
    pub fn delete(&self, id: ImageId) -> Result<()> {
        let _guard = self.lock_writer();
        let mut state = IndexSnapshot::clone(&self.snapshot());
        if state.images.remove(&id).is_none() {
            return Err(VsError::NotFound(id));
        }
        let removed = state.ivf.remove_if(|label| decode_label(label).0 == id);
        debug!("删除图片 {id}，移除描述符 {removed} 个");
        self.publish(state);
        Ok(())
    }

    /// 清空图库，已分配的自动 ID 不会被重复使用
    pub fn clear(&self) {
        let _guard = self.lock_writer();
        let next_auto = self.snapshot().next_auto;
        info!("清空图库");
        self.publish(IndexSnapshot { next_auto, ..Default::default() });
    }

    fn lock_writer(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: IndexSnapshot) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(state);
    }
}
