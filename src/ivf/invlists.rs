use std::sync::Arc;

use crate::kmodes::imbalance_factor;

/// 单个倒排列表，标签与向量一一对应
#[derive(Debug, Clone, Default)]
pub struct InvertedList<const N: usize> {
    pub labels: Vec<u64>,
    pub codes: Vec<[u8; N]>,
}

/// 内存中的倒排列表
///
/// 每个列表单独用 Arc 包裹，克隆整个结构只复制指针，
/// 写入时通过 `Arc::make_mut` 只复制被修改的列表
#[derive(Debug, Clone)]
pub struct ArrayInvertedLists<const N: usize> {
    lists: Vec<Arc<InvertedList<N>>>,
}

impl<const N: usize> ArrayInvertedLists<N> {
    pub fn new(nlist: usize) -> Self {
        Self { lists: vec![Arc::new(InvertedList::default()); nlist] }
    }

    /// 返回倒排表的列表数量
    pub fn nlist(&self) -> usize {
        self.lists.len()
    }

    /// 返回指定倒排表的元素数量
    pub fn list_len(&self, list_no: usize) -> usize {
        self.lists[list_no].labels.len()
    }

    /// 返回所有列表的元素总数
    pub fn total_len(&self) -> usize {
        self.lists.iter().map(|list| list.labels.len()).sum()
    }

    /// 各列表长度的不平衡因子，1 表示完全均衡
    pub fn imbalance(&self) -> f32 {
        let hist = self.lists.iter().map(|list| list.labels.len()).collect::<Vec<_>>();
        imbalance_factor(&hist)
    }

    /// 返回指定倒排表中向量的标签列表和数据
    pub fn get_list(&self, list_no: usize) -> (&[u64], &[[u8; N]]) {
        let list = &self.lists[list_no];
        (&list.labels, &list.codes)
    }

    /// 往指定倒排表中添加元素，返回添加的元素数量
    pub fn add_entries(&mut self, list_no: usize, labels: &[u64], codes: &[[u8; N]]) -> usize {
        assert_eq!(labels.len(), codes.len(), "labels and codes length mismatch");
        let list = Arc::make_mut(&mut self.lists[list_no]);
        list.labels.extend_from_slice(labels);
        list.codes.extend_from_slice(codes);
        labels.len()
    }

    /// 删除所有满足条件的元素，返回删除的数量
    ///
    /// 没有元素被删除的列表不会被复制
    pub fn remove_if(&mut self, pred: impl Fn(u64) -> bool) -> usize {
        let mut removed = 0;
        for list in &mut self.lists {
            if !list.labels.iter().any(|&label| pred(label)) {
                continue;
            }
            let list = Arc::make_mut(list);
            let before = list.labels.len();
            let (labels, codes) = list
                .labels
                .iter()
                .zip(&list.codes)
                .filter(|(label, _)| !pred(**label))
                .map(|(label, code)| (*label, *code))
                .unzip();
            list.labels = labels;
            list.codes = codes;
            removed += before - list.labels.len();
        }
        removed
    }

    /// 取出所有元素，按列表顺序排列
    pub fn drain_all(&mut self) -> (Vec<u64>, Vec<[u8; N]>) {
        let mut labels = Vec::with_capacity(self.total_len());
        let mut codes = Vec::with_capacity(labels.capacity());
        for list in self.lists.drain(..) {
            let list = Arc::unwrap_or_clone(list);
            labels.extend(list.labels);
            codes.extend(list.codes);
        }
        (labels, codes)
    }

    /// 清空整个倒排表
    pub fn clear(&mut self) {
        for list in &mut self.lists {
            *list = Arc::default();
        }
    }
}
