use serde::{Deserialize, Serialize};

/// 图片在图库中的唯一 ID
pub type ImageId = u32;

/// 256 位二进制描述符
pub type Descriptor = [u8; 32];

/// 轴对齐矩形，单位为像素
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// 右边界和下边界都能用 u32 表示
    pub fn is_representable(&self) -> bool {
        self.x.checked_add(self.width).is_some() && self.y.checked_add(self.height).is_some()
    }

    /// 右边界，溢出时取 u32::MAX
    pub fn right(&self) -> u32 {
        self.x.saturating_add(self.width)
    }

    /// 下边界，溢出时取 u32::MAX
    pub fn bottom(&self) -> u32 {
        self.y.saturating_add(self.height)
    }

    /// 两个矩形是否有面积大于 0 的重叠部分
    pub fn intersects(&self, other: &Rect) -> bool {
        self.intersection(other).is_some()
    }

    pub fn intersection(&self, other: &Rect) -> Option<Rect> {
        let x = self.x.max(other.x);
        let y = self.y.max(other.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        (right > x && bottom > y).then(|| Rect::new(x, y, right - x, bottom - y))
    }

    /// 是否完全位于 width x height 的图像内
    pub fn fits_in(&self, width: u32, height: u32) -> bool {
        self.is_representable() && self.right() <= width && self.bottom() <= height
    }
}

/// 特征点，坐标为金字塔第 0 层（即缩放后帧）的坐标
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    /// 方向，弧度
    pub angle: f32,
    /// 所在金字塔层
    pub octave: u8,
    /// Harris 响应值，越大越稳定
    pub response: f32,
}

/// 一张图片或一帧的全部特征点和描述符，两者一一对应
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DescriptorSet {
    pub keypoints: Vec<Keypoint>,
    pub descriptors: Vec<Descriptor>,
}

impl DescriptorSet {
    pub fn new(keypoints: Vec<Keypoint>, descriptors: Vec<Descriptor>) -> Self {
        assert_eq!(keypoints.len(), descriptors.len(), "keypoints and descriptors length mismatch");
        Self { keypoints, descriptors }
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

/// 图库匹配结果
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub id: ImageId,
    /// 相似度评分，范围 0 ~ 10
    pub score: f32,
}
