use thiserror::Error;

use crate::types::ImageId;

/// 引擎错误类型
#[derive(Error, Debug)]
pub enum VsError {
    /// 图片的特征点数量或质量评分不足，无法入库或匹配
    #[error("特征点不足: 数量 {count}, 评分 {score}")]
    InsufficientFeatures { count: usize, score: u8 },

    #[error("图片 ID 已存在: {0}")]
    DuplicateId(ImageId),

    #[error("图片 ID 不存在: {0}")]
    NotFound(ImageId),

    /// 自动分配的 ID 已经到达上限，已分配过的 ID 不会被重复使用
    #[error("图片 ID 已用尽")]
    IdExhausted,

    /// ROI 越界或与已有 ROI 重叠
    #[error("无效的 ROI: {0}")]
    InvalidRegion(String),

    #[error("引擎尚未初始化")]
    NotInitialized,

    #[error("授权校验失败")]
    LicenseRejected,

    #[error("无效的配置: {0}")]
    InvalidConfig(String),

    /// 帧数据格式错误，例如缓冲区长度与宽高不符
    #[error("无效的帧: {0}")]
    InvalidFrame(String),

    #[error("图片解码失败: {0}")]
    Image(#[from] image::ImageError),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("下载图片失败: {0}")]
    Fetch(anyhow::Error),
}

pub type Result<T> = std::result::Result<T, VsError>;
