use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;

use clap::{Parser, Subcommand, ValueEnum};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::cli::*;
use crate::error::{Result, VsError};
use crate::types::Rect;

static CONF_DIR: LazyLock<ConfDir> = LazyLock::new(|| {
    let proj_dirs = ProjectDirs::from("", "vsearch", "vsearch").expect("failed to get project dir");
    ConfDir { path: proj_dirs.config_dir().to_path_buf() }
});

fn default_config_dir() -> &'static str {
    CONF_DIR.path().to_str().unwrap_or(".")
}

/// 阈值取值范围
pub const THRESHOLD_RANGE: std::ops::RangeInclusive<u8> = 0..=10;
/// 特征点数量取值范围
pub const FEATURES_RANGE: std::ops::RangeInclusive<usize> = 1..=5000;
/// 帧尺寸取值范围
pub const FRAME_SIZE_RANGE: std::ops::RangeInclusive<u32> = 64..=4096;

/// 搜索模式
#[derive(ValueEnum, Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    /// 只在图库中搜索图片
    Image,
    /// 只识别二维码和条形码
    Codes,
    /// 同时搜索图片和条码
    #[default]
    All,
}

impl SearchMode {
    pub fn images(self) -> bool {
        matches!(self, Self::Image | Self::All)
    }

    pub fn codes(self) -> bool {
        matches!(self, Self::Codes | Self::All)
    }
}

/// 引擎配置，每一帧提交时会保存一份快照，修改只对之后提交的帧生效
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub search_mode: SearchMode,
    /// 裁剪区域，全 0 表示不裁剪
    pub crop_rect: Rect,
    /// 帧和入库图片的最大边会被缩放到这个尺寸
    pub frame_size: u32,
    /// 匹配阈值，同时也是入库图片的最低质量评分
    pub matching_threshold: u8,
    /// 入库所需的最少特征点数量
    pub min_features: usize,
    /// 单张图片保留的最大特征点数量
    pub max_features: usize,
    /// 相机输出尺寸，ROI 必须位于其中
    pub capture_size: (u32, u32),
    /// 每个查询描述符找到的最佳匹配数量
    pub knn: usize,
    /// 搜索的倒排列表数量
    pub nprobe: usize,
    /// 两个相似描述符允许的最大汉明距离
    pub max_distance: u32,
    /// 是否启用运动检测过滤
    pub motion_filter: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            search_mode: SearchMode::All,
            crop_rect: Rect::default(),
            frame_size: 250,
            matching_threshold: 5,
            min_features: 50,
            max_features: 50,
            capture_size: (640, 480),
            knn: 4,
            nprobe: 3,
            max_distance: 64,
            motion_filter: false,
        }
    }
}

impl EngineConfig {
    /// 检查所有参数是否在允许的范围内
    pub fn validate(&self) -> Result<()> {
        if !THRESHOLD_RANGE.contains(&self.matching_threshold) {
            return Err(invalid(format!("匹配阈值必须在 0 ~ 10 之间: {}", self.matching_threshold)));
        }
        if !FEATURES_RANGE.contains(&self.min_features) {
            return Err(invalid(format!("无效的最少特征点数量: {}", self.min_features)));
        }
        if !FEATURES_RANGE.contains(&self.max_features) {
            return Err(invalid(format!("无效的最大特征点数量: {}", self.max_features)));
        }
        if self.min_features > self.max_features {
            return Err(invalid(format!(
                "最少特征点数量 {} 大于最大特征点数量 {}",
                self.min_features, self.max_features
            )));
        }
        if !FRAME_SIZE_RANGE.contains(&self.frame_size) {
            return Err(invalid(format!("帧尺寸必须在 64 ~ 4096 之间: {}", self.frame_size)));
        }
        if !(1..=8).contains(&self.knn) {
            return Err(invalid(format!("knn 必须在 1 ~ 8 之间: {}", self.knn)));
        }
        if self.nprobe == 0 {
            return Err(invalid("nprobe 不能为 0".to_string()));
        }
        if self.max_distance > 256 {
            return Err(invalid(format!("最大距离不能超过 256: {}", self.max_distance)));
        }
        if !self.crop_rect.is_representable() {
            return Err(invalid(format!("裁剪区域坐标溢出: {:?}", self.crop_rect)));
        }
        if self.capture_size.0 == 0 || self.capture_size.1 == 0 {
            return Err(invalid("相机输出尺寸不能为 0".to_string()));
        }
        Ok(())
    }

    /// 裁剪区域是否生效
    pub fn crops(&self) -> bool {
        !self.crop_rect.is_empty()
    }

    /// 从 JSON 文件加载配置
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let data = std::fs::read(path)?;
        let config: Self = serde_json::from_slice(&data)?;
        config.validate()?;
        Ok(config)
    }
}

fn invalid(msg: String) -> VsError {
    VsError::InvalidConfig(msg)
}

/// 命令行中的引擎参数，未指定的参数使用配置文件或默认值
#[derive(Parser, Debug, Clone, Default)]
pub struct EngineOptions {
    /// 搜索模式
    #[arg(long, value_enum)]
    pub mode: Option<SearchMode>,
    /// 裁剪区域
    #[arg(long, value_name = "X,Y,W,H", value_parser = parse_rect)]
    pub crop: Option<Rect>,
    /// 图片最大边缩放到的尺寸
    #[arg(short = 'S', long, value_name = "SIZE")]
    pub frame_size: Option<u32>,
    /// 匹配阈值，范围 0 ~ 10
    #[arg(short = 't', long, value_name = "SCORE", value_parser = clap::value_parser!(u8).range(0..=10))]
    pub threshold: Option<u8>,
    /// 入库所需的最少特征点数量
    #[arg(long, value_name = "N")]
    pub min_features: Option<usize>,
    /// 保留的最大特征点数量
    #[arg(short = 'n', long, value_name = "N")]
    pub max_features: Option<usize>,
    /// 搜索的倒排列表数量
    #[arg(long, value_name = "N")]
    pub nprobe: Option<usize>,
    /// 两个相似向量的允许的最大距离，范围从 0 到 256
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u32).range(0..=256))]
    pub distance: Option<u32>,
}

impl EngineOptions {
    /// 用命令行参数覆盖配置
    pub fn apply(&self, mut config: EngineConfig) -> Result<EngineConfig> {
        if let Some(mode) = self.mode {
            config.search_mode = mode;
        }
        if let Some(crop) = self.crop {
            config.crop_rect = crop;
        }
        if let Some(size) = self.frame_size {
            config.frame_size = size;
        }
        if let Some(threshold) = self.threshold {
            config.matching_threshold = threshold;
        }
        if let Some(n) = self.min_features {
            config.min_features = n;
        }
        if let Some(n) = self.max_features {
            config.max_features = n;
        }
        if let Some(n) = self.nprobe {
            config.nprobe = n;
        }
        if let Some(d) = self.distance {
            config.max_distance = d;
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "vsearch", version)]
pub struct Opts {
    #[command(subcommand)]
    pub subcmd: SubCommand,
    /// vsearch 配置文件目录
    #[arg(short, long, default_value = default_config_dir())]
    pub conf_dir: ConfDir,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SubCommand {
    /// 计算图片的质量评分
    Score(ScoreCommand),
    /// 将目录中的图片加入图库，然后搜索图片
    Search(SearchCommand),
    /// 识别图片中的二维码和条形码
    Scan(ScanCommand),
}

#[derive(Debug, Clone)]
pub struct ConfDir {
    path: PathBuf,
}

impl ConfDir {
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// 返回引擎配置文件的路径
    pub fn engine_config(&self) -> PathBuf {
        self.path.join("engine.json")
    }

    /// 返回调试帧的保存目录
    pub fn frames(&self) -> PathBuf {
        self.path.join("frames")
    }

    /// 读取配置文件，不存在时使用默认配置
    pub fn load_engine_config(&self) -> anyhow::Result<EngineConfig> {
        let path = self.engine_config();
        if path.exists() {
            log::debug!("读取配置文件: {}", path.display());
            EngineConfig::load(path)
        } else {
            Ok(EngineConfig::default())
        }
    }
}

impl FromStr for ConfDir {
    type Err = Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self { path: PathBuf::from(s) })
    }
}

/// 解析 `X,Y,W,H` 格式的矩形
pub fn parse_rect(s: &str) -> anyhow::Result<Rect> {
    let parts = s.split(',').map(|p| p.trim().parse::<u32>()).collect::<std::result::Result<Vec<_>, _>>()?;
    match parts[..] {
        [x, y, width, height] => Ok(Rect::new(x, y, width, height)),
        _ => Err(anyhow::anyhow!("无效的矩形: {}", s)),
    }
}
