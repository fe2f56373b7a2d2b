//! ORB 特征提取：FAST-9 角点 + Harris 排序 + 灰度质心方向 + 旋转 BRIEF 描述符

use std::sync::LazyLock;

use image::GrayImage;
use image::imageops::{self, FilterType};
use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::config::EngineConfig;
use crate::hamming::bit_balance;
use crate::types::{Descriptor, DescriptorSet, Keypoint};

/// 特征点到图像边缘的最小距离，需要容纳方向计算和 BRIEF 采样
const EDGE: u32 = 16;
/// 灰度质心的计算半径
const PATCH_RADIUS: i32 = 15;
/// BRIEF 采样点所在圆的半径
const PATTERN_RADIUS: i32 = 12;
const HARRIS_K: f32 = 0.04;
const HARRIS_BLOCK: i32 = 7;
/// 计算覆盖率的网格大小
const COVERAGE_GRID: u32 = 4;

/// FAST 检测使用的 Bresenham 圆，半径为 3
const CIRCLE: [(i32, i32); 16] = [
    (0, -3),
    (1, -3),
    (2, -2),
    (3, -1),
    (3, 0),
    (3, 1),
    (2, 2),
    (1, 3),
    (0, 3),
    (-1, 3),
    (-2, 2),
    (-3, 1),
    (-3, 0),
    (-3, -1),
    (-2, -2),
    (-1, -3),
];

/// BRIEF 的 256 组采样点对，使用固定种子生成，保证每次运行结果一致
static PATTERN: LazyLock<Vec<[(i32, i32); 2]>> = LazyLock::new(|| {
    let mut rng = StdRng::seed_from_u64(0x0b5e_55ed);
    let mut sample = move || loop {
        let x = rng.random_range(-PATTERN_RADIUS..=PATTERN_RADIUS);
        let y = rng.random_range(-PATTERN_RADIUS..=PATTERN_RADIUS);
        if x * x + y * y <= PATTERN_RADIUS * PATTERN_RADIUS {
            return (x, y);
        }
    };
    let mut pattern = Vec::with_capacity(256);
    while pattern.len() < 256 {
        let (p, q) = (sample(), sample());
        if p != q {
            pattern.push([p, q]);
        }
    }
    pattern
});

/// 灰度质心每行的半宽
static UMAX: LazyLock<Vec<i32>> = LazyLock::new(|| {
    (0..=PATCH_RADIUS)
        .map(|v| (((PATCH_RADIUS * PATCH_RADIUS - v * v) as f32).sqrt()).floor() as i32)
        .collect()
});

#[derive(Debug, Clone)]
pub struct OrbOptions {
    /// 特征金字塔层数
    pub nlevels: usize,
    /// 特征金字塔缩放因子
    pub scale_factor: f32,
    /// FAST 角点检测器初始阈值
    pub ini_th_fast: u8,
    /// FAST 角点检测器最小阈值，初始阈值检测到的角点不足时使用
    pub min_th_fast: u8,
}

impl Default for OrbOptions {
    fn default() -> Self {
        Self { nlevels: 4, scale_factor: 1.2, ini_th_fast: 20, min_th_fast: 7 }
    }
}

/// 特征提取结果
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub descriptors: DescriptorSet,
    /// 图片质量评分，0 ~ 10
    pub score: u8,
}

#[derive(Debug, Clone, Default)]
pub struct ORBDetector {
    opts: OrbOptions,
}

impl ORBDetector {
    pub fn create(opts: OrbOptions) -> Self {
        assert!(opts.nlevels > 0, "nlevels must be positive");
        assert!(opts.scale_factor > 1.0, "scale_factor must be greater than 1");
        Self { opts }
    }

    /// 按配置提取特征点并计算质量评分
    ///
    /// 图片需要已经完成裁剪和缩放。特征点少于 min_features 时返回空集合和 0 分
    pub fn extract(&self, image: &GrayImage, config: &EngineConfig) -> Extraction {
        let descriptors = self.detect_and_compute(image, config.max_features);
        if descriptors.len() < config.min_features {
            debug!("特征点数量 {} 少于 {}", descriptors.len(), config.min_features);
            return Extraction::default();
        }
        let score = quality_score(&descriptors, image.dimensions(), config.max_features);
        debug!(
            "提取特征点 {} 个，评分 {}，bit 均值 {:.3}",
            descriptors.len(),
            score,
            bit_balance(&descriptors.descriptors)
        );
        Extraction { descriptors, score }
    }

    /// 检测特征点并计算描述符，最多保留响应值最大的 nfeatures 个
    pub fn detect_and_compute(&self, image: &GrayImage, nfeatures: usize) -> DescriptorSet {
        let (w, h) = image.dimensions();
        if w <= 2 * EDGE || h <= 2 * EDGE || nfeatures == 0 {
            return DescriptorSet::default();
        }

        let budgets = self.level_budgets(nfeatures);
        let levels = (0..self.opts.nlevels)
            .into_par_iter()
            .filter_map(|level| {
                let scale = self.opts.scale_factor.powi(level as i32);
                let lw = (w as f32 / scale).round() as u32;
                let lh = (h as f32 / scale).round() as u32;
                if lw <= 2 * EDGE + 8 || lh <= 2 * EDGE + 8 {
                    return None;
                }
                let img = if level == 0 {
                    image.clone()
                } else {
                    imageops::resize(image, lw, lh, FilterType::Triangle)
                };
                let candidates = self.detect_level(&img, level as u8, budgets[level] * 2);
                Some((img, scale, candidates))
            })
            .collect::<Vec<_>>();

        // 所有层的候选点按响应值统一排序，只保留最强的 nfeatures 个
        let mut all = levels
            .iter()
            .enumerate()
            .flat_map(|(i, (_, _, candidates))| candidates.iter().map(move |c| (i, *c)))
            .collect::<Vec<_>>();
        all.sort_by(|(_, a), (_, b)| {
            b.response
                .total_cmp(&a.response)
                .then(a.octave.cmp(&b.octave))
                .then(a.y.cmp(&b.y))
                .then(a.x.cmp(&b.x))
        });
        all.truncate(nfeatures);

        let blurred = levels.par_iter().map(|(img, _, _)| imageops::blur(img, 2.0)).collect::<Vec<_>>();

        let (keypoints, descriptors) = all
            .par_iter()
            .map(|&(i, c)| {
                let (img, scale, _) = &levels[i];
                let angle = ic_angle(img, c.x as i32, c.y as i32);
                let descriptor = compute_brief(&blurred[i], c.x as i32, c.y as i32, angle);
                let kp = Keypoint {
                    x: c.x as f32 * scale,
                    y: c.y as f32 * scale,
                    angle,
                    octave: c.octave,
                    response: c.response,
                };
                (kp, descriptor)
            })
            .unzip();
        DescriptorSet::new(keypoints, descriptors)
    }

    /// 按等比数列把特征点数量分配到每一层
    fn level_budgets(&self, nfeatures: usize) -> Vec<usize> {
        let n = self.opts.nlevels;
        let factor = 1.0 / self.opts.scale_factor;
        let mut desired = nfeatures as f32 * (1.0 - factor) / (1.0 - factor.powi(n as i32));
        let mut budgets = Vec::with_capacity(n);
        let mut sum = 0;
        for _ in 0..n - 1 {
            let b = desired.round() as usize;
            budgets.push(b.max(1));
            sum += b;
            desired *= factor;
        }
        budgets.push(nfeatures.saturating_sub(sum).max(1));
        budgets
    }

    /// 在单层图像上检测角点，返回 Harris 响应最大的 keep 个
    fn detect_level(&self, img: &GrayImage, octave: u8, keep: usize) -> Vec<Corner> {
        let mut corners = detect_fast(img, self.opts.ini_th_fast, octave);
        if corners.len() < keep && self.opts.min_th_fast < self.opts.ini_th_fast {
            corners = detect_fast(img, self.opts.min_th_fast, octave);
        }
        corners.sort_by(|a, b| b.response.total_cmp(&a.response).then(a.y.cmp(&b.y)).then(a.x.cmp(&b.x)));
        corners.truncate(keep);
        corners
    }
}

#[derive(Debug, Clone, Copy)]
struct Corner {
    x: u32,
    y: u32,
    octave: u8,
    response: f32,
}

/// FAST-9 检测 + 3x3 非极大值抑制，响应值使用 Harris 角点响应
fn detect_fast(img: &GrayImage, threshold: u8, octave: u8) -> Vec<Corner> {
    let (w, h) = img.dimensions();
    let mut response = vec![0f32; (w * h) as usize];
    for y in EDGE..h - EDGE {
        for x in EDGE..w - EDGE {
            if is_fast_corner(img, x, y, threshold) {
                let r = harris_response(img, x as i32, y as i32);
                if r > 0.0 {
                    response[(y * w + x) as usize] = r;
                }
            }
        }
    }

    let mut corners = vec![];
    for y in EDGE..h - EDGE {
        for x in EDGE..w - EDGE {
            let r = response[(y * w + x) as usize];
            if r <= 0.0 {
                continue;
            }
            let mut is_max = true;
            'nms: for dy in -1i32..=1 {
                for dx in -1i32..=1 {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    let n = response[((y as i32 + dy) as u32 * w + (x as i32 + dx) as u32) as usize];
                    // 响应值相同时保留扫描顺序靠前的点
                    let before = dy < 0 || (dy == 0 && dx < 0);
                    if n > r || (n == r && before) {
                        is_max = false;
                        break 'nms;
                    }
                }
            }
            if is_max {
                corners.push(Corner { x, y, octave, response: r });
            }
        }
    }
    corners
}

#[inline]
fn pixel(img: &GrayImage, x: i32, y: i32) -> i32 {
    img.get_pixel(x as u32, y as u32)[0] as i32
}

/// 圆周上是否存在连续 9 个比中心亮（或暗）threshold 以上的像素
fn is_fast_corner(img: &GrayImage, x: u32, y: u32, threshold: u8) -> bool {
    let (x, y) = (x as i32, y as i32);
    let center = pixel(img, x, y);
    let t = threshold as i32;

    // 连续 9 个点至少覆盖上下左右 4 个点中的 2 个
    let mut bright = 0;
    let mut dark = 0;
    for i in [0, 4, 8, 12] {
        let p = pixel(img, x + CIRCLE[i].0, y + CIRCLE[i].1);
        bright += (p > center + t) as u32;
        dark += (p < center - t) as u32;
    }
    if bright < 2 && dark < 2 {
        return false;
    }

    let mut bright_mask = 0u32;
    let mut dark_mask = 0u32;
    for (i, (dx, dy)) in CIRCLE.iter().enumerate() {
        let p = pixel(img, x + dx, y + dy);
        if p > center + t {
            bright_mask |= 1 << i;
        } else if p < center - t {
            dark_mask |= 1 << i;
        }
    }
    has_arc(bright_mask) || has_arc(dark_mask)
}

/// 16 位环形掩码中是否存在长度至少为 9 的连续段
fn has_arc(mask: u32) -> bool {
    if mask.count_ones() < 9 {
        return false;
    }
    let mut run = 0;
    for i in 0..16 + 8 {
        if mask & (1 << (i % 16)) != 0 {
            run += 1;
            if run >= 9 {
                return true;
            }
        } else {
            run = 0;
        }
    }
    false
}

/// 7x7 窗口的 Harris 角点响应
fn harris_response(img: &GrayImage, x: i32, y: i32) -> f32 {
    let r = HARRIS_BLOCK / 2;
    // 归一化 Sobel 梯度，避免数值过大
    let scale = 1.0 / (4.0 * 255.0 * HARRIS_BLOCK as f32);
    let (mut a, mut b, mut c) = (0f32, 0f32, 0f32);
    for v in -r..=r {
        for u in -r..=r {
            let (px, py) = (x + u, y + v);
            let dx = (pixel(img, px + 1, py - 1) + 2 * pixel(img, px + 1, py) + pixel(img, px + 1, py + 1))
                - (pixel(img, px - 1, py - 1) + 2 * pixel(img, px - 1, py) + pixel(img, px - 1, py + 1));
            let dy = (pixel(img, px - 1, py + 1) + 2 * pixel(img, px, py + 1) + pixel(img, px + 1, py + 1))
                - (pixel(img, px - 1, py - 1) + 2 * pixel(img, px, py - 1) + pixel(img, px + 1, py - 1));
            let (dx, dy) = (dx as f32 * scale, dy as f32 * scale);
            a += dx * dx;
            b += dy * dy;
            c += dx * dy;
        }
    }
    a * b - c * c - HARRIS_K * (a + b) * (a + b)
}

/// 灰度质心法计算特征点方向
fn ic_angle(img: &GrayImage, x: i32, y: i32) -> f32 {
    let (mut m01, mut m10) = (0i64, 0i64);
    for v in -PATCH_RADIUS..=PATCH_RADIUS {
        let d = UMAX[v.unsigned_abs() as usize];
        for u in -d..=d {
            let p = pixel(img, x + u, y + v) as i64;
            m10 += u as i64 * p;
            m01 += v as i64 * p;
        }
    }
    (m01 as f32).atan2(m10 as f32)
}

/// 按方向旋转采样模式后计算 256 位描述符
fn compute_brief(img: &GrayImage, x: i32, y: i32, angle: f32) -> Descriptor {
    let (sin, cos) = angle.sin_cos();
    let rotate = |(u, v): (i32, i32)| {
        let ru = (u as f32 * cos - v as f32 * sin).round() as i32;
        let rv = (u as f32 * sin + v as f32 * cos).round() as i32;
        pixel(img, x + ru, y + rv)
    };
    let mut descriptor = [0u8; 32];
    for (i, [p, q]) in PATTERN.iter().enumerate() {
        if rotate(*p) < rotate(*q) {
            descriptor[i / 8] |= 1 << (i % 8);
        }
    }
    descriptor
}

/// 质量评分：特征点数量占比和空间覆盖率各占一半，映射到 0 ~ 10
pub fn quality_score(set: &DescriptorSet, (w, h): (u32, u32), max_features: usize) -> u8 {
    if set.is_empty() || max_features == 0 {
        return 0;
    }
    let count_ratio = (set.len() as f32 / max_features as f32).min(1.0);

    let mut cells = [false; (COVERAGE_GRID * COVERAGE_GRID) as usize];
    for kp in &set.keypoints {
        let cx = ((kp.x / w as f32 * COVERAGE_GRID as f32) as u32).min(COVERAGE_GRID - 1);
        let cy = ((kp.y / h as f32 * COVERAGE_GRID as f32) as u32).min(COVERAGE_GRID - 1);
        cells[(cy * COVERAGE_GRID + cx) as usize] = true;
    }
    let coverage = cells.iter().filter(|c| **c).count() as f32 / cells.len() as f32;

    (10.0 * (0.5 * count_ratio + 0.5 * coverage)).round().clamp(0.0, 10.0) as u8
}
