//! ROI 内的二维码和条形码识别
//!
//! 二维码使用 rqrr；一维码（EAN-13 / UPC-A / UPC-E / EAN-8 / Code 128）使用扫描线解码：
//! 在若干行上二值化、游程编码，再按模块宽度匹配编码表并校验校验位

mod code128;
mod ean;

use image::GrayImage;
use image::imageops;
use log::debug;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VsError};
use crate::types::Rect;

/// 最多可以注册的 ROI 数量
pub const MAX_ROIS: usize = 4;

/// 每个区域扫描的行数
const SCAN_ROWS: u32 = 15;
/// 一行的最大亮度与最小亮度之差小于该值时，认为这一行没有条码
const MIN_CONTRAST: u8 = 40;
/// 一维码的最小宽度
const MIN_LINEAR_WIDTH: u32 = 30;
/// 需要留白的一侧至少需要的模块数量
const QUIET_MODULES: f32 = 2.0;

/// 条码类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Symbology {
    #[serde(rename = "qr")]
    Qr,
    #[serde(rename = "ean-13")]
    Ean13,
    #[serde(rename = "upc-a")]
    UpcA,
    #[serde(rename = "upc-e")]
    UpcE,
    #[serde(rename = "ean-8")]
    Ean8,
    #[serde(rename = "code-128")]
    Code128,
}

impl Symbology {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Qr => "qr",
            Self::Ean13 => "ean-13",
            Self::UpcA => "upc-a",
            Self::UpcE => "upc-e",
            Self::Ean8 => "ean-8",
            Self::Code128 => "code-128",
        }
    }
}

/// 识别结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decoded {
    pub text: String,
    pub symbology: Symbology,
}

/// 感兴趣区域，坐标为输入帧的坐标
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    pub rect: Rect,
    /// 最近一次识别出的内容
    pub decoded: Option<String>,
    pub symbology: Option<Symbology>,
}

impl Roi {
    pub fn new(rect: Rect) -> Self {
        Self { rect, decoded: None, symbology: None }
    }
}

/// 已注册的 ROI，互不重叠且都位于相机输出范围内
#[derive(Debug, Clone, Default)]
pub struct RoiSet {
    rois: Vec<Roi>,
}

impl RoiSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册一个 ROI，超过数量上限、越界或与已有 ROI 重叠时返回错误
    pub fn add(&mut self, rect: Rect, (width, height): (u32, u32)) -> Result<()> {
        if self.rois.len() >= MAX_ROIS {
            return Err(VsError::InvalidRegion(format!("最多只能注册 {MAX_ROIS} 个 ROI")));
        }
        if rect.is_empty() {
            return Err(VsError::InvalidRegion(format!("ROI 面积为 0: {rect:?}")));
        }
        if !rect.fits_in(width, height) {
            return Err(VsError::InvalidRegion(format!("ROI {rect:?} 超出 {width}x{height} 的范围")));
        }
        if let Some(other) = self.rois.iter().find(|roi| roi.rect.intersects(&rect)) {
            return Err(VsError::InvalidRegion(format!("ROI {rect:?} 与 {:?} 重叠", other.rect)));
        }
        self.rois.push(Roi::new(rect));
        Ok(())
    }

    pub fn clear(&mut self) {
        self.rois.clear();
    }

    pub fn len(&self) -> usize {
        self.rois.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rois.is_empty()
    }

    pub fn as_slice(&self) -> &[Roi] {
        &self.rois
    }

    pub fn rects(&self) -> Vec<Rect> {
        self.rois.iter().map(|roi| roi.rect).collect()
    }

    /// 保存识别结果，只更新矩形相同的 ROI
    pub fn record(&mut self, results: &[Roi]) {
        for result in results {
            if let Some(roi) = self.rois.iter_mut().find(|roi| roi.rect == result.rect) {
                roi.decoded.clone_from(&result.decoded);
                roi.symbology = result.symbology;
            }
        }
    }
}

/// 并行识别每个 ROI，结果与输入顺序一致
pub fn decode_rois(image: &GrayImage, rects: &[Rect]) -> Vec<Roi> {
    rects
        .par_iter()
        .map(|&rect| {
            let decoded = decode_region(image, rect);
            Roi { rect, symbology: decoded.as_ref().map(|d| d.symbology), decoded: decoded.map(|d| d.text) }
        })
        .collect()
}

/// 识别图片中指定区域的条码，区域会先与图片求交集
pub fn decode_region(image: &GrayImage, rect: Rect) -> Option<Decoded> {
    let bounds = Rect::new(0, 0, image.width(), image.height());
    let rect = rect.intersection(&bounds)?;
    let region = imageops::crop_imm(image, rect.x, rect.y, rect.width, rect.height).to_image();
    decode(&region)
}

/// 识别整张图片中的条码，先尝试二维码，再尝试一维码
pub fn decode(image: &GrayImage) -> Option<Decoded> {
    decode_qr(image).or_else(|| decode_linear(image))
}

pub fn decode_qr(image: &GrayImage) -> Option<Decoded> {
    let mut prepared = rqrr::PreparedImage::prepare(image.clone());
    for grid in prepared.detect_grids() {
        match grid.decode() {
            Ok((_, text)) => return Some(Decoded { text, symbology: Symbology::Qr }),
            Err(e) => debug!("二维码解码失败: {e}"),
        }
    }
    None
}

/// 在等间距的若干行上尝试识别一维码，两个扫描方向都会尝试
pub fn decode_linear(image: &GrayImage) -> Option<Decoded> {
    let (w, h) = image.dimensions();
    if w < MIN_LINEAR_WIDTH || h == 0 {
        return None;
    }
    let rows = SCAN_ROWS.min(h);
    (0..rows).find_map(|i| {
        // 从中间开始向两侧交替扫描
        let offset = (i as i32 + 1) / 2 * if i % 2 == 0 { 1 } else { -1 };
        let y = (h as i32 / 2 + offset * (h as i32 / (rows as i32 + 1)).max(1)).clamp(0, h as i32 - 1) as u32;
        let row = &image.as_raw()[(y * w) as usize..((y + 1) * w) as usize];
        let mut runs = run_lengths(row)?;
        decode_row(&runs).or_else(|| {
            runs.reverse();
            decode_row(&runs)
        })
    })
}

fn decode_row(runs: &[Run]) -> Option<Decoded> {
    ean::decode_runs(runs).or_else(|| code128::decode_runs(runs))
}

/// 一段连续的黑色或白色像素
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Run {
    bar: bool,
    len: u32,
}

/// 以行内最大最小亮度的中值二值化并做游程编码，对比度不足时返回 None
fn run_lengths(row: &[u8]) -> Option<Vec<Run>> {
    let min = *row.iter().min()?;
    let max = *row.iter().max()?;
    if max - min < MIN_CONTRAST {
        return None;
    }
    let threshold = ((min as u16 + max as u16) / 2) as u8;

    let mut runs: Vec<Run> = vec![];
    for &p in row {
        let bar = p < threshold;
        match runs.last_mut() {
            Some(run) if run.bar == bar => run.len += 1,
            _ => runs.push(Run { bar, len: 1 }),
        }
    }
    Some(runs)
}

/// 所有以条开始、前一段为空的位置
fn bar_starts(runs: &[Run]) -> impl Iterator<Item = usize> + '_ {
    (1..runs.len()).filter(|&i| runs[i].bar && !runs[i - 1].bar)
}

/// 把一组游程按总模块数归一化后与编码表比较，返回误差最小的编码序号和误差
fn closest_pattern<const N: usize>(runs: &[Run], table: &[[u8; N]], modules: u32) -> Option<(usize, f32)> {
    let total: u32 = runs.iter().map(|r| r.len).sum();
    if runs.len() != N || total == 0 {
        return None;
    }
    let scale = modules as f32 / total as f32;
    table
        .iter()
        .enumerate()
        .map(|(i, pattern)| {
            let error = runs.iter().zip(pattern).map(|(r, &p)| (r.len as f32 * scale - p as f32).abs()).sum::<f32>();
            (i, error)
        })
        .min_by(|a, b| a.1.total_cmp(&b.1))
}

#[cfg(test)]
mod tests {
    use image::Luma;

    use super::*;
    use crate::testing::{render_ean, render_modules, textured_image};

    fn rect(x: u32, y: u32, w: u32, h: u32) -> Rect {
        Rect::new(x, y, w, h)
    }

    #[test]
    fn test_decode_from_literal_modules() {
        // EAN-13 5901234123457 的标准模块序列
        let modules = concat!(
            "101",
            "0001011", "0100111", "0110011", "0010011", "0111101", "0011101",
            "01010",
            "1100110", "1101100", "1000010", "1011100", "1001110", "1000100",
            "101",
        );
        let decoded = decode(&render_modules(modules, 2)).unwrap();
        assert_eq!(decoded, Decoded { text: "5901234123457".to_string(), symbology: Symbology::Ean13 });
        assert_eq!(render_modules(modules, 2), render_ean("5901234123457", 2));
    }

    #[test]
    fn test_decode_upside_down() {
        let image = imageops::rotate180(&render_ean("5901234123457", 3));
        assert_eq!(decode(&image).unwrap().text, "5901234123457");
    }

    #[test]
    fn test_blank_and_noise() {
        let blank = GrayImage::from_pixel(200, 100, Luma([255]));
        assert_eq!(decode(&blank), None);
        let noise = textured_image(200, 100, 3);
        assert_eq!(decode(&noise), None);
    }

    #[test]
    fn test_decode_qr() {
        let code = qrcode::QrCode::new(b"https://example.com/vsearch").unwrap();
        let image = code.render::<Luma<u8>>().module_dimensions(4, 4).build();
        let decoded = decode(&image).unwrap();
        assert_eq!(decoded, Decoded { text: "https://example.com/vsearch".to_string(), symbology: Symbology::Qr });
    }

    #[test]
    fn test_symbology_names() {
        for symbology in [Symbology::Qr, Symbology::Ean13, Symbology::UpcE, Symbology::Code128] {
            let json = serde_json::to_string(&symbology).unwrap();
            assert_eq!(json, format!("\"{}\"", symbology.as_str()));
        }
    }

    #[test]
    fn test_roi_rules() {
        let mut rois = RoiSet::new();
        let capture = (640, 480);
        rois.add(rect(0, 0, 320, 240), capture).unwrap();
        rois.add(rect(320, 0, 320, 240), capture).unwrap();
        rois.add(rect(0, 240, 320, 240), capture).unwrap();
        // 重叠
        assert!(matches!(rois.add(rect(300, 200, 100, 100), capture), Err(VsError::InvalidRegion(_))));
        // 越界
        assert!(matches!(rois.add(rect(600, 400, 100, 100), capture), Err(VsError::InvalidRegion(_))));
        // 坐标溢出
        assert!(matches!(rois.add(rect(u32::MAX - 5, 0, 10, 10), capture), Err(VsError::InvalidRegion(_))));
        rois.add(rect(320, 240, 320, 240), capture).unwrap();
        assert_eq!(rois.len(), 4);
        // 第 5 个
        assert!(matches!(rois.add(rect(0, 0, 1, 1), capture), Err(VsError::InvalidRegion(_))));
        rois.clear();
        assert!(rois.is_empty());
    }

    #[test]
    fn test_decode_rois_in_order() {
        // 左半边是条码，右半边空白
        let code = render_ean("5901234123457", 2);
        let (w, h) = code.dimensions();
        let mut image = GrayImage::from_pixel(w * 2, h, Luma([255]));
        imageops::replace(&mut image, &code, 0, 0);

        let results = decode_rois(&image, &[rect(w, 0, w, h), rect(0, 0, w, h)]);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].decoded, None);
        assert_eq!(results[1].decoded.as_deref(), Some("5901234123457"));
        assert_eq!(results[1].symbology, Some(Symbology::Ean13));

        let mut rois = RoiSet::new();
        rois.add(rect(0, 0, w, h), (w * 2, h)).unwrap();
        rois.record(&results);
        assert_eq!(rois.as_slice()[0].decoded.as_deref(), Some("5901234123457"));
    }
}
