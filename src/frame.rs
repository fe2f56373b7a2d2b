//! 输入帧的格式转换、裁剪与缩放

use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage};
use log::debug;

use crate::config::EngineConfig;
use crate::error::{Result, VsError};

/// YUV 亮度范围
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YuvRange {
    /// 0 ~ 255
    Full,
    /// 16 ~ 235
    Video,
}

/// 双平面 YUV 4:2:0 帧（NV12），只有亮度平面参与识别
#[derive(Debug, Clone)]
pub struct YuvFrame {
    pub width: u32,
    pub height: u32,
    pub y_plane: Vec<u8>,
    /// 亮度平面每行的字节数，可能大于 width
    pub y_stride: usize,
    pub uv_plane: Vec<u8>,
    pub uv_stride: usize,
    pub range: YuvRange,
}

/// 32 位 BGRA 帧
#[derive(Debug, Clone)]
pub struct BgraFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
    /// 每行的字节数，可能大于 width * 4
    pub stride: usize,
}

/// 提交给引擎的一帧
#[derive(Debug, Clone)]
pub enum Frame {
    Image(DynamicImage),
    Yuv(YuvFrame),
    Bgra(BgraFrame),
}

impl Frame {
    /// 转换为灰度图
    pub fn to_luma(&self) -> Result<GrayImage> {
        match self {
            Frame::Image(img) => Ok(img.to_luma8()),
            Frame::Yuv(frame) => yuv_to_luma(frame),
            Frame::Bgra(frame) => bgra_to_luma(frame),
        }
    }
}

fn yuv_to_luma(frame: &YuvFrame) -> Result<GrayImage> {
    let (w, h) = (frame.width as usize, frame.height as usize);
    check_plane("Y", &frame.y_plane, frame.y_stride, w, h)?;
    // UV 平面为半分辨率交错存储，每行字节数与宽度相同
    check_plane("UV", &frame.uv_plane, frame.uv_stride, w.div_ceil(2) * 2, h.div_ceil(2))?;

    let mut luma = Vec::with_capacity(w * h);
    for row in frame.y_plane.chunks(frame.y_stride).take(h) {
        let row = &row[..w];
        match frame.range {
            YuvRange::Full => luma.extend_from_slice(row),
            YuvRange::Video => luma.extend(row.iter().map(|&y| {
                let y = (y as i32 - 16).clamp(0, 219);
                ((y * 255 + 109) / 219) as u8
            })),
        }
    }
    to_gray_image(frame.width, frame.height, luma)
}

/// Y = (76 * R + 150 * G + 29 * B) >> 8
fn bgra_to_luma(frame: &BgraFrame) -> Result<GrayImage> {
    let (w, h) = (frame.width as usize, frame.height as usize);
    check_plane("BGRA", &frame.data, frame.stride, w * 4, h)?;

    let mut luma = Vec::with_capacity(w * h);
    for row in frame.data.chunks(frame.stride).take(h) {
        let (pixels, _) = row[..w * 4].as_chunks::<4>();
        luma.extend(pixels.iter().map(|&[b, g, r, _]| {
            ((76 * r as u32 + 150 * g as u32 + 29 * b as u32) >> 8) as u8
        }));
    }
    to_gray_image(frame.width, frame.height, luma)
}

fn check_plane(name: &str, data: &[u8], stride: usize, row_bytes: usize, rows: usize) -> Result<()> {
    if row_bytes == 0 || rows == 0 {
        return Err(VsError::InvalidFrame(format!("{name} 平面尺寸为 0")));
    }
    if stride < row_bytes {
        return Err(VsError::InvalidFrame(format!("{name} 平面 stride {stride} 小于 {row_bytes}")));
    }
    // 最后一行允许没有 padding
    let expected = stride * (rows - 1) + row_bytes;
    if data.len() < expected {
        return Err(VsError::InvalidFrame(format!(
            "{name} 平面长度 {} 小于 {expected}",
            data.len()
        )));
    }
    Ok(())
}

fn to_gray_image(width: u32, height: u32, luma: Vec<u8>) -> Result<GrayImage> {
    GrayImage::from_raw(width, height, luma)
        .ok_or_else(|| VsError::InvalidFrame(format!("无法构建 {width}x{height} 灰度图")))
}

/// 按配置裁剪并缩放图片，使最大边等于 frame_size
///
/// 裁剪区域会先与图片求交集，交集为空时返回错误
pub fn prepare_image(image: &GrayImage, config: &EngineConfig) -> Result<GrayImage> {
    let cropped;
    let image = if config.crops() {
        let bounds = crate::types::Rect::new(0, 0, image.width(), image.height());
        let Some(rect) = config.crop_rect.intersection(&bounds) else {
            return Err(VsError::InvalidFrame(format!(
                "裁剪区域 {:?} 位于 {}x{} 的图片之外",
                config.crop_rect,
                image.width(),
                image.height()
            )));
        };
        cropped = imageops::crop_imm(image, rect.x, rect.y, rect.width, rect.height).to_image();
        &cropped
    } else {
        image
    };
    Ok(adjust_image_size(image, config.frame_size))
}

/// 等比缩放图片，使最大边等于 max_size
pub fn adjust_image_size(image: &GrayImage, max_size: u32) -> GrayImage {
    let (w, h) = image.dimensions();
    let max = w.max(h);
    if max == max_size || max == 0 {
        return image.clone();
    }
    let scale = max_size as f32 / max as f32;
    let nw = ((w as f32 * scale).round() as u32).max(1);
    let nh = ((h as f32 * scale).round() as u32).max(1);
    debug!("缩放图片: {w}x{h} -> {nw}x{nh}");
    imageops::resize(image, nw, nh, FilterType::Triangle)
}
