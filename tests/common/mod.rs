#![allow(dead_code)]

use std::path::{Path, PathBuf};

use image::GrayImage;

#[path = "../../src/testing.rs"]
mod testing;

pub use testing::*;

/// 保存为 PNG 并返回路径
pub fn write_png(dir: &Path, name: &str, image: &GrayImage) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    image.save(&path).unwrap();
    path
}
