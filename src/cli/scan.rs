use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use crate::barcode::{self, Roi, RoiSet};
use crate::cli::{OutputFormat, SubCommandExtend, open_image};
use crate::config::{Opts, parse_rect};
use crate::types::Rect;

#[derive(Parser, Debug, Clone)]
pub struct ScanCommand {
    /// 图片路径
    pub image: PathBuf,
    /// 识别区域，可以指定多次，最多 4 个，不指定时识别整张图片
    #[arg(long = "roi", value_name = "X,Y,W,H", value_parser = parse_rect)]
    pub rois: Vec<Rect>,
    /// 输出格式
    #[arg(long, value_enum, value_name = "FORMAT", default_value_t)]
    pub output_format: OutputFormat,
}

impl SubCommandExtend for ScanCommand {
    fn run(&self, _opts: &Opts) -> Result<()> {
        let image = open_image(&self.image)?.to_luma8();

        let result = if self.rois.is_empty() {
            let rect = Rect::new(0, 0, image.width(), image.height());
            let decoded = barcode::decode(&image);
            vec![Roi { rect, symbology: decoded.as_ref().map(|d| d.symbology), decoded: decoded.map(|d| d.text) }]
        } else {
            // 与会话中注册 ROI 的规则相同
            let mut rois = RoiSet::new();
            for rect in &self.rois {
                rois.add(*rect, image.dimensions())?;
            }
            barcode::decode_rois(&image, &rois.rects())
        };

        match self.output_format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
            OutputFormat::Table => {
                for roi in &result {
                    let Rect { x, y, width, height } = roi.rect;
                    match (&roi.decoded, roi.symbology) {
                        (Some(text), Some(symbology)) => {
                            println!("{x},{y},{width},{height}\t{}\t{text}", symbology.as_str())
                        }
                        _ => println!("{x},{y},{width},{height}\t-"),
                    }
                }
            }
        }

        if result.iter().all(|roi| roi.decoded.is_none()) {
            anyhow::bail!("没有识别到条码");
        }
        Ok(())
    }
}
