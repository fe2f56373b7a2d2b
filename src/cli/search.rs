use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Parser;
use indicatif::{ParallelProgressIterator, ProgressBar};
use log::{debug, info};
use rayon::prelude::*;
use regex::Regex;
use serde::Serialize;
use walkdir::WalkDir;

use crate::cli::{OutputFormat, SubCommandExtend, open_image, open_session, pb_style};
use crate::config::{EngineOptions, Opts};
use crate::types::ImageId;

#[derive(Parser, Debug, Clone)]
pub struct SearchCommand {
    #[command(flatten)]
    pub engine: EngineOptions,
    /// 图库目录，目录中的图片会按路径排序后依次编号
    #[arg(short, long)]
    pub pool: PathBuf,
    /// 扫描的文件后缀名，多个后缀用逗号分隔
    #[arg(short, long, default_value = "jpg,jpeg,png,webp")]
    pub suffix: String,
    /// 被搜索的图片路径
    #[arg(required = true)]
    pub images: Vec<PathBuf>,
    /// 每张图片最多输出的候选数量
    #[arg(short, long, default_value_t = 5)]
    pub count: usize,
    /// 处理图库使用的线程数量，默认为 CPU 核心数
    #[arg(short = 'j', long)]
    pub threads: Option<usize>,
    /// 输出格式
    #[arg(long, value_enum, value_name = "FORMAT", default_value_t)]
    pub output_format: OutputFormat,
}

#[derive(Debug, Serialize)]
struct Candidate {
    id: ImageId,
    score: f32,
    path: String,
}

#[derive(Debug, Serialize)]
struct SearchOutput {
    image: String,
    /// 评分超过阈值的最佳匹配
    matched: Option<Candidate>,
    candidates: Vec<Candidate>,
}

impl SubCommandExtend for SearchCommand {
    fn run(&self, opts: &Opts) -> Result<()> {
        let threads = self.threads.unwrap_or_else(num_cpus::get);
        if let Err(e) = rayon::ThreadPoolBuilder::new().num_threads(threads).build_global() {
            debug!("线程池已初始化: {e}");
        }

        let session = open_session(opts, &self.engine)?;
        let threshold = session.config().matching_threshold as f32;

        let re_suf = Regex::new(&format!("(?i)^({})$", self.suffix.replace(',', "|")))?;
        let pool = scan_pool(&self.pool, &re_suf);
        info!("图库中共有 {} 张图片", pool.len());

        let pb = ProgressBar::new(pool.len() as u64).with_style(pb_style());
        pool.par_iter().enumerate().progress_with(pb.clone()).for_each(|(id, path)| {
            let result = open_image(path).and_then(|image| Ok(session.insert_image_with_id(&image, id as ImageId)?));
            if let Err(e) = result {
                pb.println(format!("[跳过] {}: {}", path.display(), e));
            }
        });
        pb.finish_and_clear();

        let mut outputs = vec![];
        for path in &self.images {
            let image = open_image(path)?;
            let mut candidates = session
                .rank_image(&image)?
                .into_iter()
                .map(|r| Candidate { id: r.id, score: r.score, path: pool[r.id as usize].display().to_string() })
                .collect::<Vec<_>>();
            candidates.truncate(self.count);
            let matched = candidates.first().filter(|c| c.score > threshold).map(|c| Candidate {
                id: c.id,
                score: c.score,
                path: c.path.clone(),
            });
            outputs.push(SearchOutput { image: path.display().to_string(), matched, candidates });
        }

        print_result(&outputs, self.output_format)
    }
}

/// 递归扫描目录，返回按路径排序的图片列表
fn scan_pool(dir: &Path, re_suf: &Regex) -> Vec<PathBuf> {
    let mut paths = WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| path.extension().is_some_and(|ext| re_suf.is_match(&ext.to_string_lossy())))
        .collect::<Vec<_>>();
    paths.sort();
    paths
}

fn print_result(outputs: &[SearchOutput], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(outputs)?)
        }
        OutputFormat::Table => {
            for output in outputs {
                match &output.matched {
                    Some(m) => println!("{}\t=> {}", output.image, m.path),
                    None => println!("{}\t=> -", output.image),
                }
                for c in &output.candidates {
                    println!("{:.2}\t{}", c.score, c.path);
                }
            }
        }
    }
    Ok(())
}
