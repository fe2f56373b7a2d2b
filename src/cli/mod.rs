mod scan;
mod score;
mod search;

use std::path::Path;

use anyhow::Result;
use clap::ValueEnum;
use image::DynamicImage;
use indicatif::ProgressStyle;
pub use scan::*;
pub use score::*;
pub use search::*;

use crate::config::{EngineOptions, Opts};
use crate::session::{KeyValidator, Session};

pub trait SubCommandExtend {
    fn run(&self, opts: &Opts) -> Result<()>;
}

#[derive(ValueEnum, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    #[default]
    Table,
}

/// 命令行工具在本地运行，不需要授权
struct LocalKey;

impl KeyValidator for LocalKey {
    fn validate(&self, _key: &str) -> bool {
        true
    }
}

/// 读取配置文件并用命令行参数覆盖，然后创建已初始化的会话
fn open_session(opts: &Opts, engine: &EngineOptions) -> Result<Session> {
    let config = engine.apply(opts.conf_dir.load_engine_config()?)?;
    let session = Session::builder().config(config).build()?;
    session.init_with_key("local", &LocalKey)?;
    Ok(session)
}

fn open_image(path: &Path) -> Result<DynamicImage> {
    image::open(path).map_err(|e| anyhow::anyhow!("无法打开图片 {}: {}", path.display(), e))
}

pub fn pb_style() -> ProgressStyle {
    ProgressStyle::with_template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}
