use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use serde::Serialize;

use crate::cli::{OutputFormat, SubCommandExtend, open_image, open_session};
use crate::config::{EngineOptions, Opts};

#[derive(Parser, Debug, Clone)]
pub struct ScoreCommand {
    #[command(flatten)]
    pub engine: EngineOptions,
    /// 图片路径
    #[arg(required = true)]
    pub images: Vec<PathBuf>,
    /// 输出格式
    #[arg(long, value_enum, value_name = "FORMAT", default_value_t)]
    pub output_format: OutputFormat,
}

#[derive(Debug, Serialize)]
struct ScoreOutput {
    image: String,
    score: u8,
}

impl SubCommandExtend for ScoreCommand {
    fn run(&self, opts: &Opts) -> Result<()> {
        let session = open_session(opts, &self.engine)?;

        let mut result = vec![];
        for path in &self.images {
            let image = open_image(path)?;
            let score = session.image_score(&image)?;
            result.push(ScoreOutput { image: path.display().to_string(), score });
        }

        match self.output_format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
            OutputFormat::Table => {
                for r in &result {
                    println!("{}\t{}", r.score, r.image);
                }
            }
        }
        Ok(())
    }
}
