use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, ValueEnum};

use crate::cli::SubCommandExtend;
use crate::config::{Opts, PipelineOptions};
use crate::features::FeatureRecord;
use crate::pipeline::Pipeline;

#[derive(Parser, Debug, Clone)]
pub struct AnalyzeCommand {
    /// Image to analyze
    #[arg(short, long, value_name = "FILE")]
    pub image: PathBuf,
    #[command(flatten)]
    pub pipeline: PipelineOptions,
    /// Output format
    #[arg(long, value_name = "FORMAT", default_value = "table")]
    pub output_format: OutputFormat,
}

impl SubCommandExtend for AnalyzeCommand {
    fn run(&self, opts: &Opts) -> Result<()> {
        let mut pipeline = Pipeline::new(opts, &self.pipeline)?;
        pipeline.process_image(&self.image)?;
        print_result(pipeline.records(), self)
    }
}

fn print_result(records: &[FeatureRecord], opts: &AnalyzeCommand) -> Result<()> {
    match opts.output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(records)?)
        }
        OutputFormat::Table => {
            for r in records {
                println!(
                    "{}\t#{}\tarea {}\tlength {}\twidth {}",
                    r.filename,
                    r.ear_number,
                    fmt(r.ear_area),
                    fmt(r.ear_box_length),
                    fmt(r.max_width),
                )
            }
        }
    }
    Ok(())
}

fn fmt(v: Option<f64>) -> String {
    v.map(|v| format!("{v:.1}")).unwrap_or_else(|| "-".to_string())
}

#[derive(ValueEnum, Debug, Clone)]
pub enum OutputFormat {
    Json,
    Table,
}
