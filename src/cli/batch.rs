use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use indicatif::ProgressBar;
use log::{error, info};
use regex::Regex;
use walkdir::WalkDir;

use crate::cli::SubCommandExtend;
use crate::config::{Opts, PipelineOptions};
use crate::ingest::SUPPORTED_EXTENSIONS;
use crate::pipeline::Pipeline;
use crate::utils;

fn default_suffixes() -> String {
    SUPPORTED_EXTENSIONS.join(",")
}

#[derive(Parser, Debug, Clone)]
pub struct BatchCommand {
    /// Directory scanned recursively for images
    #[arg(short, long, value_name = "DIR")]
    pub input: PathBuf,
    /// File suffixes to scan, comma separated
    #[arg(short, long, default_value_t = default_suffixes())]
    pub suffix: String,
    #[command(flatten)]
    pub pipeline: PipelineOptions,
}

impl SubCommandExtend for BatchCommand {
    fn run(&self, opts: &Opts) -> Result<()> {
        let suffix = Regex::new(&format!(r"(?i)\.({})$", self.suffix.replace(',', "|")))
            .map_err(|e| anyhow::anyhow!("bad --suffix pattern: {e}"))?;
        let mut files: Vec<PathBuf> = WalkDir::new(&self.input)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| suffix.is_match(&path.to_string_lossy()))
            .collect();
        files.sort();
        info!("[BATCH] {}: {} image(s)", self.input.display(), files.len());

        let mut pipeline = Pipeline::new(opts, &self.pipeline)?;
        let pb = ProgressBar::new(files.len() as u64).with_style(utils::pb_style());
        let mut failed = 0usize;
        let mut ears = 0usize;
        for path in &files {
            pb.set_message(path.file_name().unwrap_or_default().to_string_lossy().into_owned());
            // one bad image must not sink the batch
            match pipeline.process_image(path) {
                Ok(count) => ears += count,
                Err(e) => {
                    failed += 1;
                    error!("[BATCH] {}: {:#}", path.display(), e);
                }
            }
            pb.inc(1);
        }
        pb.finish_with_message("done");
        info!(
            "[BATCH] processed {} image(s), {} ear(s), {} failure(s)",
            files.len() - failed,
            ears,
            failed
        );
        Ok(())
    }
}
