use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::cli::*;
use crate::geometry;
use crate::ingest::Calibration;
use crate::locator::LocatorParams;
use crate::roi::SilkParams;
use crate::subregion::SegParams;

#[derive(Parser, Debug, Clone)]
#[command(name = "earcv", version, about = "Maize ear phenotyping from flatbed photos")]
pub struct Opts {
    #[command(subcommand)]
    pub subcmd: SubCommand,
    /// Output directory for features.csv, proofs and the log
    #[arg(short, long, value_name = "DIR", default_value = ".")]
    pub outdir: PathBuf,
    /// Do not write any file (features.csv, proofs, log)
    #[arg(long = "no_save", visible_alias = "ns")]
    pub no_save: bool,
    /// Do not render proof images
    #[arg(long = "no_proof", visible_alias = "np")]
    pub no_proof: bool,
    /// Pop up intermediate images while processing
    #[arg(short = 'D', long)]
    pub debug: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SubCommand {
    /// Analyze a single image
    Analyze(AnalyzeCommand),
    /// Analyze every supported image under a directory
    Batch(BatchCommand),
}

/// Knobs shared by both subcommands, mirroring the tunable stages of the
/// pipeline in processing order.
#[derive(Parser, Debug, Clone)]
pub struct PipelineOptions {
    /// Identity to report instead of the file name, e.g. a plot barcode
    #[arg(long, visible_alias = "qr", value_name = "ID")]
    pub id: Option<String>,
    /// 3x3 color correction matrix as a JSON file
    #[arg(long, value_name = "FILE")]
    pub clr: Option<PathBuf>,
    /// Pixels per metric unit; lengths and areas are rescaled by it
    #[arg(long, value_name = "PPM")]
    pub ppm: Option<f64>,
    /// Candidate filter: min area %, max area %, max aspect ratio, max solidity
    #[arg(long, num_args = 4, value_names = ["MIN_AREA", "MAX_AREA", "ASPECT", "SOLIDITY"],
          default_values_t = [1.0, 10.0, 0.6, 0.983])]
    pub filter: Vec<f64>,
    /// Mask clean-up: max area COV, max iterations
    #[arg(long, num_args = 2, value_names = ["COV", "ITERS"], default_values_t = [0.35, 10.0])]
    pub clnup: Vec<f64>,
    /// Force silk clean-up: min convexity delta, max iterations
    #[arg(long, num_args = 2, value_names = ["DELTA", "ITERS"])]
    pub slk: Option<Vec<f64>>,
    /// Waist depth ratio above which a filtered-out blob is split in two
    #[arg(long, value_name = "RATIO", default_value_t = 0.30)]
    pub split_waist: f64,
    /// Number of width slices along the ear
    #[arg(long, value_name = "N", default_value_t = geometry::DEFAULT_SLICES)]
    pub slices: usize,
    /// Tip segmentation: band % of ear length (0-100), contrast, threshold factor, close kernel (all zero = off)
    #[arg(short = 't', long, num_args = 4,
          value_names = ["PERCENT", "CONTRAST", "THRESHOLD", "CLOSE"],
          default_values_t = [0.0, 0.0, 0.0, 0.0])]
    pub tip: Vec<f64>,
    /// Shank segmentation: band % of ear length (0-100), contrast, threshold factor, close kernel (all zero = off)
    #[arg(short = 'b', long, num_args = 4,
          value_names = ["PERCENT", "CONTRAST", "THRESHOLD", "CLOSE"],
          default_values_t = [0.0, 0.0, 0.0, 0.0])]
    pub bottom: Vec<f64>,
}

impl PipelineOptions {
    pub fn calibration(&self) -> anyhow::Result<Calibration> {
        Calibration::load(self.clr.as_deref(), self.ppm)
    }

    pub fn locator_params(&self) -> LocatorParams {
        LocatorParams {
            min_area_frac: self.filter[0] / 100.0,
            max_area_frac: self.filter[1] / 100.0,
            max_aspect_ratio: self.filter[2],
            max_solidity: self.filter[3],
            max_area_cov: self.clnup[0],
            max_cleanup_iterations: self.clnup[1] as usize,
            split_waist: self.split_waist,
            ..Default::default()
        }
    }

    pub fn silk_params(&self) -> Option<SilkParams> {
        self.slk
            .as_ref()
            .map(|v| SilkParams { min_delta: v[0], max_iterations: v[1] as usize })
    }

    pub fn tip_params(&self) -> Option<SegParams> {
        SegParams::from_vector(&to_array(&self.tip))
    }

    pub fn bottom_params(&self) -> Option<SegParams> {
        SegParams::from_vector(&to_array(&self.bottom))
    }
}

fn to_array(v: &[f64]) -> [f64; 4] {
    [v[0], v[1], v[2], v[3]]
}
