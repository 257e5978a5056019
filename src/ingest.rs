use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use log::info;
use opencv::core::{self, Mat};
use opencv::prelude::*;

use crate::utils;

/// Accepted input formats.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["tiff", "tif", "jpeg", "jpg", "bmp", "png"];

/// Calibration inputs computed by external tooling: an optional 3x3 color
/// transform applied before segmentation and an optional pixels-per-metric
/// scalar applied to measurements at aggregation time.
#[derive(Debug, Clone, Default)]
pub struct Calibration {
    pub color: Option<Mat>,
    pub ppm: Option<f64>,
}

impl Calibration {
    pub fn load(color_matrix: Option<&Path>, ppm: Option<f64>) -> Result<Self> {
        let color = color_matrix.map(read_color_matrix).transpose()?;
        if let Some(ppm) = ppm
            && ppm <= 0.0
        {
            bail!("pixels per metric must be positive, got {}", ppm);
        }
        Ok(Self { color, ppm })
    }
}

/// Reads a 3x3 channel transform from a JSON file holding a nested array.
fn read_color_matrix(path: &Path) -> Result<Mat> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("cannot read color matrix: {}", path.display()))?;
    let rows: [[f64; 3]; 3] = serde_json::from_str(&raw)
        .with_context(|| format!("color matrix is not a 3x3 array: {}", path.display()))?;
    let rows: Vec<Vec<f64>> = rows.iter().map(|r| r.to_vec()).collect();
    Ok(Mat::from_slice_2d(&rows)?)
}

/// Loads and prepares one image: format check, decode, landscape rotation,
/// optional color correction. Any failure here is fatal for this image only.
pub fn load(path: &Path, calibration: &Calibration) -> Result<Mat> {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if !SUPPORTED_EXTENSIONS.contains(&ext.as_str()) {
        bail!("unsupported image format: {}", path.display());
    }

    let mut img = utils::imread(&path.to_string_lossy())?;

    // Portrait shots are rotated so ears lie along the horizontal axis.
    if img.rows() > img.cols() {
        let mut rotated = Mat::default();
        core::rotate(&img, &mut rotated, core::ROTATE_90_CLOCKWISE)?;
        img = rotated;
    }
    info!("[START] {}: image is {} by {} pixels", path.display(), img.rows(), img.cols());

    if let Some(matrix) = &calibration.color {
        let mut corrected = Mat::default();
        core::transform(&img, &mut corrected, matrix)?;
        img = corrected;
    }
    Ok(img)
}
