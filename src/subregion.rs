use anyhow::Result;
use log::{info, warn};
use opencv::core::{self, Mat, Rect};
use opencv::imgproc;
use opencv::prelude::*;

use crate::geometry;
use crate::utils;

/// A side fills more of the ear than this and the segmentation is discarded
/// as a failed threshold.
const MAX_FILL: f64 = 0.95;

/// Tuning for one end of the ear. `threshold == 0` lets Otsu pick the level,
/// anything else scales the Otsu level. `percent` restricts the search band
/// measured from that end, as a fraction of ear length.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegParams {
    pub percent: f64,
    pub contrast: f64,
    pub threshold: f64,
    pub close: i32,
}

impl SegParams {
    /// Builds from the raw `[percent, contrast, threshold, close]` vector.
    /// `percent` is given out of 100 on the command line and stored as a
    /// fraction. All zeros means the side is disabled.
    pub fn from_vector(raw: &[f64; 4]) -> Option<Self> {
        if raw.iter().all(|v| *v == 0.0) {
            return None;
        }
        Some(Self {
            percent: raw[0] / 100.0,
            contrast: raw[1],
            threshold: raw[2],
            close: raw[3] as i32,
        })
    }
}

/// One segmented end of the ear.
#[derive(Debug)]
pub struct SubRegion {
    pub mask: Mat,
    pub area: f64,
    /// Fraction of the whole-ear area this end covers.
    pub fill: f64,
}

/// Tip, bottom and the kernel band left between them.
#[derive(Debug)]
pub struct SubRegions {
    pub tip: Option<SubRegion>,
    pub bottom: Option<SubRegion>,
    pub kernel: Option<SubRegion>,
    pub kernel_length: Option<f64>,
    pub kernel_convexity: Option<f64>,
}

enum Side {
    Tip,
    Bottom,
}

/// Segments cob tip and shank off an upright ear. Returns `None` when both
/// sides are disabled, or when an enabled side fails its threshold; a partial
/// result never reaches the feature table.
pub fn segment(
    ear: &Mat,
    mask: &Mat,
    ear_index: usize,
    tip: Option<&SegParams>,
    bottom: Option<&SegParams>,
) -> Result<Option<SubRegions>> {
    if tip.is_none() && bottom.is_none() {
        return Ok(None);
    }
    let ear_area = core::count_non_zero(mask)? as f64;
    if ear_area <= 0.0 {
        return Ok(None);
    }

    let tip_region = match tip {
        Some(params) => match segment_side(ear, mask, ear_area, Side::Tip, params)? {
            Some(region) => Some(region),
            None => {
                warn!("[SUBSEG] ear #{}: tip segmentation failed, skipped", ear_index);
                return Ok(None);
            }
        },
        None => None,
    };
    let bottom_region = match bottom {
        Some(params) => match segment_side(ear, mask, ear_area, Side::Bottom, params)? {
            Some(region) => Some(region),
            None => {
                warn!("[SUBSEG] ear #{}: bottom segmentation failed, skipped", ear_index);
                return Ok(None);
            }
        },
        None => None,
    };

    // Whatever the ends do not claim is kernel.
    let mut kernel_mask = mask.try_clone()?;
    for region in [&tip_region, &bottom_region].into_iter().flatten() {
        let mut remaining = Mat::default();
        core::subtract_def(&kernel_mask, &region.mask, &mut remaining)?;
        kernel_mask = remaining;
    }
    let kernel_mask = utils::keep_largest_component(&kernel_mask)?;
    let kernel_area = core::count_non_zero(&kernel_mask)? as f64;
    let kernel_fill = kernel_area / ear_area;
    if kernel_area <= 0.0 {
        warn!("[SUBSEG] ear #{}: nothing left for the kernel band, skipped", ear_index);
        return Ok(None);
    }
    // a near-whole-ear kernel means the ends only caught speckle
    if kernel_fill > MAX_FILL {
        warn!(
            "[SUBSEG] ear #{}: kernel band covers {:.2} of the ear, skipped",
            ear_index, kernel_fill
        );
        return Ok(None);
    }

    let (kernel_length, kernel_convexity) =
        match geometry::build(&kernel_mask, geometry::DEFAULT_SLICES)? {
            Some((_, d)) => (Some(d.box_length), Some(d.convexity)),
            None => (None, None),
        };

    info!(
        "[SUBSEG] ear #{}: tip {:.0} px, bottom {:.0} px, kernel {:.0} px",
        ear_index,
        tip_region.as_ref().map_or(0.0, |r| r.area),
        bottom_region.as_ref().map_or(0.0, |r| r.area),
        kernel_area
    );

    Ok(Some(SubRegions {
        tip: tip_region,
        bottom: bottom_region,
        kernel: Some(SubRegion { fill: kernel_fill, area: kernel_area, mask: kernel_mask }),
        kernel_length,
        kernel_convexity,
    }))
}

/// Thresholds exposed cob on the saturation channel at one end of the ear.
fn segment_side(
    ear: &Mat,
    mask: &Mat,
    ear_area: f64,
    side: Side,
    params: &SegParams,
) -> Result<Option<SubRegion>> {
    let mut hsv = Mat::default();
    imgproc::cvt_color_def(ear, &mut hsv, imgproc::COLOR_BGR2HSV)?;
    let sat = utils::channel(&hsv, 1)?;
    let sat = utils::apply_contrast(&sat, params.contrast)?;

    // Cob reads darker than kernels in saturation, so invert the threshold.
    let mut cob = Mat::default();
    if params.threshold == 0.0 {
        let level = utils::otsu_level_masked(&sat, mask)?;
        imgproc::threshold(&sat, &mut cob, level, 255.0, imgproc::THRESH_BINARY_INV)?;
    } else {
        let level = utils::otsu_level_masked(&sat, mask)? * params.threshold;
        imgproc::threshold(&sat, &mut cob, level.min(254.0), 255.0, imgproc::THRESH_BINARY_INV)?;
    }

    // Only look within the band measured from this end of the ear.
    let (top, bottom) = foreground_extent(mask)?;
    let length = (bottom - top + 1) as f64;
    let band = (length * params.percent.clamp(0.0, 1.0)) as i32;
    let (cob_cols, cob_rows) = (cob.cols(), cob.rows());
    match side {
        Side::Tip => {
            let cut = top + band;
            utils::zero_band(&mut cob, Rect::new(0, cut, cob_cols, cob_rows - cut))?;
        }
        Side::Bottom => {
            let cut = bottom - band;
            utils::zero_band(&mut cob, Rect::new(0, 0, cob_cols, cut.max(0)))?;
        }
    }

    let mut bounded = Mat::default();
    core::bitwise_and_def(&cob, mask, &mut bounded)?;
    let mut cob = bounded;
    if params.close > 0 {
        cob = utils::morph(&cob, imgproc::MORPH_CLOSE, params.close, 1)?;
        let mut rebounded = Mat::default();
        core::bitwise_and_def(&cob, mask, &mut rebounded)?;
        cob = rebounded;
    }
    let cob = utils::keep_largest_component(&cob)?;

    let area = core::count_non_zero(&cob)? as f64;
    let fill = area / ear_area;
    if area <= 0.0 || fill > MAX_FILL {
        return Ok(None);
    }
    Ok(Some(SubRegion { mask: cob, area, fill }))
}

/// First and last foreground rows of the mask.
fn foreground_extent(mask: &Mat) -> opencv::Result<(i32, i32)> {
    let mut top = 0;
    let mut bottom = mask.rows().saturating_sub(1);
    for y in 0..mask.rows() {
        if core::count_non_zero(&mask.row(y)?)? > 0 {
            top = y;
            break;
        }
    }
    for y in (0..mask.rows()).rev() {
        if core::count_non_zero(&mask.row(y)?)? > 0 {
            bottom = y;
            break;
        }
    }
    Ok((top, bottom))
}
