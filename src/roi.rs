use anyhow::{Result, bail};
use log::{debug, info};
use opencv::core::{self, Mat, Point, Point2f, Scalar, Size, Vector};
use opencv::imgproc;
use opencv::prelude::*;

use crate::geometry::SliceModel;
use crate::locator::EarRegion;
use crate::utils;

/// Convexity below which silk decontamination kicks in automatically.
const SILK_TRIGGER_CONVEXITY: f64 = 0.87;

const BORDER: i32 = 30;

/// Silk decontamination tuning: iterate morphological opening until one step
/// improves the mask convexity by at least `min_delta` over the baseline, or
/// the iteration budget runs out.
#[derive(Debug, Clone, Copy)]
pub struct SilkParams {
    pub min_delta: f64,
    pub max_iterations: usize,
}

impl Default for SilkParams {
    fn default() -> Self {
        Self { min_delta: 0.04, max_iterations: 10 }
    }
}

/// One ear cut out of the source image: the upright, border-padded BGR crop
/// (background zeroed) and its binary mask. Tip end is at the top.
#[derive(Debug)]
pub struct EarRoi {
    pub image: Mat,
    pub mask: Mat,
}

/// Warps an ear region upright, cleans silk contamination off its mask and
/// orients it tip-up. `silk` forces the decontamination loop with custom
/// settings; otherwise it runs only when the mask convexity looks silky.
pub fn extract(img: &Mat, region: &EarRegion, silk: Option<&SilkParams>) -> Result<EarRoi> {
    let mut ear = warp_upright(img, region)?;

    let mut padded = Mat::default();
    core::copy_make_border(
        &ear,
        &mut padded,
        BORDER,
        BORDER,
        BORDER,
        BORDER,
        core::BORDER_CONSTANT,
        Scalar::all(0.0),
    )?;
    ear = padded;

    // Re-threshold inside the crop and keep the main body.
    let red = utils::channel(&ear, 2)?;
    let (_, mask) = utils::otsu(&red)?;
    let mut mask = utils::keep_largest_component(&mask)?;

    mask = clean_silks(&mask, region.index, silk)?;

    let mut cleaned = Mat::new_rows_cols_with_default(
        ear.rows(),
        ear.cols(),
        core::CV_8UC3,
        Scalar::all(0.0),
    )?;
    ear.copy_to_masked(&mut cleaned, &mask)?;
    ear = cleaned;

    // Tip (the narrow end) belongs at the top of the crop.
    if let Some(model) = SliceModel::from_mask(&mask, 20)? {
        let widths = model.widths();
        let head = utils::mean(&widths[..5]);
        let tail = utils::mean(&widths[widths.len() - 5..]);
        if head > tail {
            info!("[EAR] ear #{}: rotated tip-up", region.index);
            let mut flipped = Mat::default();
            core::rotate(&ear, &mut flipped, core::ROTATE_180)?;
            ear = flipped;
            let mut flipped_mask = Mat::default();
            core::rotate(&mask, &mut flipped_mask, core::ROTATE_180)?;
            mask = flipped_mask;
        }
    }

    Ok(EarRoi { image: ear, mask })
}

/// Perspective-warps the minimum-area rectangle of the contour so the ear's
/// major axis runs vertically.
fn warp_upright(img: &Mat, region: &EarRegion) -> Result<Mat> {
    let rect = imgproc::min_area_rect(&region.contour)?;
    let width = rect.size.width.round() as i32;
    let height = rect.size.height.round() as i32;
    if width < 2 || height < 2 {
        bail!("degenerate ear region #{}", region.index);
    }

    // Cut the ear free of its surroundings before warping.
    let mut region_mask = Mat::new_rows_cols_with_default(
        img.rows(),
        img.cols(),
        core::CV_8UC1,
        Scalar::all(0.0),
    )?;
    let one: Vector<Vector<Point>> = Vector::from_iter([region.contour.clone()]);
    imgproc::draw_contours(
        &mut region_mask,
        &one,
        -1,
        Scalar::all(255.0),
        imgproc::FILLED,
        imgproc::LINE_8,
        &core::no_array(),
        i32::MAX,
        Point::default(),
    )?;
    let mut isolated = Mat::new_rows_cols_with_default(
        img.rows(),
        img.cols(),
        core::CV_8UC3,
        Scalar::all(0.0),
    )?;
    img.copy_to_masked(&mut isolated, &region_mask)?;

    let mut corners = [Point2f::default(); 4];
    rect.points(&mut corners)?;
    let src: Vector<Point2f> = Vector::from_iter(corners);
    let dst: Vector<Point2f> = Vector::from_iter([
        Point2f::new(0.0, (height - 1) as f32),
        Point2f::new(0.0, 0.0),
        Point2f::new((width - 1) as f32, 0.0),
        Point2f::new((width - 1) as f32, (height - 1) as f32),
    ]);
    let transform = imgproc::get_perspective_transform(&src, &dst, core::DECOMP_LU)?;
    let mut ear = Mat::default();
    imgproc::warp_perspective_def(&isolated, &mut ear, &transform, Size::new(width, height))?;

    if ear.cols() > ear.rows() {
        let mut upright = Mat::default();
        core::rotate(&ear, &mut upright, core::ROTATE_90_COUNTERCLOCKWISE)?;
        ear = upright;
    }
    Ok(ear)
}

/// Strips silk strands from the mask by opening with a growing kernel until
/// the convexity jumps by `min_delta` over the baseline.
fn clean_silks(mask: &Mat, ear_index: usize, silk: Option<&SilkParams>) -> Result<Mat> {
    let baseline = mask_convexity(mask)?;
    debug!("[SILK] ear #{}: convexity {:.3}", ear_index, baseline);

    let params = match silk {
        Some(params) => *params,
        None if baseline < SILK_TRIGGER_CONVEXITY => {
            info!(
                "[SILK] ear #{}: convexity {:.3} below {} triggered silk clean-up",
                ear_index, baseline, SILK_TRIGGER_CONVEXITY
            );
            SilkParams::default()
        }
        None => return mask.try_clone().map_err(Into::into),
    };

    let mut cleaned = mask.try_clone()?;
    let mut i = 1;
    loop {
        let convexity = mask_convexity(&cleaned)?;
        let delta = convexity - baseline;
        if delta >= params.min_delta || i > params.max_iterations as i32 {
            info!(
                "[SILK] ear #{}: convexity {:.3}, delta {:.3} after {} iteration(s)",
                ear_index,
                convexity,
                delta,
                i - 1
            );
            break;
        }
        cleaned = utils::morph(&cleaned, imgproc::MORPH_OPEN, 2 + i, 1 + i)?;
        i += 1;
    }
    Ok(utils::keep_largest_component(&cleaned)?)
}

/// Hull perimeter over contour perimeter of the mask's largest blob.
fn mask_convexity(mask: &Mat) -> Result<f64> {
    let mut contours = Vector::<Vector<Point>>::new();
    imgproc::find_contours_def(
        mask,
        &mut contours,
        imgproc::RETR_EXTERNAL,
        imgproc::CHAIN_APPROX_NONE,
    )?;
    let mut best: Option<(f64, Vector<Point>)> = None;
    for c in contours {
        let area = imgproc::contour_area_def(&c)?;
        if best.as_ref().is_none_or(|(a, _)| area > *a) {
            best = Some((area, c));
        }
    }
    let Some((_, contour)) = best else {
        return Ok(1.0);
    };
    let perimeter = imgproc::arc_length(&contour, true)?;
    if perimeter <= 0.0 {
        return Ok(1.0);
    }
    let mut hull = Vector::<Point>::new();
    imgproc::convex_hull(&contour, &mut hull, false, true)?;
    Ok(imgproc::arc_length(&hull, true)? / perimeter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locator::{LocatorParams, locate};

    fn image_with_ear() -> Mat {
        let mut img =
            Mat::new_rows_cols_with_default(800, 1200, core::CV_8UC3, Scalar::all(0.0)).unwrap();
        // lying horizontally, wider toward the right: tip on the left
        imgproc::ellipse(
            &mut img,
            Point::new(600, 400),
            Size::new(150, 60),
            0.0,
            0.0,
            360.0,
            Scalar::new(60.0, 170.0, 230.0, 0.0),
            imgproc::FILLED,
            imgproc::LINE_8,
            0,
        )
        .unwrap();
        img
    }

    fn relaxed() -> LocatorParams {
        LocatorParams { max_solidity: 1.01, min_area_frac: 0.005, ..Default::default() }
    }

    #[test]
    fn test_extract_turns_major_axis_vertical() {
        let img = image_with_ear();
        let regions = locate(&img, &relaxed()).unwrap();
        assert_eq!(regions.len(), 1);
        let roi = extract(&img, &regions[0], None).unwrap();
        assert!(roi.image.rows() > roi.image.cols());
        assert_eq!(roi.image.rows(), roi.mask.rows());
        assert_eq!(roi.image.cols(), roi.mask.cols());
        assert!(core::count_non_zero(&roi.mask).unwrap() > 0);
    }

    #[test]
    fn test_mask_convexity_of_solid_block() {
        let mut mask =
            Mat::new_rows_cols_with_default(100, 100, core::CV_8UC1, Scalar::all(0.0)).unwrap();
        imgproc::rectangle(
            &mut mask,
            core::Rect::new(20, 20, 60, 60),
            Scalar::all(255.0),
            imgproc::FILLED,
            imgproc::LINE_8,
            0,
        )
        .unwrap();
        let c = mask_convexity(&mask).unwrap();
        assert!(c > 0.95 && c <= 1.0 + 1e-9);
    }

    #[test]
    fn test_clean_silks_removes_thin_strand() {
        let mut mask =
            Mat::new_rows_cols_with_default(300, 200, core::CV_8UC1, Scalar::all(0.0)).unwrap();
        imgproc::rectangle(
            &mut mask,
            core::Rect::new(50, 50, 100, 200),
            Scalar::all(255.0),
            imgproc::FILLED,
            imgproc::LINE_8,
            0,
        )
        .unwrap();
        // thin silk strand poking out of the body
        imgproc::rectangle(
            &mut mask,
            core::Rect::new(150, 60, 45, 2),
            Scalar::all(255.0),
            imgproc::FILLED,
            imgproc::LINE_8,
            0,
        )
        .unwrap();
        let params = SilkParams { min_delta: 0.01, max_iterations: 10 };
        let cleaned = clean_silks(&mask, 1, Some(&params)).unwrap();
        assert_eq!(*cleaned.at_2d::<u8>(61, 190).unwrap(), 0);
        assert_eq!(*cleaned.at_2d::<u8>(150, 100).unwrap(), 255);
    }
}
