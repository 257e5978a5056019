use anyhow::Result;
use log::{debug, info, warn};
use opencv::core::{self, Mat, Point, Rect, Scalar, Vec4i, Vector};
use opencv::imgproc;
use opencv::prelude::*;

use crate::utils;

/// One located ear: its boundary contour in full-image coordinates, the
/// bounding rectangle and a stable 1-based index (left to right).
#[derive(Debug, Clone)]
pub struct EarRegion {
    pub index: usize,
    pub contour: Vector<Point>,
    pub bounding: Rect,
}

/// Segmentation tuning. Area bounds are fractions of the whole image; the
/// aspect ratio is short side over long side of the minimum-area rectangle.
#[derive(Debug, Clone, Copy)]
pub struct LocatorParams {
    pub min_area_frac: f64,
    pub max_area_frac: f64,
    pub min_aspect_ratio: f64,
    pub max_aspect_ratio: f64,
    pub max_solidity: f64,
    pub max_area_cov: f64,
    pub max_cleanup_iterations: usize,
    /// Concave waist depth, as a fraction of the blob's minor side, above
    /// which an oversized blob is treated as two touching ears.
    pub split_waist: f64,
}

impl Default for LocatorParams {
    fn default() -> Self {
        Self {
            min_area_frac: 0.010,
            max_area_frac: 0.100,
            min_aspect_ratio: 0.19,
            max_aspect_ratio: 0.6,
            max_solidity: 0.983,
            max_area_cov: 0.35,
            max_cleanup_iterations: 10,
            split_waist: 0.30,
        }
    }
}

/// Segments all ears in an image. Returns zero or more regions ordered left
/// to right; an empty result is a valid outcome, not an error.
pub fn locate(img: &Mat, params: &LocatorParams) -> Result<Vec<EarRegion>> {
    let img_area = (img.rows() * img.cols()) as f64;
    let min_area = img_area * params.min_area_frac;

    let mask = background_mask(img)?;
    let mask = utils::morph(&mask, imgproc::MORPH_OPEN, 3, 1)?;

    let mut candidates = candidates_above(&mask, min_area)?;
    candidates = cleanup(candidates, img.size()?, min_area, params)?;

    let mut accepted: Vec<Vector<Point>> = Vec::new();
    for contour in candidates {
        if passes_filter(&contour, img_area, params)? {
            accepted.push(contour);
            continue;
        }
        let waist = waist_depth_ratio(&contour)?;
        if waist > params.split_waist {
            let parts = watershed_split(img, &contour, min_area)?;
            if parts.len() >= 2 {
                info!("[EARS] split touching blob into {} ears (waist {:.2})", parts.len(), waist);
                accepted.extend(parts);
            } else {
                warn!(
                    "[EARS] ambiguous split: blob with waist {:.2} kept as one ear",
                    waist
                );
                accepted.push(contour);
            }
        } else {
            debug!("[EARS] skipping blob failing area/aspect/solidity filter");
        }
    }

    let mut regions = accepted
        .into_iter()
        .map(|contour| {
            let bounding = imgproc::bounding_rect(&contour)?;
            Ok(EarRegion { index: 0, contour, bounding })
        })
        .collect::<Result<Vec<_>>>()?;
    regions.sort_by_key(|r| r.bounding.x);
    for (i, region) in regions.iter_mut().enumerate() {
        region.index = i + 1;
    }

    if regions.is_empty() {
        info!("[EARS] no ears found");
    } else {
        info!("[EARS] found {} ear(s)", regions.len());
    }
    Ok(regions)
}

/// Foreground mask against a near-uniform background. Otsu on the red channel
/// combined with Otsu on HSV saturation tolerates lightness drift that a
/// single global cutoff would not; either mask is inverted when it covers the
/// majority of the frame, so light and dark backgrounds both work.
pub fn background_mask(img: &Mat) -> Result<Mat> {
    let red = utils::channel(img, 2)?;
    let (_, red_mask) = utils::otsu(&red)?;
    let red_mask = minority(red_mask)?;

    let mut hsv = Mat::default();
    imgproc::cvt_color_def(img, &mut hsv, imgproc::COLOR_BGR2HSV)?;
    let sat = utils::channel(&hsv, 1)?;
    let (_, sat_mask) = utils::otsu(&sat)?;
    let sat_mask = minority(sat_mask)?;

    let mut mask = Mat::default();
    core::bitwise_or_def(&red_mask, &sat_mask, &mut mask)?;
    Ok(mask)
}

/// Inverts a binary mask when its foreground covers more than half the frame.
fn minority(mask: Mat) -> Result<Mat> {
    let covered = core::count_non_zero(&mask)? as f64;
    if covered > (mask.rows() * mask.cols()) as f64 / 2.0 {
        let mut inverted = Mat::default();
        core::bitwise_not_def(&mask, &mut inverted)?;
        return Ok(inverted);
    }
    Ok(mask)
}

/// External contours above the debris threshold. Sub-threshold blobs are a
/// low-severity skip, not an error.
fn candidates_above(mask: &Mat, min_area: f64) -> Result<Vec<Vector<Point>>> {
    let mut contours = Vector::<Vector<Point>>::new();
    imgproc::find_contours_def(
        mask,
        &mut contours,
        imgproc::RETR_EXTERNAL,
        imgproc::CHAIN_APPROX_NONE,
    )?;
    let mut kept = Vec::new();
    for contour in contours {
        let area = imgproc::contour_area_def(&contour)?;
        if area < min_area {
            debug!("[EARS] skipping debris blob of {:.0} px", area);
            continue;
        }
        kept.push(contour);
    }
    Ok(kept)
}

/// Iterative clean-up: while the area coefficient of variation across the
/// candidates stays high, re-open the candidate mask with a growing kernel
/// and re-extract. Strips silk and debris fused to otherwise clean ears.
fn cleanup(
    mut candidates: Vec<Vector<Point>>,
    size: core::Size,
    min_area: f64,
    params: &LocatorParams,
) -> Result<Vec<Vector<Point>>> {
    let Some(mut cov) = area_cov(&candidates)? else {
        return Ok(candidates);
    };
    let mut i = 1;
    while cov > params.max_area_cov && i <= params.max_cleanup_iterations {
        info!(
            "[CLNUP] area COV {:.3} above {:.2}, clean-up iteration {}",
            cov, params.max_area_cov, i
        );
        let mask = mask_of(&candidates, size)?;
        let opened = utils::morph(&mask, imgproc::MORPH_OPEN, i as i32, i as i32)?;
        candidates = candidates_above(&opened, min_area)?;
        match area_cov(&candidates)? {
            Some(next) => cov = next,
            None => break,
        }
        i += 1;
    }
    Ok(candidates)
}

/// Coefficient of variation of candidate areas; undefined for fewer than two.
fn area_cov(candidates: &[Vector<Point>]) -> Result<Option<f64>> {
    if candidates.len() < 2 {
        return Ok(None);
    }
    let areas = candidates
        .iter()
        .map(|c| imgproc::contour_area_def(c))
        .collect::<opencv::Result<Vec<_>>>()?;
    let mean = utils::mean(&areas);
    if mean == 0.0 {
        return Ok(None);
    }
    Ok(Some(utils::stdev(&areas) / mean))
}

fn mask_of(contours: &[Vector<Point>], size: core::Size) -> Result<Mat> {
    let mut mask = Mat::new_rows_cols_with_default(size.height, size.width, core::CV_8UC1, Scalar::all(0.0))?;
    let all: Vector<Vector<Point>> = contours.iter().cloned().collect();
    imgproc::draw_contours(
        &mut mask,
        &all,
        -1,
        Scalar::all(255.0),
        imgproc::FILLED,
        imgproc::LINE_8,
        &core::no_array(),
        i32::MAX,
        Point::default(),
    )?;
    Ok(mask)
}

fn passes_filter(contour: &Vector<Point>, img_area: f64, params: &LocatorParams) -> Result<bool> {
    let area = imgproc::contour_area_def(contour)?;
    if area < img_area * params.min_area_frac || area > img_area * params.max_area_frac {
        return Ok(false);
    }
    let rect = imgproc::min_area_rect(contour)?;
    let (w, h) = (rect.size.width as f64, rect.size.height as f64);
    if w <= 0.0 || h <= 0.0 {
        return Ok(false);
    }
    let ratio = w.min(h) / w.max(h);
    if ratio <= params.min_aspect_ratio || ratio >= params.max_aspect_ratio {
        return Ok(false);
    }
    let mut hull = Vector::<Point>::new();
    imgproc::convex_hull(contour, &mut hull, false, true)?;
    let hull_area = imgproc::contour_area_def(&hull)?;
    if hull_area <= 0.0 {
        return Ok(false);
    }
    Ok(area / hull_area < params.max_solidity)
}

/// Depth of the deepest convexity defect relative to the blob's minor side.
/// Two ears joined at a narrow waist score high; a lone ear stays low.
fn waist_depth_ratio(contour: &Vector<Point>) -> Result<f64> {
    if contour.len() < 5 {
        return Ok(0.0);
    }
    let mut hull_idx = Vector::<i32>::new();
    imgproc::convex_hull(contour, &mut hull_idx, false, false)?;
    if hull_idx.len() < 3 {
        return Ok(0.0);
    }
    let mut defects = Vector::<Vec4i>::new();
    imgproc::convexity_defects(contour, &hull_idx, &mut defects)?;
    let max_depth = defects
        .iter()
        .map(|d| d[3] as f64 / 256.0)
        .fold(0.0f64, f64::max);
    let rect = imgproc::min_area_rect(contour)?;
    let minor = (rect.size.width as f64).min(rect.size.height as f64);
    if minor <= 0.0 {
        return Ok(0.0);
    }
    Ok(max_depth / minor)
}

/// Best-effort watershed separation of a merged blob. Seeds come from the
/// peaks of the distance transform; anything short of two confident parts
/// reports failure and the caller keeps the merged blob.
fn watershed_split(img: &Mat, contour: &Vector<Point>, min_area: f64) -> Result<Vec<Vector<Point>>> {
    let bounds = imgproc::bounding_rect(contour)?;
    let pad = 10;
    let roi_rect = Rect::new(
        (bounds.x - pad).max(0),
        (bounds.y - pad).max(0),
        (bounds.width + 2 * pad).min(img.cols() - (bounds.x - pad).max(0)),
        (bounds.height + 2 * pad).min(img.rows() - (bounds.y - pad).max(0)),
    );
    let roi = Mat::roi(img, roi_rect)?.try_clone()?;

    let mut mask = Mat::new_rows_cols_with_default(
        roi_rect.height,
        roi_rect.width,
        core::CV_8UC1,
        Scalar::all(0.0),
    )?;
    let one: Vector<Vector<Point>> = Vector::from_iter([contour.clone()]);
    imgproc::draw_contours(
        &mut mask,
        &one,
        -1,
        Scalar::all(255.0),
        imgproc::FILLED,
        imgproc::LINE_8,
        &core::no_array(),
        i32::MAX,
        Point::new(-roi_rect.x, -roi_rect.y),
    )?;

    let mut dist = Mat::default();
    imgproc::distance_transform_def(&mask, &mut dist, imgproc::DIST_L2, imgproc::DIST_MASK_5)?;
    let mut max_dist = 0.0;
    core::min_max_loc(&dist, None, Some(&mut max_dist), None, None, &core::no_array())?;
    if max_dist <= 0.0 {
        return Ok(vec![]);
    }

    let mut fg32 = Mat::default();
    imgproc::threshold(&dist, &mut fg32, 0.45 * max_dist, 255.0, imgproc::THRESH_BINARY)?;
    let mut sure_fg = Mat::default();
    fg32.convert_to(&mut sure_fg, core::CV_8U, 1.0, 0.0)?;
    let sure_bg = utils::morph(&mask, imgproc::MORPH_DILATE, 3, 3)?;
    let mut unknown = Mat::default();
    core::subtract(&sure_bg, &sure_fg, &mut unknown, &core::no_array(), -1)?;

    let mut labels = Mat::default();
    let seed_count = imgproc::connected_components(&sure_fg, &mut labels, 8, core::CV_32S)?;
    if seed_count < 3 {
        // fewer than two seeds, nothing to separate
        return Ok(vec![]);
    }

    let mut markers = Mat::default();
    core::add(&labels, &Scalar::all(1.0), &mut markers, &core::no_array(), -1)?;
    markers.set_to(&Scalar::all(0.0), &unknown)?;
    imgproc::watershed(&roi, &mut markers)?;

    let mut parts = Vec::new();
    for label in 2..=seed_count {
        let mut part_mask = Mat::default();
        core::compare(&markers, &Scalar::all(label as f64), &mut part_mask, core::CMP_EQ)?;
        let mut contours = Vector::<Vector<Point>>::new();
        imgproc::find_contours(
            &part_mask,
            &mut contours,
            imgproc::RETR_EXTERNAL,
            imgproc::CHAIN_APPROX_NONE,
            Point::new(roi_rect.x, roi_rect.y),
        )?;
        let mut largest: Option<(f64, Vector<Point>)> = None;
        for c in contours {
            let area = imgproc::contour_area_def(&c)?;
            if largest.as_ref().is_none_or(|(a, _)| area > *a) {
                largest = Some((area, c));
            }
        }
        if let Some((area, c)) = largest
            && area >= min_area.min(imgproc::contour_area_def(contour)? * 0.2)
        {
            parts.push(c);
        }
    }
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::Size;

    fn blank(width: i32, height: i32) -> Mat {
        Mat::new_rows_cols_with_default(height, width, core::CV_8UC3, Scalar::all(0.0)).unwrap()
    }

    fn draw_ear(img: &mut Mat, cx: i32, cy: i32, ax: i32, ay: i32) {
        imgproc::ellipse(
            img,
            Point::new(cx, cy),
            Size::new(ax, ay),
            0.0,
            0.0,
            360.0,
            Scalar::new(60.0, 170.0, 230.0, 0.0),
            imgproc::FILLED,
            imgproc::LINE_8,
            0,
        )
        .unwrap();
    }

    fn test_params() -> LocatorParams {
        // synthetic ellipses are near-perfectly solid, so relax the
        // surface-roughness cutoff used for real ears
        LocatorParams { max_solidity: 1.01, min_area_frac: 0.005, ..Default::default() }
    }

    #[test]
    fn test_empty_image_yields_no_ears() {
        let img = blank(1200, 800);
        let regions = locate(&img, &test_params()).unwrap();
        assert!(regions.is_empty());
    }

    #[test]
    fn test_two_ears_ordered_left_to_right() {
        let mut img = blank(1200, 800);
        draw_ear(&mut img, 300, 400, 60, 150);
        draw_ear(&mut img, 800, 400, 60, 150);
        let regions = locate(&img, &test_params()).unwrap();
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].index, 1);
        assert_eq!(regions[1].index, 2);
        assert!(regions[0].bounding.x < regions[1].bounding.x);
    }

    #[test]
    fn test_indexing_is_deterministic() {
        let mut img = blank(1200, 800);
        draw_ear(&mut img, 300, 400, 60, 150);
        draw_ear(&mut img, 800, 400, 60, 150);
        let a = locate(&img, &test_params()).unwrap();
        let b = locate(&img, &test_params()).unwrap();
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.index, y.index);
            assert_eq!(x.bounding, y.bounding);
            assert_eq!(x.contour.len(), y.contour.len());
        }
    }

    #[test]
    fn test_debris_below_min_area_is_dropped() {
        let mut img = blank(1200, 800);
        draw_ear(&mut img, 300, 400, 60, 150);
        draw_ear(&mut img, 900, 200, 6, 8);
        let regions = locate(&img, &test_params()).unwrap();
        assert_eq!(regions.len(), 1);
    }

    #[test]
    fn test_touching_ears_are_split() {
        let mut img = blank(1200, 800);
        draw_ear(&mut img, 500, 400, 60, 150);
        draw_ear(&mut img, 640, 400, 60, 150);
        // narrow bridge joining the two lobes at the waist
        imgproc::rectangle(
            &mut img,
            Rect::new(540, 390, 60, 20),
            Scalar::new(60.0, 170.0, 230.0, 0.0),
            imgproc::FILLED,
            imgproc::LINE_8,
            0,
        )
        .unwrap();
        let regions = locate(&img, &test_params()).unwrap();
        assert_eq!(regions.len(), 2);
        let (a, b) = (&regions[0].bounding, &regions[1].bounding);
        let overlap = (a.x + a.width).min(b.x + b.width) - a.x.max(b.x);
        assert!(overlap <= 1, "split ROIs overlap by {overlap} px");
    }

    #[test]
    fn test_waist_ratio_low_for_lone_ellipse() {
        let mut img = blank(600, 600);
        draw_ear(&mut img, 300, 300, 60, 150);
        let mask = background_mask(&img).unwrap();
        let candidates = candidates_above(&mask, 100.0).unwrap();
        assert_eq!(candidates.len(), 1);
        let waist = waist_depth_ratio(&candidates[0]).unwrap();
        assert!(waist < 0.2, "waist ratio {waist} unexpectedly deep");
    }
}
