use anyhow::Result;
use opencv::core::{self, Mat, Point, Point2f, Vector};
use opencv::imgproc;
use opencv::prelude::*;

use crate::utils;

/// Default number of cross-sections in a slice model.
pub const DEFAULT_SLICES: usize = 20;

/// One cross-section of an upright ear mask, perpendicular to the major axis.
#[derive(Debug, Clone, Copy)]
pub struct Slice {
    /// 0 at the tip end, increasing toward the shank.
    pub index: usize,
    pub centroid: Point2f,
    pub width: f64,
}

/// Ordered cross-sections sampled along the major axis of an upright mask.
#[derive(Debug, Clone)]
pub struct SliceModel {
    pub slices: Vec<Slice>,
}

impl SliceModel {
    /// Samples `n` evenly spaced rows across the foreground extent of an
    /// upright (major axis vertical) binary mask. Returns `None` when the
    /// mask holds no foreground.
    pub fn from_mask(mask: &Mat, n: usize) -> Result<Option<Self>> {
        let rows = mask.rows();
        let cols = mask.cols();
        if rows == 0 || cols == 0 || n == 0 || core::count_non_zero(mask)? == 0 {
            return Ok(None);
        }

        let mut top = None;
        let mut bottom = None;
        for y in 0..rows {
            if row_span(mask, y)?.is_some() {
                top.get_or_insert(y);
                bottom = Some(y);
            }
        }
        let (top, bottom) = (top.unwrap_or(0), bottom.unwrap_or(0));
        let span = (bottom - top + 1) as f64;

        let mut slices = Vec::with_capacity(n);
        for k in 0..n {
            let y = top + ((k as f64 + 0.5) * span / n as f64) as i32;
            let y = y.min(bottom);
            let slice = match row_span(mask, y)? {
                Some((left, right)) => Slice {
                    index: k,
                    centroid: Point2f::new((left + right) as f32 / 2.0, y as f32),
                    width: (right - left + 1) as f64,
                },
                None => Slice {
                    index: k,
                    centroid: Point2f::new(cols as f32 / 2.0, y as f32),
                    width: 0.0,
                },
            };
            slices.push(slice);
        }
        Ok(Some(Self { slices }))
    }

    pub fn widths(&self) -> Vec<f64> {
        self.slices.iter().map(|s| s.width).collect()
    }

    pub fn max_width(&self) -> f64 {
        self.widths().iter().cloned().fold(0.0, f64::max)
    }

    pub fn widths_sdev(&self) -> f64 {
        utils::stdev(&self.widths())
    }

    pub fn centroids_sdev(&self) -> f64 {
        let xs: Vec<f64> = self.slices.iter().map(|s| s.centroid.x as f64).collect();
        utils::stdev(&xs)
    }

    /// Width variability over the tip half of the ear.
    pub fn taper(&self) -> f64 {
        let half = &self.widths()[..self.slices.len() / 2];
        utils::stdev(half)
    }
}

/// Leftmost and rightmost foreground columns of one mask row.
fn row_span(mask: &Mat, y: i32) -> opencv::Result<Option<(i32, i32)>> {
    let mut left = None;
    let mut right = None;
    for x in 0..mask.cols() {
        if *mask.at_2d::<u8>(y, x)? > 0 {
            left.get_or_insert(x);
            right = Some(x);
        }
    }
    Ok(left.zip(right))
}

/// Shape descriptors of one ear, in pixels. Hull-based ratios are
/// dimensionless and fall in (0, 1] for simple contours.
#[derive(Debug, Clone, Copy)]
pub struct GeometryDescriptors {
    pub area: f64,
    pub box_area: f64,
    pub box_length: f64,
    pub box_width: f64,
    pub max_width: f64,
    pub perimeter: f64,
    pub convexity: f64,
    pub solidity: f64,
    pub convexity_poly_dp: f64,
    pub taper: f64,
    /// Hull ratios over the tip-ward half; missing when that half degenerates.
    pub taper_convexity: Option<f64>,
    pub taper_solidity: Option<f64>,
    pub taper_convexity_poly_dp: Option<f64>,
    pub widths_sdev: f64,
    pub cents_sdev: f64,
}

/// Hull-to-contour ratios: (convexity, solidity, convexity over a
/// Douglas-Peucker simplification). `None` for degenerate contours.
fn shape_ratios(contour: &Vector<Point>) -> Result<Option<(f64, f64, f64)>> {
    if contour.len() < 5 {
        return Ok(None);
    }
    let area = imgproc::contour_area_def(contour)?;
    let perimeter = imgproc::arc_length(contour, true)?;
    if area <= 1.0 || perimeter <= 0.0 {
        return Ok(None);
    }
    let mut hull = Vector::<Point>::new();
    imgproc::convex_hull(contour, &mut hull, false, true)?;
    let hull_area = imgproc::contour_area_def(&hull)?;
    let hull_perimeter = imgproc::arc_length(&hull, true)?;
    if hull_area <= 0.0 || hull_perimeter <= 0.0 {
        return Ok(None);
    }
    let mut simplified = Vector::<Point>::new();
    imgproc::approx_poly_dp(contour, &mut simplified, 0.01 * perimeter, true)?;
    let dp_perimeter = imgproc::arc_length(&simplified, true)?;
    let convexity_dp = if dp_perimeter > 0.0 { hull_perimeter / dp_perimeter } else { 0.0 };
    Ok(Some((hull_perimeter / perimeter, area / hull_area, convexity_dp)))
}

fn largest_contour(mask: &Mat) -> Result<Option<Vector<Point>>> {
    let mut contours = Vector::<Vector<Point>>::new();
    imgproc::find_contours_def(
        mask,
        &mut contours,
        imgproc::RETR_EXTERNAL,
        imgproc::CHAIN_APPROX_NONE,
    )?;
    let mut largest: Option<(f64, Vector<Point>)> = None;
    for c in contours {
        let area = imgproc::contour_area_def(&c)?;
        if largest.as_ref().is_none_or(|(a, _)| area > *a) {
            largest = Some((area, c));
        }
    }
    Ok(largest.map(|(_, c)| c))
}

/// Builds the slice model and all shape descriptors from an upright ear mask.
/// Pure function of the mask, deterministic. Degenerate masks yield `None`
/// and the ear is reported with missing geometry rather than dropped.
pub fn build(mask: &Mat, n: usize) -> Result<Option<(SliceModel, GeometryDescriptors)>> {
    let Some(contour) = largest_contour(mask)? else {
        return Ok(None);
    };
    let Some((convexity, solidity, convexity_poly_dp)) = shape_ratios(&contour)? else {
        return Ok(None);
    };
    let Some(model) = SliceModel::from_mask(mask, n)? else {
        return Ok(None);
    };

    let area = imgproc::contour_area_def(&contour)?;
    let perimeter = imgproc::arc_length(&contour, true)?;
    let bounds = imgproc::bounding_rect(&contour)?;

    // Tip-ward half of the mask, for the taper descriptors.
    let mid = bounds.y + bounds.height / 2;
    let mut top_half = mask.try_clone()?;
    utils::zero_band(
        &mut top_half,
        core::Rect::new(0, mid, mask.cols(), mask.rows() - mid),
    )?;
    let taper_ratios = match largest_contour(&top_half)? {
        Some(half_contour) => shape_ratios(&half_contour)?,
        None => None,
    };
    let (taper_convexity, taper_solidity, taper_convexity_poly_dp) = match taper_ratios {
        Some((c, s, dp)) => (Some(c), Some(s), Some(dp)),
        None => (None, None, None),
    };

    let descriptors = GeometryDescriptors {
        area,
        box_area: (bounds.width * bounds.height) as f64,
        box_length: bounds.height as f64,
        box_width: bounds.width as f64,
        max_width: model.max_width(),
        perimeter,
        convexity,
        solidity,
        convexity_poly_dp,
        taper: model.taper(),
        taper_convexity,
        taper_solidity,
        taper_convexity_poly_dp,
        widths_sdev: model.widths_sdev(),
        cents_sdev: model.centroids_sdev(),
    };
    Ok(Some((model, descriptors)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::{Rect, Scalar, Size};

    fn blank_mask(width: i32, height: i32) -> Mat {
        Mat::new_rows_cols_with_default(height, width, core::CV_8UC1, Scalar::all(0.0)).unwrap()
    }

    fn rect_mask(width: i32, height: i32, rect: Rect) -> Mat {
        let mut mask = blank_mask(width, height);
        imgproc::rectangle(&mut mask, rect, Scalar::all(255.0), imgproc::FILLED, imgproc::LINE_8, 0)
            .unwrap();
        mask
    }

    fn ellipse_mask(width: i32, height: i32, ax: i32, ay: i32) -> Mat {
        let mut mask = blank_mask(width, height);
        imgproc::ellipse(
            &mut mask,
            Point::new(width / 2, height / 2),
            Size::new(ax, ay),
            0.0,
            0.0,
            360.0,
            Scalar::all(255.0),
            imgproc::FILLED,
            imgproc::LINE_8,
            0,
        )
        .unwrap();
        mask
    }

    #[test]
    fn test_slice_count_is_exact() {
        for (w, h) in [(60, 200), (30, 90), (200, 400)] {
            let mask = ellipse_mask(w + 40, h + 40, w / 2, h / 2);
            let (model, _) = build(&mask, DEFAULT_SLICES).unwrap().unwrap();
            assert_eq!(model.slices.len(), DEFAULT_SLICES);
        }
    }

    #[test]
    fn test_slice_indices_increase_down_the_axis() {
        let mask = ellipse_mask(200, 400, 60, 150);
        let (model, _) = build(&mask, DEFAULT_SLICES).unwrap().unwrap();
        for pair in model.slices.windows(2) {
            assert!(pair[0].index < pair[1].index);
            assert!(pair[0].centroid.y < pair[1].centroid.y);
        }
    }

    #[test]
    fn test_rectangle_descriptors() {
        let mask = rect_mask(200, 400, Rect::new(50, 50, 100, 300));
        let (model, d) = build(&mask, DEFAULT_SLICES).unwrap().unwrap();
        assert!((d.box_width - 100.0).abs() <= 2.0);
        assert!((d.box_length - 300.0).abs() <= 2.0);
        assert!((d.max_width - 100.0).abs() <= 2.0);
        assert!(d.widths_sdev < 1.0);
        assert!(d.cents_sdev < 1.0);
        assert!(model.taper() < 1.0);
        // a rectangle is its own convex hull
        assert!(d.solidity > 0.95 && d.solidity <= 1.0);
        assert!(d.convexity > 0.95 && d.convexity <= 1.0);
    }

    #[test]
    fn test_ratios_in_unit_interval() {
        let mask = ellipse_mask(240, 400, 60, 150);
        let (_, d) = build(&mask, DEFAULT_SLICES).unwrap().unwrap();
        for v in [
            d.convexity,
            d.solidity,
            d.taper_convexity.unwrap(),
            d.taper_solidity.unwrap(),
        ] {
            assert!(v > 0.0 && v <= 1.0 + 1e-9, "ratio {v} outside (0, 1]");
        }
    }

    #[test]
    fn test_flat_mask_leaves_taper_ratios_missing() {
        // two rows tall: the tip-ward half collapses to a line
        let mask = rect_mask(200, 100, Rect::new(20, 50, 160, 2));
        let (_, d) = build(&mask, DEFAULT_SLICES).unwrap().unwrap();
        assert!(d.taper_convexity.is_none());
        assert!(d.taper_solidity.is_none());
        assert!(d.taper_convexity_poly_dp.is_none());
    }

    #[test]
    fn test_degenerate_mask_yields_none() {
        let mask = blank_mask(100, 100);
        assert!(build(&mask, DEFAULT_SLICES).unwrap().is_none());

        let dot = rect_mask(100, 100, Rect::new(50, 50, 1, 1));
        assert!(build(&dot, DEFAULT_SLICES).unwrap().is_none());
    }

    #[test]
    fn test_taper_reflects_narrow_tip() {
        // triangle-ish mask: wide at the bottom, narrow at the top
        let mut mask = blank_mask(200, 400);
        let pts: Vector<Vector<Point>> = Vector::from_iter([Vector::from_iter([
            Point::new(100, 20),
            Point::new(180, 380),
            Point::new(20, 380),
        ])]);
        imgproc::draw_contours(
            &mut mask,
            &pts,
            -1,
            Scalar::all(255.0),
            imgproc::FILLED,
            imgproc::LINE_8,
            &core::no_array(),
            i32::MAX,
            Point::default(),
        )
        .unwrap();
        let (model, d) = build(&mask, DEFAULT_SLICES).unwrap().unwrap();
        assert!(model.taper() > 5.0);
        assert!(d.taper > 5.0);
    }
}
