use anyhow::Result;
use opencv::core::{self, Mat};
use opencv::imgproc;
use serde::Serialize;

use crate::geometry::GeometryDescriptors;
use crate::subregion::SubRegions;

/// Mean color of the ear surface in three spaces.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ColorStats {
    pub blue: f64,
    pub green: f64,
    pub red: f64,
    pub hue: f64,
    pub sat: f64,
    pub vol: f64,
    pub light: f64,
    pub a_chnnl: f64,
    pub b_chnnl: f64,
}

impl ColorStats {
    /// Averages the masked pixels of the BGR crop in BGR, HSV and Lab.
    pub fn measure(ear: &Mat, mask: &Mat) -> Result<Self> {
        let bgr = core::mean(ear, mask)?;
        let mut hsv = Mat::default();
        imgproc::cvt_color_def(ear, &mut hsv, imgproc::COLOR_BGR2HSV)?;
        let hsv = core::mean(&hsv, mask)?;
        let mut lab = Mat::default();
        imgproc::cvt_color_def(ear, &mut lab, imgproc::COLOR_BGR2Lab)?;
        let lab = core::mean(&lab, mask)?;
        Ok(Self {
            blue: bgr[0],
            green: bgr[1],
            red: bgr[2],
            hue: hsv[0],
            sat: hsv[1],
            vol: hsv[2],
            light: lab[0],
            a_chnnl: lab[1],
            b_chnnl: lab[2],
        })
    }
}

/// One row of the feature table. Measurements that could not be taken stay
/// `None` and serialize as empty cells, never as zero.
#[derive(Debug, Clone, Serialize)]
pub struct FeatureRecord {
    pub filename: String,
    pub ear_number: usize,
    pub ear_area: Option<f64>,
    pub ear_box_area: Option<f64>,
    pub ear_box_length: Option<f64>,
    pub ear_box_width: Option<f64>,
    pub max_width: Option<f64>,
    pub perimeter: Option<f64>,
    pub convexity: Option<f64>,
    pub solidity: Option<f64>,
    pub convexity_poly_dp: Option<f64>,
    pub taper: Option<f64>,
    pub taper_convexity: Option<f64>,
    pub taper_solidity: Option<f64>,
    pub taper_convexity_poly_dp: Option<f64>,
    pub widths_sdev: Option<f64>,
    pub cents_sdev: Option<f64>,
    pub tip_area: Option<f64>,
    pub bottom_area: Option<f64>,
    pub krnl_area: Option<f64>,
    pub kernel_length: Option<f64>,
    pub krnl_convexity: Option<f64>,
    pub tip_fill: Option<f64>,
    pub bottom_fill: Option<f64>,
    pub krnl_fill: Option<f64>,
    pub blue: Option<f64>,
    pub green: Option<f64>,
    pub red: Option<f64>,
    pub hue: Option<f64>,
    pub sat: Option<f64>,
    pub vol: Option<f64>,
    pub light: Option<f64>,
    pub a_chnnl: Option<f64>,
    pub b_chnnl: Option<f64>,
}

impl FeatureRecord {
    /// A row with only identity filled in, for ears whose analysis failed.
    pub fn empty(identity: &str, ear_number: usize) -> Self {
        Self::aggregate(identity, ear_number, None, None, None, None)
    }

    /// Assembles one row. `ppm` (pixels per metric unit) rescales lengths
    /// and areas; dimensionless ratios stay as computed.
    pub fn aggregate(
        identity: &str,
        ear_number: usize,
        geometry: Option<&GeometryDescriptors>,
        regions: Option<&SubRegions>,
        colors: Option<&ColorStats>,
        ppm: Option<f64>,
    ) -> Self {
        let scale = ppm.unwrap_or(1.0);
        let len = |v: f64| Some(v / scale);
        let area = |v: f64| Some(v / (scale * scale));

        let mut record = Self {
            filename: identity.to_string(),
            ear_number,
            ear_area: None,
            ear_box_area: None,
            ear_box_length: None,
            ear_box_width: None,
            max_width: None,
            perimeter: None,
            convexity: None,
            solidity: None,
            convexity_poly_dp: None,
            taper: None,
            taper_convexity: None,
            taper_solidity: None,
            taper_convexity_poly_dp: None,
            widths_sdev: None,
            cents_sdev: None,
            tip_area: None,
            bottom_area: None,
            krnl_area: None,
            kernel_length: None,
            krnl_convexity: None,
            tip_fill: None,
            bottom_fill: None,
            krnl_fill: None,
            blue: None,
            green: None,
            red: None,
            hue: None,
            sat: None,
            vol: None,
            light: None,
            a_chnnl: None,
            b_chnnl: None,
        };

        if let Some(g) = geometry {
            record.ear_area = area(g.area);
            record.ear_box_area = area(g.box_area);
            record.ear_box_length = len(g.box_length);
            record.ear_box_width = len(g.box_width);
            record.max_width = len(g.max_width);
            record.perimeter = len(g.perimeter);
            record.convexity = Some(g.convexity);
            record.solidity = Some(g.solidity);
            record.convexity_poly_dp = Some(g.convexity_poly_dp);
            record.taper = len(g.taper);
            record.taper_convexity = g.taper_convexity;
            record.taper_solidity = g.taper_solidity;
            record.taper_convexity_poly_dp = g.taper_convexity_poly_dp;
            record.widths_sdev = len(g.widths_sdev);
            record.cents_sdev = len(g.cents_sdev);
        }
        if let Some(r) = regions {
            record.tip_area = r.tip.as_ref().and_then(|t| area(t.area));
            record.bottom_area = r.bottom.as_ref().and_then(|b| area(b.area));
            record.krnl_area = r.kernel.as_ref().and_then(|k| area(k.area));
            record.kernel_length = r.kernel_length.and_then(len);
            record.krnl_convexity = r.kernel_convexity;
            record.tip_fill = r.tip.as_ref().map(|t| t.fill);
            record.bottom_fill = r.bottom.as_ref().map(|b| b.fill);
            record.krnl_fill = r.kernel.as_ref().map(|k| k.fill);
        }
        if let Some(c) = colors {
            record.blue = Some(c.blue);
            record.green = Some(c.green);
            record.red = Some(c.red);
            record.hue = Some(c.hue);
            record.sat = Some(c.sat);
            record.vol = Some(c.vol);
            record.light = Some(c.light);
            record.a_chnnl = Some(c.a_chnnl);
            record.b_chnnl = Some(c.b_chnnl);
        }
        record
    }
}
