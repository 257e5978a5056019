use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::debug;
use opencv::core::{self, Mat, Point, Scalar, Vector};
use opencv::imgproc;
use opencv::prelude::*;

use crate::geometry::SliceModel;
use crate::locator::EarRegion;
use crate::roi::EarRoi;
use crate::subregion::SubRegions;
use crate::utils;

const PROOF_DIR: &str = "01_Proofs";
const ROI_DIR: &str = "02_Ear_ROIs";
const EAR_PROOF_DIR: &str = "03_Ear_Proofs";

/// BGR palette cycled over ear numbers.
fn overlay_color(index: usize) -> Scalar {
    const COLORS: [(f64, f64, f64); 6] = [
        (80.0, 200.0, 80.0),
        (200.0, 120.0, 60.0),
        (60.0, 80.0, 220.0),
        (60.0, 200.0, 220.0),
        (200.0, 60.0, 200.0),
        (220.0, 220.0, 80.0),
    ];
    let (b, g, r) = COLORS[index % COLORS.len()];
    Scalar::new(b, g, r, 0.0)
}

/// Writes proof images under the output directory, and optionally pops them
/// up in a window. With saving and showing both off every call is a no-op.
#[derive(Debug, Clone)]
pub struct ProofSink {
    outdir: PathBuf,
    save: bool,
    show: bool,
}

impl ProofSink {
    pub fn new(outdir: &Path, save: bool, show: bool) -> Result<Self> {
        if save {
            for dir in [PROOF_DIR, ROI_DIR, EAR_PROOF_DIR] {
                let dir = outdir.join(dir);
                fs::create_dir_all(&dir)
                    .with_context(|| format!("cannot create {}", dir.display()))?;
            }
        }
        Ok(Self { outdir: outdir.to_path_buf(), save, show })
    }

    pub fn disabled() -> Self {
        Self { outdir: PathBuf::new(), save: false, show: false }
    }

    /// Full-frame proof: every accepted ear overlaid in its own color with
    /// its number at the centroid.
    pub fn whole_image(&self, stem: &str, img: &Mat, regions: &[EarRegion]) -> Result<()> {
        if !self.save && !self.show {
            return Ok(());
        }
        let mut overlay = img.try_clone()?;
        for region in regions {
            let color = overlay_color(region.index - 1);
            let one: Vector<Vector<Point>> = Vector::from_iter([region.contour.clone()]);
            imgproc::draw_contours(
                &mut overlay,
                &one,
                -1,
                color,
                imgproc::FILLED,
                imgproc::LINE_8,
                &core::no_array(),
                i32::MAX,
                Point::default(),
            )?;
            let anchor = Point::new(
                region.bounding.x + region.bounding.width / 2,
                region.bounding.y + region.bounding.height / 2,
            );
            imgproc::put_text_def(
                &mut overlay,
                &format!("#{}", region.index),
                anchor,
                imgproc::FONT_HERSHEY_SIMPLEX,
                2.0,
                Scalar::all(255.0),
            )?;
        }
        imgproc::put_text_def(
            &mut overlay,
            &format!("{}: {} ear(s)", stem, regions.len()),
            Point::new(20, 60),
            imgproc::FONT_HERSHEY_SIMPLEX,
            1.5,
            Scalar::new(80.0, 200.0, 80.0, 0.0),
        )?;
        self.emit(
            &self.outdir.join(PROOF_DIR).join(format!("{}_proof.png", stem)),
            &overlay,
        )
    }

    /// The upright, background-free crop of one ear.
    pub fn ear_roi(&self, stem: &str, roi: &EarRoi, ear_number: usize) -> Result<()> {
        if !self.save && !self.show {
            return Ok(());
        }
        self.emit(
            &self.outdir.join(ROI_DIR).join(format!("{}_ear_{}.png", stem, ear_number)),
            &roi.image,
        )
    }

    /// Side-by-side montage of the crop, its mask with the slice model drawn
    /// on top, and the sub-segmentation.
    pub fn ear_features(
        &self,
        stem: &str,
        roi: &EarRoi,
        model: Option<&SliceModel>,
        regions: Option<&SubRegions>,
        ear_number: usize,
    ) -> Result<()> {
        if !self.save && !self.show {
            return Ok(());
        }
        let mut panels: Vector<Mat> = Vector::new();
        panels.push(roi.image.try_clone()?);
        let mut mask_bgr = Mat::default();
        imgproc::cvt_color_def(&roi.mask, &mut mask_bgr, imgproc::COLOR_GRAY2BGR)?;
        if let Some(model) = model {
            for slice in &model.slices {
                let y = slice.centroid.y.round() as i32;
                let cx = slice.centroid.x.round() as i32;
                let half = (slice.width / 2.0).round() as i32;
                imgproc::line(
                    &mut mask_bgr,
                    Point::new(cx - half, y),
                    Point::new(cx + half, y),
                    overlay_color(2),
                    1,
                    imgproc::LINE_8,
                    0,
                )?;
                imgproc::circle(
                    &mut mask_bgr,
                    Point::new(cx, y),
                    2,
                    overlay_color(1),
                    imgproc::FILLED,
                    imgproc::LINE_8,
                    0,
                )?;
            }
        }
        panels.push(mask_bgr);
        if let Some(regions) = regions {
            let mut painted = Mat::new_rows_cols_with_default(
                roi.image.rows(),
                roi.image.cols(),
                core::CV_8UC3,
                Scalar::all(0.0),
            )?;
            let parts = [
                (regions.kernel.as_ref(), overlay_color(0)),
                (regions.tip.as_ref(), overlay_color(1)),
                (regions.bottom.as_ref(), overlay_color(2)),
            ];
            for (part, color) in parts {
                if let Some(part) = part {
                    painted.set_to(&color, &part.mask)?;
                }
            }
            panels.push(painted);
        }
        let mut montage = Mat::default();
        core::hconcat(&panels, &mut montage)?;
        self.emit(
            &self
                .outdir
                .join(EAR_PROOF_DIR)
                .join(format!("{}_ear_{}_proof.png", stem, ear_number)),
            &montage,
        )
    }

    fn emit(&self, path: &Path, img: &Mat) -> Result<()> {
        if self.save {
            utils::imwrite(&path.to_string_lossy(), img)?;
            debug!("[PROOF] wrote {}", path.display());
        }
        if self.show {
            let name = path.file_stem().map(|s| s.to_string_lossy().into_owned());
            utils::imshow(name.as_deref().unwrap_or("proof"), img)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locator::{LocatorParams, locate};
    use opencv::core::Size;

    fn sample_image() -> Mat {
        let mut img =
            Mat::new_rows_cols_with_default(600, 900, core::CV_8UC3, Scalar::all(0.0)).unwrap();
        imgproc::ellipse(
            &mut img,
            Point::new(450, 300),
            Size::new(60, 150),
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

    #[test]
    fn test_disabled_sink_writes_nothing() {
        let sink = ProofSink::disabled();
        let img = sample_image();
        sink.whole_image("sample", &img, &[]).unwrap();
    }

    #[test]
    fn test_whole_image_proof_written() {
        let dir = tempfile::tempdir().unwrap();
        let sink = ProofSink::new(dir.path(), true, false).unwrap();
        let img = sample_image();
        let params =
            LocatorParams { max_solidity: 1.01, min_area_frac: 0.005, ..Default::default() };
        let regions = locate(&img, &params).unwrap();
        sink.whole_image("sample", &img, &regions).unwrap();
        assert!(dir.path().join(PROOF_DIR).join("sample_proof.png").exists());
    }

    #[test]
    fn test_save_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        ProofSink::new(dir.path(), true, false).unwrap();
        for sub in [PROOF_DIR, ROI_DIR, EAR_PROOF_DIR] {
            assert!(dir.path().join(sub).is_dir());
        }
    }
}
