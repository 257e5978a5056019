use std::path::Path;

use anyhow::Result;
use log::{info, warn};
use opencv::core::Mat;
use rayon::prelude::*;

use crate::config::{Opts, PipelineOptions};
use crate::features::{ColorStats, FeatureRecord};
use crate::ingest::{self, Calibration};
use crate::locator::{self, EarRegion, LocatorParams};
use crate::proof::ProofSink;
use crate::roi::{self, SilkParams};
use crate::subregion::{self, SegParams};
use crate::table::FeatureTable;
use crate::{geometry, utils};

/// The whole analysis chain for one or many images, configured once from the
/// command line. Ears within an image run in parallel; rows come out in
/// left-to-right ear order regardless.
pub struct Pipeline {
    calibration: Calibration,
    locator: LocatorParams,
    silk: Option<SilkParams>,
    tip: Option<SegParams>,
    bottom: Option<SegParams>,
    slices: usize,
    id: Option<String>,
    debug: bool,
    proofs: ProofSink,
    table: FeatureTable,
    save: bool,
}

impl Pipeline {
    pub fn new(opts: &Opts, pipeline: &PipelineOptions) -> Result<Self> {
        let save = !opts.no_save;
        let proofs = if save && !opts.no_proof || opts.debug {
            ProofSink::new(&opts.outdir, save && !opts.no_proof, opts.debug)?
        } else {
            ProofSink::disabled()
        };
        Ok(Self {
            calibration: pipeline.calibration()?,
            locator: pipeline.locator_params(),
            silk: pipeline.silk_params(),
            tip: pipeline.tip_params(),
            bottom: pipeline.bottom_params(),
            slices: pipeline.slices,
            id: pipeline.id.clone(),
            debug: opts.debug,
            proofs,
            table: FeatureTable::new(&opts.outdir),
            save,
        })
    }

    pub fn records(&self) -> &[FeatureRecord] {
        self.table.records()
    }

    /// Runs the full chain on one image and flushes its rows to the table.
    /// Returns the number of ears found.
    pub fn process_image(&mut self, path: &Path) -> Result<usize> {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_string());
        let identity = self.id.clone().unwrap_or_else(|| {
            path.file_name().map(|s| s.to_string_lossy().into_owned()).unwrap_or(stem.clone())
        });

        let img = ingest::load(path, &self.calibration)?;
        let regions = locator::locate(&img, &self.locator)?;
        info!("[FOUND] {}: {} ear(s)", identity, regions.len());

        if self.debug {
            utils::imshow(&format!("{stem} input"), &img)?;
        }
        self.proofs.whole_image(&stem, &img, &regions)?;

        let records: Vec<FeatureRecord> = regions
            .par_iter()
            .map(|region| self.process_ear(&img, region, &stem, &identity))
            .collect();
        let count = records.len();
        for record in records {
            self.table.push(record);
        }
        if self.save {
            self.table.flush()?;
        }
        Ok(count)
    }

    /// Measures one ear. Failures degrade to a mostly-empty row instead of
    /// dropping the ear or the image.
    fn process_ear(&self, img: &Mat, region: &EarRegion, stem: &str, identity: &str) -> FeatureRecord {
        match self.measure_ear(img, region, stem, identity) {
            Ok(record) => record,
            Err(e) => {
                warn!("[EAR] {} ear #{}: {:#}", identity, region.index, e);
                FeatureRecord::empty(identity, region.index)
            }
        }
    }

    fn measure_ear(
        &self,
        img: &Mat,
        region: &EarRegion,
        stem: &str,
        identity: &str,
    ) -> Result<FeatureRecord> {
        let roi = roi::extract(img, region, self.silk.as_ref())?;
        self.proofs.ear_roi(stem, &roi, region.index)?;

        if self.debug {
            utils::imshow(&format!("{stem} ear {} mask", region.index), &roi.mask)?;
        }

        let built = geometry::build(&roi.mask, self.slices)?;
        if built.is_none() {
            warn!("[EAR] {} ear #{}: degenerate mask, geometry skipped", identity, region.index);
        }
        let (model, descriptors) = match built {
            Some((model, d)) => (Some(model), Some(d)),
            None => (None, None),
        };

        let regions =
            subregion::segment(&roi.image, &roi.mask, region.index, self.tip.as_ref(), self.bottom.as_ref())?;
        // color averages come from the kernel band when it is known, so cob
        // and shank pixels do not dilute them
        let color_mask = regions
            .as_ref()
            .and_then(|r| r.kernel.as_ref())
            .map_or(&roi.mask, |kernel| &kernel.mask);
        let colors = ColorStats::measure(&roi.image, color_mask)?;

        self.proofs.ear_features(stem, &roi, model.as_ref(), regions.as_ref(), region.index)?;

        Ok(FeatureRecord::aggregate(
            identity,
            region.index,
            descriptors.as_ref(),
            regions.as_ref(),
            Some(&colors),
            self.calibration.ppm,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SubCommand;
    use clap::Parser;
    use opencv::core::{self, Point, Scalar, Size};
    use opencv::imgproc;

    fn write_sample(dir: &Path) -> std::path::PathBuf {
        let mut img =
            Mat::new_rows_cols_with_default(600, 900, core::CV_8UC3, Scalar::all(0.0)).unwrap();
        for cx in [300, 600] {
            imgproc::ellipse(
                &mut img,
                Point::new(cx, 300),
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
        }
        let path = dir.join("two_ears.png");
        utils::imwrite(&path.to_string_lossy(), &img).unwrap();
        path
    }

    fn pipeline_for(dir: &Path, no_save: bool) -> Pipeline {
        let mut args = vec![
            "earcv".to_string(),
            "-o".to_string(),
            dir.to_string_lossy().into_owned(),
            "--no_proof".to_string(),
        ];
        if no_save {
            args.push("--no_save".to_string());
        }
        args.extend(
            ["analyze", "-i", "x.png", "--filter", "0.5", "90", "0.7", "1.1"]
                .map(str::to_string),
        );
        let opts = Opts::parse_from(args);
        let SubCommand::Analyze(cmd) = &opts.subcmd else { unreachable!() };
        Pipeline::new(&opts, &cmd.pipeline).unwrap()
    }

    #[test]
    fn test_two_ears_two_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sample(dir.path());
        let mut pipeline = pipeline_for(dir.path(), false);
        let count = pipeline.process_image(&path).unwrap();
        assert_eq!(count, 2);
        assert_eq!(pipeline.records().len(), 2);
        assert_eq!(pipeline.records()[0].ear_number, 1);
        assert_eq!(pipeline.records()[1].ear_number, 2);
        assert!(pipeline.records()[0].ear_area.unwrap() > 0.0);
        assert!(dir.path().join("features.csv").exists());
    }

    #[test]
    fn test_no_save_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sample(dir.path());
        let mut pipeline = pipeline_for(dir.path(), true);
        pipeline.process_image(&path).unwrap();
        assert!(!dir.path().join("features.csv").exists());
        assert!(!dir.path().join("01_Proofs").exists());
    }

    #[test]
    fn test_rerun_reproduces_identical_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sample(dir.path());
        let mut first = pipeline_for(dir.path(), true);
        first.process_image(&path).unwrap();
        let mut second = pipeline_for(dir.path(), true);
        second.process_image(&path).unwrap();
        let a = serde_json::to_string(first.records()).unwrap();
        let b = serde_json::to_string(second.records()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = pipeline_for(dir.path(), false);
        assert!(pipeline.process_image(Path::new("absent.png")).is_err());
    }
}
