use opencv::core::{self, Mat, Point, Rect, Scalar, Size, Vector};
use opencv::prelude::*;
use opencv::{highgui, imgcodecs, imgproc};

use indicatif::ProgressStyle;

/// Reads an image as 3-channel BGR. Fails on unreadable or empty files.
pub fn imread(filename: &str) -> anyhow::Result<Mat> {
    let img = imgcodecs::imread(filename, imgcodecs::IMREAD_COLOR)?;
    if img.empty() {
        anyhow::bail!("cannot decode image: {}", filename);
    }
    Ok(img)
}

pub fn imwrite(filename: &str, img: &impl core::ToInputArray) -> opencv::Result<bool> {
    let flags = Vector::<i32>::new();
    imgcodecs::imwrite(filename, img, &flags)
}

/// Shows an image in a resizable window for a few seconds.
pub fn imshow(winname: &str, mat: &impl core::ToInputArray) -> opencv::Result<()> {
    highgui::named_window(winname, highgui::WINDOW_NORMAL)?;
    highgui::resize_window(winname, 1000, 1000)?;
    highgui::imshow(winname, mat)?;
    highgui::wait_key(2000)?;
    highgui::destroy_all_windows()?;
    Ok(())
}

/// Extracts one channel of a multi-channel image.
pub fn channel(img: &Mat, index: usize) -> opencv::Result<Mat> {
    let mut channels = Vector::<Mat>::new();
    core::split(img, &mut channels)?;
    channels.get(index)
}

/// Otsu binarization, returning the chosen level and the binary mask.
pub fn otsu(src: &Mat) -> opencv::Result<(f64, Mat)> {
    let mut mask = Mat::default();
    let level = imgproc::threshold(
        src,
        &mut mask,
        0.0,
        255.0,
        imgproc::THRESH_BINARY | imgproc::THRESH_OTSU,
    )?;
    Ok((level, mask))
}

/// Otsu level computed over the masked pixels only, ignoring background zeros.
pub fn otsu_level_masked(src: &Mat, mask: &Mat) -> opencv::Result<f64> {
    let mut vals = Vec::new();
    for y in 0..src.rows() {
        for x in 0..src.cols() {
            if *mask.at_2d::<u8>(y, x)? > 0 {
                vals.push(*src.at_2d::<u8>(y, x)?);
            }
        }
    }
    if vals.is_empty() {
        return Ok(0.0);
    }
    let mut row =
        Mat::new_rows_cols_with_default(1, vals.len() as i32, core::CV_8UC1, Scalar::all(0.0))?;
    for (i, v) in vals.iter().enumerate() {
        *row.at_2d_mut::<u8>(0, i as i32)? = *v;
    }
    let mut out = Mat::default();
    imgproc::threshold(&row, &mut out, 0.0, 255.0, imgproc::THRESH_BINARY | imgproc::THRESH_OTSU)
}

/// Linear contrast stretch around mid-gray. `contrast` ranges over -127..=127, 0 is identity.
pub fn apply_contrast(src: &Mat, contrast: f64) -> opencv::Result<Mat> {
    if contrast == 0.0 {
        return src.try_clone();
    }
    let f = 131.0 * (contrast + 127.0) / (127.0 * (131.0 - contrast));
    let mut out = Mat::default();
    src.convert_to(&mut out, -1, f, 127.0 * (1.0 - f))?;
    Ok(out)
}

/// Keeps only the largest connected component of a binary mask.
pub fn keep_largest_component(mask: &Mat) -> opencv::Result<Mat> {
    let mut labels = Mat::default();
    let mut stats = Mat::default();
    let mut centroids = Mat::default();
    let count = imgproc::connected_components_with_stats(
        mask,
        &mut labels,
        &mut stats,
        &mut centroids,
        8,
        core::CV_32S,
    )?;
    if count < 2 {
        return mask.try_clone();
    }
    let mut best = (1, 0);
    for label in 1..count {
        let area = *stats.at_2d::<i32>(label, imgproc::CC_STAT_AREA)?;
        if area > best.1 {
            best = (label, area);
        }
    }
    let mut out = Mat::default();
    core::compare(&labels, &Scalar::all(best.0 as f64), &mut out, core::CMP_EQ)?;
    Ok(out)
}

/// Morphological operation with a square kernel, mirroring cv2.morphologyEx usage.
pub fn morph(src: &Mat, op: i32, ksize: i32, iterations: i32) -> opencv::Result<Mat> {
    let kernel =
        imgproc::get_structuring_element_def(imgproc::MORPH_RECT, Size::new(ksize, ksize))?;
    let mut out = Mat::default();
    imgproc::morphology_ex(
        src,
        &mut out,
        op,
        &kernel,
        Point::new(-1, -1),
        iterations,
        core::BORDER_CONSTANT,
        imgproc::morphology_default_border_value()?,
    )?;
    Ok(out)
}

/// Zeroes a rectangular band of a single-channel mask.
pub fn zero_band(mask: &mut Mat, rect: Rect) -> opencv::Result<()> {
    if rect.width <= 0 || rect.height <= 0 {
        return Ok(());
    }
    imgproc::rectangle(mask, rect, Scalar::all(0.0), imgproc::FILLED, imgproc::LINE_8, 0)
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation; 0 for fewer than two values.
pub fn stdev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

pub fn pb_style() -> ProgressStyle {
    ProgressStyle::with_template("{prefix} [{bar:40}] {pos}/{len} {msg}")
        .expect("bad progress bar template")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_and_stdev() {
        assert_eq!(mean(&[]), 0.0);
        assert_eq!(mean(&[2.0, 4.0]), 3.0);
        assert_eq!(stdev(&[5.0]), 0.0);
        let s = stdev(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert!((s - 2.138).abs() < 0.01);
    }

    #[test]
    fn test_keep_largest_component() {
        let mut mask =
            Mat::new_rows_cols_with_default(100, 100, core::CV_8UC1, Scalar::all(0.0)).unwrap();
        imgproc::rectangle(
            &mut mask,
            Rect::new(5, 5, 30, 30),
            Scalar::all(255.0),
            imgproc::FILLED,
            imgproc::LINE_8,
            0,
        )
        .unwrap();
        imgproc::rectangle(
            &mut mask,
            Rect::new(70, 70, 5, 5),
            Scalar::all(255.0),
            imgproc::FILLED,
            imgproc::LINE_8,
            0,
        )
        .unwrap();
        let out = keep_largest_component(&mask).unwrap();
        assert_eq!(*out.at_2d::<u8>(10, 10).unwrap(), 255);
        assert_eq!(*out.at_2d::<u8>(72, 72).unwrap(), 0);
    }

    #[test]
    fn test_apply_contrast_identity() {
        let src = Mat::new_rows_cols_with_default(4, 4, core::CV_8UC1, Scalar::all(90.0)).unwrap();
        let out = apply_contrast(&src, 0.0).unwrap();
        assert_eq!(*out.at_2d::<u8>(0, 0).unwrap(), 90);
    }

    #[test]
    fn test_otsu_splits_bimodal() {
        let mut src =
            Mat::new_rows_cols_with_default(10, 10, core::CV_8UC1, Scalar::all(20.0)).unwrap();
        imgproc::rectangle(
            &mut src,
            Rect::new(0, 0, 10, 5),
            Scalar::all(220.0),
            imgproc::FILLED,
            imgproc::LINE_8,
            0,
        )
        .unwrap();
        let (level, mask) = otsu(&src).unwrap();
        assert!(level > 20.0 && level < 220.0);
        assert_eq!(*mask.at_2d::<u8>(0, 0).unwrap(), 255);
        assert_eq!(*mask.at_2d::<u8>(9, 9).unwrap(), 0);
    }
}
