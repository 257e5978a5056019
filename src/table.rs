use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::info;

use crate::features::FeatureRecord;

pub const CSV_HEADER: &str = "Filename,Ear Number,Ear_Area,Ear_Box_Area,Ear_Box_Length,\
Ear_Box_Width,Max_Width,perimeters,Convexity,Solidity,Convexity_polyDP,Taper,Taper_Convexity,\
Taper_Solidity,Taper_Convexity_polyDP,Widths_Sdev,Cents_Sdev,Tip_Area,Bottom_Area,Krnl_Area,\
Kernel_Length,Krnl_Convexity,Tip_Fill,Bottom_Fill,Krnl_Fill,Blue,Red,Green,Hue,Sat,Vol,Light,\
A_chnnl,B_chnnl";

/// Append-only feature table backed by `features.csv`. Rows accumulate in
/// memory and `flush` appends the unwritten tail, so a crash mid-batch loses
/// at most the image being processed.
#[derive(Debug)]
pub struct FeatureTable {
    path: PathBuf,
    records: Vec<FeatureRecord>,
    flushed: usize,
}

impl FeatureTable {
    pub fn new(outdir: &Path) -> Self {
        Self { path: outdir.join("features.csv"), records: Vec::new(), flushed: 0 }
    }

    pub fn push(&mut self, record: FeatureRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[FeatureRecord] {
        &self.records
    }

    /// Appends all unwritten rows, creating the file with its header first.
    pub fn flush(&mut self) -> Result<()> {
        if self.flushed == self.records.len() {
            return Ok(());
        }
        let new_file = !self.path.exists();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("cannot open {}", self.path.display()))?;
        if new_file {
            writeln!(file, "{}", CSV_HEADER)?;
        }
        for record in &self.records[self.flushed..] {
            writeln!(file, "{}", format_row(record))?;
        }
        info!(
            "[CSV] wrote {} row(s) to {}",
            self.records.len() - self.flushed,
            self.path.display()
        );
        self.flushed = self.records.len();
        Ok(())
    }
}

fn cell(value: Option<f64>) -> String {
    value.map(|v| format!("{:.3}", v)).unwrap_or_default()
}

/// CSV-escapes the identity field; everything else is numeric.
fn quote(field: &str) -> String {
    if field.contains([',', '"', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn format_row(r: &FeatureRecord) -> String {
    let cells = [
        cell(r.ear_area),
        cell(r.ear_box_area),
        cell(r.ear_box_length),
        cell(r.ear_box_width),
        cell(r.max_width),
        cell(r.perimeter),
        cell(r.convexity),
        cell(r.solidity),
        cell(r.convexity_poly_dp),
        cell(r.taper),
        cell(r.taper_convexity),
        cell(r.taper_solidity),
        cell(r.taper_convexity_poly_dp),
        cell(r.widths_sdev),
        cell(r.cents_sdev),
        cell(r.tip_area),
        cell(r.bottom_area),
        cell(r.krnl_area),
        cell(r.kernel_length),
        cell(r.krnl_convexity),
        cell(r.tip_fill),
        cell(r.bottom_fill),
        cell(r.krnl_fill),
        cell(r.blue),
        cell(r.red),
        cell(r.green),
        cell(r.hue),
        cell(r.sat),
        cell(r.vol),
        cell(r.light),
        cell(r.a_chnnl),
        cell(r.b_chnnl),
    ];
    format!("{},{},{}", quote(&r.filename), r.ear_number, cells.join(","))
}
