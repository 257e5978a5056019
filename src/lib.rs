pub mod cli;
pub mod config;
pub mod features;
pub mod geometry;
pub mod ingest;
pub mod locator;
pub mod pipeline;
pub mod proof;
pub mod roi;
pub mod subregion;
pub mod table;
pub mod utils;
