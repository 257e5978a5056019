mod analyze;
mod batch;

pub use analyze::*;
pub use batch::*;

use crate::config::Opts;

pub trait SubCommandExtend {
    fn run(&self, opts: &Opts) -> anyhow::Result<()>;
}
