use std::fs::{self, File};
use std::io::{self, Write};

use clap::Parser;
use env_logger::Target;
use log::error;

use earcv::cli::SubCommandExtend;
use earcv::config::{Opts, SubCommand};

/// Mirrors log output to `EarCV.log` next to the other artifacts.
struct Tee {
    file: File,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        self.file.flush()
    }
}

fn init_logging(opts: &Opts) -> anyhow::Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if !opts.no_save {
        fs::create_dir_all(&opts.outdir)?;
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(opts.outdir.join("EarCV.log"))?;
        builder.target(Target::Pipe(Box::new(Tee { file })));
    }
    builder.init();
    Ok(())
}

fn main() {
    let opts = Opts::parse();
    if let Err(e) = init_logging(&opts) {
        eprintln!("cannot set up logging: {:#}", e);
        std::process::exit(1);
    }

    let result = match &opts.subcmd {
        SubCommand::Analyze(cmd) => cmd.run(&opts),
        SubCommand::Batch(cmd) => cmd.run(&opts),
    };
    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
