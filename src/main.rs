use std::path::PathBuf;
use std::process::exit;

use clap::Parser;
use log::error;

use faims_mzxml::processor::FaimsToMzXmlProcessor;

/// Split a FAIMS Thermo acquisition into one mzXML file per compensation voltage
#[derive(Debug, Parser)]
#[command(author, version)]
struct Cli {
    /// The acquisition file to convert, or a wildcard pattern like `*.raw`
    input: String,
    /// Where to write the mzXML files. Defaults to the current directory
    #[arg(short, long)]
    output_directory: Option<PathBuf>,
    /// Increase diagnostic verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let args = Cli::parse();

    let level = match args.verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .format_timestamp_millis()
        .init();

    let mut processor = FaimsToMzXmlProcessor::new();
    match processor.process_files(&args.input, args.output_directory.as_deref()) {
        Ok(0) => {
            error!("No input files were processed");
            exit(1);
        }
        Ok(_) => {}
        Err(e) => {
            error!("{}", e);
            exit(1);
        }
    }
}
