use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser as ClapParser;
use log::error;

use bvm::{VmError, VmLimits};

/// Run a compiled bytecode image to completion.
#[derive(ClapParser, Debug)]
#[command(version, about)]
struct Cli {
    /// Path to the program image to execute.
    image: PathBuf,

    /// Raise diagnostic verbosity (-v info, -vv debug). Overridden by RUST_LOG.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Stop after this many interpreter steps instead of running unbounded.
    #[arg(long)]
    max_steps: Option<u64>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<(), VmError> {
    let code = std::fs::read(&cli.image).map_err(|source| VmError::ImageRead {
        path: cli.image.clone(),
        source,
    })?;
    if code.len() < 4 {
        return Err(VmError::ImageTooShort);
    }

    let mut vm = bvm::Vm::new(code, VmLimits::default()).map_err(|source| VmError::ImageRead {
        path: cli.image.clone(),
        source,
    })?;
    vm.run_bounded(cli.max_steps)
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();
}
