use clap::{Parser, Subcommand};
use espburn::cli::{self, config::Config, logging::initialize_logger, ConnectArgs, FlashArgs};
use log::{debug, info, LevelFilter};
use miette::Result;

#[derive(Debug, Parser)]
#[clap(about, max_term_width = 100, propagate_version = true, version)]
struct Cli {
    #[clap(subcommand)]
    subcommand: Commands,

    /// Print debug output
    #[clap(short = 'v', long, global = true)]
    verbose: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Flash a raw binary image to a target device
    Flash(FlashArgs),
    /// Display information about the connected board (not implemented)
    Info(ConnectArgs),
    /// Open the serial monitor (not implemented)
    #[clap(alias = "mon")]
    Monitor(ConnectArgs),
}

fn main() -> Result<()> {
    miette::set_panic_hook();

    // Attempt to parse any provided comand-line arguments, or print the help
    // message and terminate if the invocation is not correct.
    let args = Cli::parse();

    initialize_logger(if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });
    debug!("{:#?}", args);

    // Load any user configuration, if present.
    let config = Config::load()?;

    match args.subcommand {
        Commands::Flash(args) => cli::flash(args, &config),
        Commands::Info(_) => {
            info!("`info` is accepted but does nothing yet");
            Ok(())
        }
        Commands::Monitor(_) => {
            info!("`monitor` is accepted but does nothing yet");
            Ok(())
        }
    }
}
