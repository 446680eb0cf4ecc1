use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser};
use tracing::error;

use wlosd::commands::parse_size;
use wlosd::{Options, logging};

#[derive(Parser)]
#[command(
    version,
    about = "On-screen display for Wayland, driven by commands on stdin",
    after_help = "Without --config, wlosd.toml is read from ~/.wlosd, $XDG_CONFIG_HOME/wlosd, \
                  ~/.config/wlosd or /etc/xdg/wlosd.\nType 'help' on stdin for the command list."
)]
struct Cli {
    /// Use the config file PATH.
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v warn, -vv info, -vvv debug).
    #[arg(short, action = ArgAction::Count)]
    verbose: u8,

    /// Draw into a virtual WxH output instead of connecting to a compositor.
    #[arg(long, value_name = "WxH", value_parser = parse_size)]
    headless: Option<(u32, u32)>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let options = Options {
        config: cli.config,
        headless: cli.headless,
    };
    match wlosd::run(options) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, source = ?std::error::Error::source(&e), "wlosd failed");
            eprintln!("wlosd: {e}");
            ExitCode::FAILURE
        }
    }
}
