use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "stacker",
    about = "Paste a queue of prompts into an external app on a supervised timer",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the configured prompt queue
    ///
    /// While running, type a key and press enter on stdin:
    /// p = pause/resume, s = skip countdown, r = retry countdown,
    /// n = next prompt, c = cancel.
    Run {
        /// Skip the health watchdog even if enabled in config
        #[arg(long)]
        no_watchdog: bool,
    },

    /// Validate the configuration without running anything
    Check,

    /// Show the resolved configuration
    Config {
        /// Emit JSON instead of a human-readable summary
        #[arg(long)]
        json: bool,
    },
}
