//! Command-line invocation

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "kiln-daemon")]
#[command(about = "Kiln GPU host daemon", long_about = None)]
pub struct Cli {
    /// Without a command the daemon starts normally
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Second pass of a code update, run by the freshly built daemon
    Update {
        /// Revision to move to; latest branch head when omitted
        target_version: Option<String>,
    },
    /// Short-lived placeholder kept alive while an update hands off
    Sleep,
}
