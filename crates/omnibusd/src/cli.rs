use std::path::PathBuf;

use clap::Parser;

/// The omnibus message bus daemon.
///
/// Accepts connections on the configured addresses and routes messages
/// between them under the configured security policy.
#[derive(Debug, Parser)]
#[command(name = "omnibusd", version, about)]
pub struct Args {
    /// Path to the XML bus configuration file.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Listen on this address, overriding the configuration file. May be
    /// given multiple times.
    #[arg(long, value_name = "ADDRESS")]
    pub address: Vec<String>,

    /// Print the first bound address on stdout once listening.
    #[arg(long)]
    pub print_address: bool,

    /// Increase log verbosity; repeat for more.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}
