use std::path::PathBuf;
use std::sync::Arc;

use biddr::service::setup_tracing;
use biddr::{AppResult, BiddrConfig, Daemon, MemoryStore};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use tokio::runtime;

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Command {
    /// print the effective configuration and exit
    PrintConfig,
}

fn main() -> AppResult<()> {
    dotenv().ok();

    let commandline: CommandLine = CommandLine::parse();
    let config_path = commandline.conf.as_ref().map_or_else(
        || {
            let mut path = PathBuf::from("./");
            path.push("biddrd.toml");
            path
        },
        PathBuf::from,
    );
    let config = BiddrConfig::set_up_config(config_path)?;

    if let Some(Command::PrintConfig) = commandline.command {
        print!("{}", config.describe());
        return Ok(());
    }

    let _log_guard = setup_tracing(config.log.dir.as_deref(), commandline.verbose)?;

    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    let daemon = Daemon::new(config, Arc::new(MemoryStore::new()));
    daemon.start(&rt)
}
