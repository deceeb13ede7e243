use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use wlmd::app::{self, Invocation};
use wlmd::config::Config;
use wlmd::logging;

#[derive(Parser, Debug)]
#[command(name = "wlmd", version)]
#[command(about = "Winlogon manager daemon")]
#[command(disable_help_flag = true)]
struct Cli {
    /// Run under the service manager instead of as a console instance
    #[arg(long)]
    service: bool,

    /// Path to configuration (wlmd.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Command keyword, passed through as-is (see `wlmd --help`)
    #[arg(allow_hyphen_values = true)]
    command: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(exit) => exit.into(),
        Err(err) => {
            error!("{:#}", err);
            eprintln!("wlmd: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<app::Exit> {
    let config_path = Config::locate(cli.config.as_deref());
    let config = Config::load(config_path.as_deref())?;
    logging::init(&config.log, cli.debug).context("failed to open log file")?;

    info!(
        "{}",
        wlm_build_info::banner(&config.service.display_name, env!("CARGO_PKG_VERSION"))
    );

    let invocation = Invocation {
        service_mode: cli.service,
        command: cli.command,
        config_path,
    };
    app::run(&config, invocation).await
}
