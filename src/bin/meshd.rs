//! The `meshd` daemon entrypoint: loads config, starts a `Runtime`, and
//! runs until `ctrl-c` or a signal-driven shutdown (spec.md §6).

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use meshcore::config::Config;
use meshcore::runtime::{exit_code, exit_code_for, Runtime};

#[derive(Parser)]
#[command(name = "meshd", about = "Offline BLE mesh messenger daemon")]
struct Cli {
    /// Path to the TOML config file. Individual keys can still be
    /// overridden with `MESHCORE_*` environment variables.
    #[arg(short, long, default_value = "meshcore.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::from_file_and_env(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("config error: {e}");
            return ExitCode::from(exit_code::CONFIG as u8);
        }
    };

    let runtime = match Runtime::start(config).await {
        Ok(r) => r,
        Err(e) => {
            eprintln!("startup failed: {e}");
            return ExitCode::from(exit_code_for(&e) as u8);
        }
    };

    runtime.run_until_shutdown().await;
    ExitCode::from(exit_code::OK as u8)
}
