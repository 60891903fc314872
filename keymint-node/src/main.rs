//! The keymint node: configuration, wiring, HTTP server, and schedulers.

use std::process::ExitCode;

use keymint_common::config::Config;
use keymint_common::logger;
use tracing::error;

mod cli;
mod run;
mod server;

fn main() -> ExitCode {
    let args: cli::Args = argh::from_env();

    if let Some(env_file) = &args.env_file {
        if let Err(err) = dotenvy::from_path(env_file) {
            eprintln!("Could not load env file {}: {err}", env_file.display());
            return ExitCode::FAILURE;
        }
    } else {
        // Best-effort `.env` in the working directory (dev convenience).
        let _ = dotenvy::dotenv();
    }

    logger::init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(fatal) => {
            // The report names every missing/invalid variable at once.
            eprintln!("{fatal}");
            return ExitCode::FAILURE;
        }
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build tokio runtime");

    match runtime.block_on(run::run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("Node exited with error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
