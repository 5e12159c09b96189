// Copyright 2025 Ragstone (https://github.com/ragstone)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use ragstone_server::config::ServerConfig;
use ragstone_server::{init_tracing, run_server, StartupError};

const EXIT_CONFIG_FAILURE: u8 = 1;
const EXIT_BIND_FAILURE: u8 = 2;

#[derive(Parser, Debug)]
#[command(author, version, about = "Ragstone retrieval-augmented QA server", long_about = None)]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen host (overrides config file)
    #[arg(long, env = "RAGSTONE_HOST")]
    host: Option<String>,

    /// Listen port (overrides config file)
    #[arg(long, env = "RAGSTONE_PORT")]
    port: Option<u16>,

    /// Knowledge-base root directory (overrides config file)
    #[arg(long, env = "RAGSTONE_WORKING_DIR")]
    working_dir: Option<PathBuf>,

    /// Skip startup validators (middleware always stays on)
    #[arg(long)]
    no_check: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let mut config = match ServerConfig::load(args.config.clone()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::from(EXIT_CONFIG_FAILURE);
        }
    };

    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(working_dir) = args.working_dir {
        config.storage.working_dir = working_dir;
    }

    if !args.no_check {
        if let Err(err) = config.validate() {
            eprintln!("configuration error: {err}");
            return ExitCode::from(EXIT_CONFIG_FAILURE);
        }
    }

    let _log_guard = match init_tracing(&config) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::from(EXIT_CONFIG_FAILURE);
        }
    };

    let mut runtime = tokio::runtime::Builder::new_multi_thread();
    runtime.enable_all();
    if config.server.workers > 0 {
        runtime.worker_threads(config.server.workers);
    }
    let runtime = match runtime.build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to start runtime: {err}");
            return ExitCode::from(EXIT_CONFIG_FAILURE);
        }
    };

    match runtime.block_on(run_server(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(StartupError::Bind { addr, source }) => {
            tracing::error!("failed to bind {}: {}", addr, source);
            ExitCode::from(EXIT_BIND_FAILURE)
        }
        Err(StartupError::Config(message)) => {
            tracing::error!("configuration error: {}", message);
            ExitCode::from(EXIT_CONFIG_FAILURE)
        }
        Err(StartupError::Runtime(message)) => {
            tracing::error!("server error: {}", message);
            ExitCode::from(EXIT_CONFIG_FAILURE)
        }
    }
}
