//! exchange-server: answer line-delimited requests with a templated response.
//!
//! Serves one connection at a time until the process is killed.

use clap::CommandFactory;
use line_exchange::config::{ServerArgs, ServerConfig};
use line_exchange::logging;
use line_exchange::server::Server;
use std::process::ExitCode;
use tracing::{error, info, info_span, warn};

fn main() -> ExitCode {
    if std::env::args_os().len() <= 1 {
        logging::init("info");
        warn!("Arguments not specified");
        let _ = ServerArgs::command().print_help();
        return ExitCode::SUCCESS;
    }

    // Load configuration
    let config = match ServerConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    logging::init(&config.log_level);

    info!(
        ip = %config.endpoint.ip,
        port = config.endpoint.port,
        ssl = config.ssl,
        header_file = %config.header_file.display(),
        content_file = %config.content_file.display(),
        "Starting exchange-server"
    );

    match Server::bind(&config, info_span!("server")) {
        Ok(server) => server.run(),
        Err(e) => {
            error!(error = %e, "Server startup failed");
            ExitCode::FAILURE
        }
    }
}
