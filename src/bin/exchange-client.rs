//! exchange-client: send one line to the server and print the response.

use clap::CommandFactory;
use line_exchange::client::Client;
use line_exchange::config::{ClientArgs, ClientConfig};
use line_exchange::logging;
use std::io::Write;
use std::process::ExitCode;
use tracing::{error, info, info_span, warn};

fn main() -> ExitCode {
    if std::env::args_os().len() <= 1 {
        logging::init("info");
        warn!("Arguments not specified");
        let _ = ClientArgs::command().print_help();
        return ExitCode::SUCCESS;
    }

    let config = match ClientConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    logging::init(&config.log_level);

    info!(
        endpoint = %config.endpoint,
        ssl = config.ssl,
        ssl_host = config.ssl_host.as_deref().unwrap_or(""),
        trust = ?config.trust,
        "Starting exchange-client"
    );

    let result =
        Client::new(&config, info_span!("client")).and_then(|client| client.exchange(&config.data));
    match result {
        Ok(response) => {
            let mut stdout = std::io::stdout().lock();
            let text = String::from_utf8_lossy(&response);
            if writeln!(stdout, "{text}").is_err() {
                return ExitCode::FAILURE;
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Exchange failed");
            ExitCode::FAILURE
        }
    }
}
