//! simple-message-server: accept postings and run the server logic program
//! once per connection, with the connection as its stdin and stdout.

use simple_message::config::ServerConfig;
use simple_message::server::{Listener, ProgramHandler, Server};
use std::process::ExitCode;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let config = match ServerConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("simple-message-server: {}", e);
            return ExitCode::FAILURE;
        }
    };
    simple_message::init_logging(&config.log_level);

    info!(
        host = %config.host,
        port = config.port,
        backlog = config.backlog,
        logic = %config.handler_program.display(),
        "Starting simple-message-server"
    );

    match serve(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Server stopped");
            eprintln!("simple-message-server: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn serve(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let listener = Listener::bind(&config.host, config.port, config.backlog).await?;
    let handler = ProgramHandler::new(config.handler_program, config.handler_args);
    Server::new(listener, handler).run().await?;
    Ok(())
}
