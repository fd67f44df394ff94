//! simple-message-client: post one message and save the two returned documents.
//!
//! Exits with the status value returned by the server, or 1 on any error.

use simple_message::client;
use simple_message::config::ClientConfig;
use std::process::ExitCode;
use tracing::{error, info};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let config = ClientConfig::load();
    simple_message::init_logging(&config.log_level);

    info!(
        server = %config.server,
        port = config.port,
        user = %config.user,
        with_image = config.image_url.is_some(),
        "Starting simple-message-client"
    );

    match client::run(&config).await {
        Ok(status) => {
            info!(status, "Response saved");
            ExitCode::from(u8::try_from(status).unwrap_or(1))
        }
        Err(e) => {
            error!(error = %e, "Client failed");
            eprintln!("simple-message-client: {}", e);
            ExitCode::FAILURE
        }
    }
}
