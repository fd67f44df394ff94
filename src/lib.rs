//! simple-message: a bulletin-board message client and server
//!
//! The client posts `user=`, optional `img=`, and a free-form message, then
//! half-closes its write direction. The server answers with a status and two
//! length-delimited documents (a rendered page and an image).
//!
//! Components:
//! - `connection`: resolve, connect, split, half-close
//! - `protocol`: request encoding and the response decoder state machine
//! - `sink`: persistence of decoded documents
//! - `client`: one complete posting
//! - `server`: listener, per-connection workers, reaper

pub mod client;
pub mod config;
pub mod connection;
pub mod protocol;
pub mod server;
pub mod sink;

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. `RUST_LOG` overrides `level`.
pub fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
