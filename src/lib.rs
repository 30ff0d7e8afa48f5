//! SteadyCoach: interview practice by text chat or realtime voice call
//!
//! The voice engine is layered bottom-up:
//!
//! - [`audio`]: PCM16 codec, microphone capture, scheduled playback
//! - [`live`]: the realtime transport session and its wire protocol
//! - [`voice`]: the controller that composes both into a call
//!
//! Text interviews go through [`chat`]; transcripts of both are modelled in
//! [`transcript`] and persisted by [`store`].

pub mod app;
pub mod audio;
pub mod chat;
pub mod cli;
pub mod credentials;
pub mod instruction;
pub mod live;
pub mod paths;
pub mod settings;
pub mod store;
pub mod transcript;
pub mod voice;

use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Log records go to stderr so they never interleave with the interview
/// output. Filtered by `RUST_LOG`, `warn` by default.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Parse the command line and run it to completion
pub fn run() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();
    init_logging();

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        log::debug!("TLS crypto provider already installed");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(app::run(cli))
}
