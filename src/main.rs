pub mod command;
pub mod config;
pub mod lifecycle;
pub mod mqtt;
pub mod relay;

use crate::config::Config;
use color_eyre::{eyre::WrapErr, Result};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    setup()?;

    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = Config::load(config_path)
        .await
        .wrap_err("Failed to load configuration")?;

    info!(
        "Starting relay switch: broker {}, topic '{}', pin {}",
        config.mqtt.address(),
        config.mqtt.topic,
        config.relay.pin
    );

    lifecycle::run(config)
        .await
        .wrap_err("Relay switch could not start")?;

    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}
