//! Process lifecycle: startup ordering, termination signals, safe shutdown.
//!
//! ```text
//! RelayDriver::initialize ──► Supervisor::start ──► run_until_shutdown
//!        (fatal on error)                                  │ SIGINT / SIGTERM
//!                                                          ▼
//!                        RelayDriver::release ◄── Supervisor::disconnect
//! ```
//!
//! The relay is owned here for the whole run, so its `Drop` deasserts the
//! line even when the supervisor path panics.

use crate::command::CommandInterpreter;
use crate::config::Config;
use crate::mqtt::backoff::Backoff;
use crate::mqtt::link::{BrokerLink, RumqttLink};
use crate::mqtt::mqtt_handler::Supervisor;
use crate::relay::{RelayDriver, RelayError};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("Relay initialization failed: {0}")]
    Relay(#[from] RelayError),

    #[error("Failed to install signal handlers: {0}")]
    Signals(#[from] std::io::Error),
}

/// Runs the switch until a termination signal arrives.
///
/// Fails only if the relay line cannot be claimed or signal handlers cannot
/// be installed; both happen before any network activity.
pub async fn run(config: Config) -> Result<(), LifecycleError> {
    let relay = RelayDriver::initialize(&config.relay)?;

    let shutdown = CancellationToken::new();
    let signals = spawn_signal_listener(shutdown.clone())?;

    let link = Box::new(RumqttLink::new(&config.mqtt));
    run_with(&config, relay, link, shutdown).await;

    signals.abort();
    Ok(())
}

/// Drives one supervisor over `link` until `shutdown` is cancelled, then
/// disconnects and releases the relay.
pub async fn run_with(
    config: &Config,
    mut relay: RelayDriver,
    link: Box<dyn BrokerLink>,
    shutdown: CancellationToken,
) {
    let supervisor = Supervisor::create(
        config.mqtt.clone(),
        Backoff::from(&config.backoff),
        CommandInterpreter::new(&config.commands),
        link,
    )
    .start();

    let draining = supervisor.run_until_shutdown(&mut relay, &shutdown).await;
    let stopped = draining.disconnect(config.shutdown.timeout()).await;
    info!("Session ended in state {}", stopped.session().state());

    relay.release();
    info!("Program is exiting. Resources have been cleaned up");
}

/// Cancels `shutdown` on the first SIGINT/SIGTERM. Later signals are only
/// logged; shutdown is already underway.
fn spawn_signal_listener(
    shutdown: CancellationToken,
) -> std::io::Result<tokio::task::JoinHandle<()>> {
    let mut signals = TerminationSignals::install()?;
    Ok(tokio::spawn(async move {
        loop {
            let name = signals.recv().await;
            request_shutdown(name, &shutdown);
        }
    }))
}

/// Returns true if this request started the shutdown.
fn request_shutdown(signal: &str, shutdown: &CancellationToken) -> bool {
    if shutdown.is_cancelled() {
        warn!("{} received, shutdown already in progress", signal);
        false
    } else {
        info!("{} received, initiating graceful shutdown", signal);
        shutdown.cancel();
        true
    }
}

#[cfg(unix)]
struct TerminationSignals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl TerminationSignals {
    fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
        }
    }
}

#[cfg(not(unix))]
struct TerminationSignals;

#[cfg(not(unix))]
impl TerminationSignals {
    fn install() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> &'static str {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
        "ctrl-c"
    }
}
