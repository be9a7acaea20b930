//! Connection supervisor with statum lifecycle states.
//!
//! The supervisor owns the broker session and runs the reconnect state
//! machine on a single task. Its own lifecycle is typed; the session state
//! inside it is a runtime value because it cycles while running.
//!
//! # Lifecycle
//!
//! ```text
//! Idle ──start──► Running ──run_until_shutdown──► Draining ──disconnect──► Stopped
//! ```
//!
//! # Event dispatch
//!
//! ```text
//! BrokerLink::poll ──► handle_event ──► Session transition
//!                            │
//!                            └─ Message ──► CommandInterpreter ──► RelayDriver
//! ```

use super::backoff::Backoff;
use super::config::MqttConfig;
use super::link::{BrokerLink, LinkError, LinkEvent};
use super::message::CommandMessage;
use super::session::{Session, SessionState};
use crate::command::{Action, CommandInterpreter, Interpretation};
use crate::relay::RelayDriver;
use statum::{machine, state};
use std::time::Duration;
use tokio::time::{sleep, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

#[state]
#[derive(Debug, Clone)]
pub enum SupervisorState {
    Idle,     // Built, no network activity yet
    Running,  // Reconnect loop active
    Draining, // Shutdown requested, transport may still be open
    Stopped,  // Transport closed, session Disconnected
}

/// What happened to an inbound message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    Applied(Action),
    Rejected,
    /// Arrived before the subscription was acknowledged or on another topic
    Dropped,
}

/// Broker session supervisor with compile-time lifecycle safety via statum
#[machine]
pub struct Supervisor<S: SupervisorState> {
    config: MqttConfig,
    backoff: Backoff,
    interpreter: CommandInterpreter,
    session: Session,
    link: Box<dyn BrokerLink>,
    transport_open: bool,
}

impl<S: SupervisorState> Supervisor<S> {
    pub fn session(&self) -> &Session {
        &self.session
    }
}

impl Supervisor<Idle> {
    pub fn create(
        config: MqttConfig,
        backoff: Backoff,
        interpreter: CommandInterpreter,
        link: Box<dyn BrokerLink>,
    ) -> Self {
        info!(
            "Creating connection supervisor for {} (topic '{}')",
            config.address(),
            config.topic
        );
        Self::new(
            config,
            backoff,
            interpreter,
            Session::new(),
            link,
            false, // transport_open
        )
    }

    pub fn start(self) -> Supervisor<Running> {
        info!("Starting connection supervisor");
        self.transition()
    }
}

impl Supervisor<Running> {
    /// Runs the reconnect loop until `shutdown` is cancelled.
    ///
    /// Transport failures never end the loop; they only feed the backoff.
    pub async fn run_until_shutdown(
        mut self,
        relay: &mut RelayDriver,
        shutdown: &CancellationToken,
    ) -> Supervisor<Draining> {
        while !shutdown.is_cancelled() {
            match self.session.state() {
                SessionState::Disconnected => self.wait_backoff(shutdown).await,
                SessionState::Connecting => self.connect(shutdown).await,
                SessionState::Connected => {
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        event = self.link.poll() => self.handle_event(event, relay),
                    }
                }
                SessionState::Disconnecting => {
                    error!("Session is disconnecting while the supervisor still runs");
                    break;
                }
            }
        }

        info!(
            "Shutdown requested while {}, entering Disconnecting",
            self.session.state()
        );
        match self.session.begin_disconnect() {
            Ok(previous) => self.transport_open = previous == SessionState::Connected,
            Err(e) => warn!("{}", e),
        }
        self.transition()
    }

    async fn wait_backoff(&mut self, shutdown: &CancellationToken) {
        let delay = self.session.next_backoff();
        if !delay.is_zero() {
            let slept = self.backoff.sleep_duration(delay);
            info!(
                "Reconnecting to {} in {:?} (retry {})",
                self.config.address(),
                slept,
                self.session.retry_count()
            );
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Pending reconnect cancelled by shutdown");
                    return;
                }
                _ = sleep(slept) => {}
            }
        }
        if let Err(e) = self.session.begin_connect() {
            warn!("{}", e);
        }
    }

    async fn connect(&mut self, shutdown: &CancellationToken) {
        info!(
            "Connecting to MQTT broker at {} (attempt {})",
            self.config.address(),
            self.session.retry_count() + 1
        );
        let deadline = Instant::now() + self.config.handshake_timeout();

        let result = tokio::select! {
            _ = shutdown.cancelled() => {
                // The half-open attempt is abandoned, not awaited.
                self.link.close();
                return;
            }
            result = timeout_at(deadline, self.await_connack()) => result,
        };

        let failure = match result {
            Ok(Ok(session_present)) => {
                self.on_connected(session_present).await;
                return;
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("no CONNACK within {:?}", self.config.handshake_timeout()),
        };

        self.link.close();
        self.transport_open = false;
        if let Err(e) = self.session.connect_failed(&self.backoff) {
            warn!("{}", e);
        }
        warn!(
            "Connection attempt {} failed: {}",
            self.session.retry_count(),
            failure
        );
    }

    async fn await_connack(&mut self) -> Result<bool, LinkError> {
        loop {
            match self.link.poll().await? {
                LinkEvent::Connected { session_present } => return Ok(session_present),
                LinkEvent::ConnectRejected(reason) => return Err(LinkError::Refused(reason)),
                event => trace!("Ignoring {:?} while connecting", event),
            }
        }
    }

    async fn on_connected(&mut self, session_present: bool) {
        self.transport_open = true;
        if let Err(e) = self.session.connected() {
            warn!("{}", e);
        }
        info!(
            "Connected to MQTT broker at {} (session_present={})",
            self.config.address(),
            session_present
        );

        match self
            .link
            .subscribe(&self.config.topic, self.config.qos())
            .await
        {
            Ok(()) => info!("Subscribing to '{}'", self.config.topic),
            Err(e) => self.lose_link(&format!("subscribe request failed: {}", e)),
        }
    }

    /// The dispatch table: every observed broker event maps onto exactly one
    /// reaction here.
    fn handle_event(&mut self, event: Result<LinkEvent, LinkError>, relay: &mut RelayDriver) {
        match event {
            Ok(LinkEvent::Message(message)) => {
                self.dispatch(&message, relay);
            }
            Ok(LinkEvent::Subscribed { granted: true }) => {
                if let Err(e) = self.session.subscription_acknowledged() {
                    warn!("{}", e);
                }
                info!("Subscribed to '{}', ready for commands", self.config.topic);
            }
            Ok(LinkEvent::Subscribed { granted: false }) => {
                self.lose_link(&format!("broker refused subscription to '{}'", self.config.topic));
            }
            Ok(LinkEvent::PingResponse) => debug!("Keep-alive answered"),
            Ok(LinkEvent::Idle) | Ok(LinkEvent::Unsubscribed) => {}
            Ok(LinkEvent::BrokerDisconnect) => {
                self.lose_link("broker closed the session");
            }
            Ok(LinkEvent::Connected { .. }) | Ok(LinkEvent::ConnectRejected(_)) => {
                self.lose_link("handshake frame received on an established session");
            }
            Ok(LinkEvent::Unexpected(frame)) => {
                self.lose_link(&format!("unexpected frame {}", frame));
            }
            Err(e) => self.lose_link(&e.to_string()),
        }
    }

    /// Drops the transport and schedules a reconnect. Never touches the relay.
    fn lose_link(&mut self, reason: &str) {
        self.link.close();
        self.transport_open = false;
        if let Err(e) = self.session.link_lost(&self.backoff) {
            warn!("{}", e);
        }
        warn!(
            "Lost connection to MQTT broker: {}. Relay state is left as is",
            reason
        );
    }

    /// Hands one inbound publish to the interpreter and applies the result.
    pub fn dispatch(&mut self, message: &CommandMessage, relay: &mut RelayDriver) -> DispatchOutcome {
        if !self.session.is_ready() {
            debug!("Dropping {} received before the session was ready", message);
            return DispatchOutcome::Dropped;
        }
        if message.topic() != self.config.topic {
            debug!("Dropping {} from unrelated topic", message);
            return DispatchOutcome::Dropped;
        }
        info!("Received {}", message);

        match self.interpreter.interpret(message.payload()) {
            Interpretation::Action(action) => {
                let result = match action {
                    Action::Assert => relay.assert(),
                    Action::Deassert => relay.deassert(),
                };
                match result {
                    Ok(()) => DispatchOutcome::Applied(action),
                    Err(e) => {
                        error!("Failed to apply {:?}: {}", action, e);
                        DispatchOutcome::Rejected
                    }
                }
            }
            Interpretation::Rejected(reason) => {
                warn!("Ignoring message on '{}': {}", message.topic(), reason);
                DispatchOutcome::Rejected
            }
        }
    }
}

impl Supervisor<Draining> {
    /// Unsubscribes and says goodbye if a transport is open, then closes it
    /// no matter how the broker reacted. Bounded by `budget`.
    pub async fn disconnect(mut self, budget: Duration) -> Supervisor<Stopped> {
        let deadline = Instant::now() + budget;

        if self.transport_open {
            match timeout_at(deadline, self.link.unsubscribe(&self.config.topic)).await {
                Ok(Ok(())) => info!("Unsubscribed from '{}'", self.config.topic),
                Ok(Err(e)) => warn!("Unsubscribe failed: {}", e),
                Err(_) => warn!("Unsubscribe not acknowledged within {:?}", budget),
            }

            match timeout_at(deadline, self.link.disconnect()).await {
                Ok(Ok(())) => info!("Sent DISCONNECT to broker"),
                Ok(Err(e)) => warn!("Graceful disconnect failed: {}", e),
                Err(_) => warn!("Graceful disconnect did not complete within {:?}", budget),
            }
        } else {
            debug!("No open transport, skipping graceful disconnect");
        }

        self.link.close();
        self.transport_open = false;
        if let Err(e) = self.session.disconnected() {
            warn!("{}", e);
        }
        info!("MQTT client disconnected");
        self.transition()
    }
}

impl Supervisor<Stopped> {}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::command::CommandConfig;
    use crate::relay::simulated::{LineProbe, SimulatedLine};
    use async_trait::async_trait;
    use rumqttc::QoS;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    pub(crate) enum Step {
        Event(LinkEvent),
        Fail(LinkError),
    }

    #[derive(Debug, Default)]
    pub(crate) struct LinkLog {
        pub polls: Vec<Instant>,
        pub subscriptions: Vec<String>,
        pub unsubscriptions: Vec<String>,
        pub disconnects: usize,
        pub closes: usize,
    }

    /// Plays back a fixed script of broker behaviour, then goes silent.
    pub(crate) struct ScriptedLink {
        script: VecDeque<Step>,
        log: Arc<Mutex<LinkLog>>,
    }

    impl ScriptedLink {
        pub(crate) fn new(script: Vec<Step>) -> (Self, Arc<Mutex<LinkLog>>) {
            let log = Arc::new(Mutex::new(LinkLog::default()));
            let link = ScriptedLink {
                script: script.into(),
                log: log.clone(),
            };
            (link, log)
        }
    }

    #[async_trait]
    impl BrokerLink for ScriptedLink {
        async fn poll(&mut self) -> Result<LinkEvent, LinkError> {
            self.log.lock().unwrap().polls.push(Instant::now());
            match self.script.pop_front() {
                Some(Step::Event(event)) => Ok(event),
                Some(Step::Fail(e)) => Err(e),
                None => std::future::pending().await,
            }
        }

        async fn subscribe(&mut self, topic: &str, _qos: QoS) -> Result<(), LinkError> {
            self.log.lock().unwrap().subscriptions.push(topic.to_string());
            Ok(())
        }

        async fn unsubscribe(&mut self, topic: &str) -> Result<(), LinkError> {
            self.log.lock().unwrap().unsubscriptions.push(topic.to_string());
            Ok(())
        }

        async fn disconnect(&mut self) -> Result<(), LinkError> {
            self.log.lock().unwrap().disconnects += 1;
            Ok(())
        }

        fn close(&mut self) {
            self.log.lock().unwrap().closes += 1;
        }
    }

    pub(crate) fn connack() -> Step {
        Step::Event(LinkEvent::Connected {
            session_present: false,
        })
    }

    pub(crate) fn suback() -> Step {
        Step::Event(LinkEvent::Subscribed { granted: true })
    }

    pub(crate) fn publish(payload: &str) -> Step {
        Step::Event(LinkEvent::Message(CommandMessage::new("plc/control", payload)))
    }

    pub(crate) fn refused() -> Step {
        Step::Fail(LinkError::Transport("connection refused".to_string()))
    }

    pub(crate) fn relay() -> (RelayDriver, LineProbe) {
        let line = SimulatedLine::new(17);
        let probe = line.probe();
        (RelayDriver::with_line(Box::new(line), false), probe)
    }

    fn supervisor(link: ScriptedLink) -> Supervisor<Running> {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        Supervisor::create(
            MqttConfig::default(),
            backoff,
            CommandInterpreter::new(&CommandConfig::default()),
            Box::new(link),
        )
        .start()
    }

    /// Runs the supervisor until `stop_after` of (paused) time has passed,
    /// then drains and stops it.
    async fn run_for(
        script: Vec<Step>,
        relay: &mut RelayDriver,
        stop_after: Duration,
    ) -> (Supervisor<Stopped>, Arc<Mutex<LinkLog>>) {
        let (link, log) = ScriptedLink::new(script);
        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            sleep(stop_after).await;
            trigger.cancel();
        });
        let draining = supervisor(link).run_until_shutdown(relay, &shutdown).await;
        let stopped = draining.disconnect(Duration::from_secs(3)).await;
        (stopped, log)
    }

    fn gaps(polls: &[Instant]) -> Vec<Duration> {
        polls.windows(2).map(|w| w[1] - w[0]).collect()
    }

    #[test]
    fn dispatch_outcomes() {
        let (link, _log) = ScriptedLink::new(vec![]);
        let mut supervisor = supervisor(link);
        let (mut relay, _probe) = relay();
        let on = CommandMessage::new("plc/control", "power on");

        assert_eq!(supervisor.dispatch(&on, &mut relay), DispatchOutcome::Dropped);

        supervisor.session.begin_connect().unwrap();
        supervisor.session.connected().unwrap();
        supervisor.session.subscription_acknowledged().unwrap();

        let elsewhere = CommandMessage::new("plc/other", "power on");
        assert_eq!(supervisor.dispatch(&elsewhere, &mut relay), DispatchOutcome::Dropped);
        assert_eq!(
            supervisor.dispatch(&on, &mut relay),
            DispatchOutcome::Applied(Action::Assert)
        );
        let garbage = CommandMessage::new("plc/control", "reboot");
        assert_eq!(supervisor.dispatch(&garbage, &mut relay), DispatchOutcome::Rejected);
        assert!(relay.is_asserted());

        relay.release();
        assert_eq!(supervisor.dispatch(&on, &mut relay), DispatchOutcome::Rejected);
    }

    #[tokio::test(start_paused = true)]
    async fn power_on_asserts_when_ready() {
        let (mut relay, probe) = relay();
        let (stopped, log) = run_for(
            vec![connack(), suback(), publish("power on")],
            &mut relay,
            Duration::from_secs(5),
        )
        .await;

        assert!(relay.is_asserted());
        assert!(probe.is_high());
        assert_eq!(stopped.session().state(), SessionState::Disconnected);

        let log = log.lock().unwrap();
        assert_eq!(log.subscriptions, vec!["plc/control".to_string()]);
        assert_eq!(log.unsubscriptions, vec!["plc/control".to_string()]);
        assert_eq!(log.disconnects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn case_mismatch_is_rejected() {
        let (mut relay, probe) = relay();
        run_for(
            vec![connack(), suback(), publish("POWER ON")],
            &mut relay,
            Duration::from_secs(5),
        )
        .await;

        assert!(!relay.is_asserted());
        assert_eq!(probe.writes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn commands_before_suback_are_dropped() {
        let (mut relay, _probe) = relay();
        run_for(
            vec![connack(), publish("power on"), suback()],
            &mut relay,
            Duration::from_secs(5),
        )
        .await;

        assert!(!relay.is_asserted());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_attempts_back_off_exponentially() {
        let (mut relay, probe) = relay();
        let (_stopped, log) = run_for(
            vec![refused(), refused(), refused(), connack(), suback()],
            &mut relay,
            Duration::from_secs(60),
        )
        .await;

        let log = log.lock().unwrap();
        assert_eq!(
            gaps(&log.polls[..4]),
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
        assert_eq!(probe.writes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn link_loss_keeps_relay_and_restarts_from_base() {
        let (mut relay, probe) = relay();
        let (_stopped, log) = run_for(
            vec![
                refused(),
                refused(),
                connack(),
                suback(),
                publish("power on"),
                Step::Fail(LinkError::Transport("connection reset".to_string())),
                connack(),
                suback(),
            ],
            &mut relay,
            Duration::from_secs(60),
        )
        .await;

        // Line was asserted once and never touched by the reconnect.
        assert!(probe.is_high());
        assert_eq!(probe.writes(), 2);

        let log = log.lock().unwrap();
        let gaps = gaps(&log.polls);
        // refused -> refused: 1s, refused -> connack: 2s
        assert_eq!(gaps[0], Duration::from_secs(1));
        assert_eq!(gaps[1], Duration::from_secs(2));
        // reset -> reconnect waits the base delay again
        assert_eq!(gaps[5], Duration::from_secs(1));
        assert_eq!(log.subscriptions.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_handshake_times_out() {
        let (mut relay, _probe) = relay();
        // Empty script: the first poll never answers.
        let (stopped, log) = run_for(vec![], &mut relay, Duration::from_secs(12)).await;

        let log = log.lock().unwrap();
        // Timed out after 10s, closed, then waited 1s and tried again.
        assert_eq!(log.polls.len(), 2);
        assert_eq!(gaps(&log.polls), vec![Duration::from_secs(11)]);
        assert!(log.closes >= 2);
        assert_eq!(log.disconnects, 0);
        assert_eq!(stopped.session().retry_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_during_backoff_stops_reconnecting() {
        let (mut relay, probe) = relay();
        relay.assert().unwrap();
        let (stopped, log) = run_for(
            vec![refused(), refused(), refused(), refused(), refused()],
            &mut relay,
            Duration::from_secs(5),
        )
        .await;

        let log = log.lock().unwrap();
        // Attempts at 0s, 1s and 3s; the 4s delay is cut short at 5s.
        assert_eq!(log.polls.len(), 3);
        assert_eq!(log.unsubscriptions.len(), 0);
        assert_eq!(log.disconnects, 0);
        assert_eq!(stopped.session().state(), SessionState::Disconnected);
        assert!(probe.is_high());
    }

    #[tokio::test(start_paused = true)]
    async fn unexpected_frame_forces_reconnect() {
        let (mut relay, _probe) = relay();
        let (_stopped, log) = run_for(
            vec![
                connack(),
                suback(),
                Step::Event(LinkEvent::Unexpected("PingReq".to_string())),
                connack(),
            ],
            &mut relay,
            Duration::from_secs(10),
        )
        .await;

        let log = log.lock().unwrap();
        assert_eq!(log.polls.len(), 5);
        assert_eq!(log.subscriptions.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn refused_subscription_reconnects() {
        let (mut relay, _probe) = relay();
        let (_stopped, log) = run_for(
            vec![
                connack(),
                Step::Event(LinkEvent::Subscribed { granted: false }),
                connack(),
                suback(),
            ],
            &mut relay,
            Duration::from_secs(10),
        )
        .await;

        let log = log.lock().unwrap();
        assert_eq!(log.subscriptions.len(), 2);
        assert_eq!(gaps(&log.polls)[1], Duration::from_secs(1));
    }
}
