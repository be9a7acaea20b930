//! Transport seam between the supervisor and the broker.
//!
//! The supervisor only sees [`LinkEvent`]s; [`RumqttLink`] translates the
//! rumqttc event loop into them. Keep-alive pings are sent by rumqttc itself
//! and an unanswered ping surfaces as a poll error.

use super::config::MqttConfig;
use super::message::CommandMessage;
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS, SubscribeReasonCode,
};
use tracing::{debug, trace, warn};

const REQUEST_CAPACITY: usize = 10;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkEvent {
    /// Broker accepted the handshake
    Connected { session_present: bool },
    /// Broker answered the handshake with a refusal
    ConnectRejected(String),
    Subscribed { granted: bool },
    Unsubscribed,
    Message(CommandMessage),
    PingResponse,
    /// Broker closed the session from its side
    BrokerDisconnect,
    /// A frame a client must never receive
    Unexpected(String),
    /// Bookkeeping traffic (outgoing packets, QoS acks)
    Idle,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("Connection refused by broker: {0}")]
    Refused(String),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Client request failed: {0}")]
    Client(String),
}

impl From<ConnectionError> for LinkError {
    fn from(error: ConnectionError) -> Self {
        match error {
            ConnectionError::ConnectionRefused(code) => LinkError::Refused(format!("{:?}", code)),
            ConnectionError::MqttState(e) => LinkError::Protocol(e.to_string()),
            ConnectionError::NotConnAck(packet) => {
                LinkError::Protocol(format!("expected CONNACK, got {:?}", packet))
            }
            other => LinkError::Transport(other.to_string()),
        }
    }
}

#[async_trait]
pub trait BrokerLink: Send {
    /// Waits for the next event. Opens the transport and performs the
    /// handshake first if none is open. After an error the transport is
    /// closed and the next call starts over.
    async fn poll(&mut self) -> Result<LinkEvent, LinkError>;

    /// Queues a subscription; the acknowledgement arrives through `poll`.
    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), LinkError>;

    /// Resolves once the broker acknowledged the unsubscribe.
    async fn unsubscribe(&mut self, topic: &str) -> Result<(), LinkError>;

    /// Sends DISCONNECT and resolves once it has been written out.
    async fn disconnect(&mut self) -> Result<(), LinkError>;

    /// Drops the current transport without any goodbye.
    fn close(&mut self);
}

pub struct RumqttLink {
    options: MqttOptions,
    client: AsyncClient,
    eventloop: EventLoop,
}

impl RumqttLink {
    pub fn new(config: &MqttConfig) -> Self {
        let mut options = MqttOptions::new(config.client_id.clone(), config.broker.clone(), config.port);
        options
            .set_keep_alive(config.keep_alive())
            .set_clean_session(config.clean_session);

        let (client, eventloop) = AsyncClient::new(options.clone(), REQUEST_CAPACITY);
        RumqttLink {
            options,
            client,
            eventloop,
        }
    }
}

#[async_trait]
impl BrokerLink for RumqttLink {
    async fn poll(&mut self) -> Result<LinkEvent, LinkError> {
        match self.eventloop.poll().await {
            Ok(Event::Incoming(packet)) => Ok(map_incoming(packet)),
            Ok(Event::Outgoing(outgoing)) => {
                trace!("Outgoing: {:?}", outgoing);
                Ok(LinkEvent::Idle)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), LinkError> {
        self.client
            .subscribe(topic, qos)
            .await
            .map_err(|e| LinkError::Client(e.to_string()))
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), LinkError> {
        self.client
            .unsubscribe(topic)
            .await
            .map_err(|e| LinkError::Client(e.to_string()))?;

        loop {
            match self.eventloop.poll().await? {
                Event::Incoming(Packet::UnsubAck(_)) => return Ok(()),
                Event::Incoming(Packet::Publish(publish)) => {
                    debug!("Dropping publish on {} while unsubscribing", publish.topic)
                }
                event => trace!("Waiting for UNSUBACK, got {:?}", event),
            }
        }
    }

    async fn disconnect(&mut self) -> Result<(), LinkError> {
        self.client
            .disconnect()
            .await
            .map_err(|e| LinkError::Client(e.to_string()))?;

        loop {
            match self.eventloop.poll().await? {
                Event::Outgoing(Outgoing::Disconnect) => return Ok(()),
                event => trace!("Waiting for DISCONNECT to flush, got {:?}", event),
            }
        }
    }

    fn close(&mut self) {
        // A fresh event loop owns no socket; dropping the old one closes it.
        let (client, eventloop) = AsyncClient::new(self.options.clone(), REQUEST_CAPACITY);
        self.client = client;
        self.eventloop = eventloop;
    }
}

fn map_incoming(packet: Packet) -> LinkEvent {
    match packet {
        Packet::ConnAck(ack) => {
            if matches!(ack.code, ConnectReturnCode::Success) {
                LinkEvent::Connected {
                    session_present: ack.session_present,
                }
            } else {
                LinkEvent::ConnectRejected(format!("{:?}", ack.code))
            }
        }
        Packet::SubAck(ack) => LinkEvent::Subscribed {
            granted: ack
                .return_codes
                .iter()
                .all(|code| !matches!(code, SubscribeReasonCode::Failure)),
        },
        Packet::UnsubAck(_) => LinkEvent::Unsubscribed,
        Packet::Publish(publish) => {
            LinkEvent::Message(CommandMessage::new(publish.topic, publish.payload.to_vec()))
        }
        Packet::PingResp => LinkEvent::PingResponse,
        Packet::Disconnect => LinkEvent::BrokerDisconnect,
        Packet::PubAck(_) | Packet::PubRec(_) | Packet::PubRel(_) | Packet::PubComp(_) => {
            LinkEvent::Idle
        }
        other => {
            warn!("Unexpected frame from broker: {:?}", other);
            LinkEvent::Unexpected(format!("{:?}", other))
        }
    }
}
