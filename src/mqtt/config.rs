use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Broker connection settings, read once at startup.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct MqttConfig {
    /// Hostname or IP address of the broker
    pub broker: String,
    pub port: u16,
    pub client_id: String,
    /// Topic carrying power commands
    pub topic: String,
    /// Subscription QoS level (0, 1 or 2)
    pub qos: u8,
    pub keep_alive_secs: u64,
    /// Upper bound for TCP connect plus CONNACK
    pub handshake_timeout_secs: u64,
    pub clean_session: bool,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: "192.168.1.100".to_string(),
            port: 1883,
            client_id: "relayswitch".to_string(),
            topic: "plc/control".to_string(),
            qos: 1,
            keep_alive_secs: 60,
            handshake_timeout_secs: 10,
            clean_session: true,
        }
    }
}

impl MqttConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Maps the configured level onto the protocol QoS. Out of range values
    /// are rejected by `Config::validate` before this is ever reached.
    pub fn qos(&self) -> QoS {
        match self.qos {
            0 => QoS::AtMostOnce,
            2 => QoS::ExactlyOnce,
            _ => QoS::AtLeastOnce,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.broker, self.port)
    }
}
