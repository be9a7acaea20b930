use std::fmt;

/// A single publish received from the broker.
///
/// Lives only for the duration of one dispatch call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandMessage {
    topic: String,
    payload: Vec<u8>,
}

impl fmt::Display for CommandMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let preview = String::from_utf8_lossy(&self.payload);
        let preview: String = preview.chars().take(32).collect();
        write!(f, "{} - {:?}", self.topic, preview)
    }
}

impl CommandMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        CommandMessage {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_truncates_long_payloads() {
        let msg = CommandMessage::new("plc/control", "x".repeat(100));
        let rendered = msg.to_string();
        assert!(rendered.starts_with("plc/control - "));
        assert_eq!(rendered.matches('x').count(), 32);
    }

    #[test]
    fn display_survives_binary_payload() {
        let msg = CommandMessage::new("plc/control", vec![0xff, 0xfe, b'a']);
        assert!(msg.to_string().contains('a'));
    }
}
