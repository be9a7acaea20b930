//! Maps command payloads onto relay actions.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct CommandConfig {
    pub power_on: String,
    pub power_off: String,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            power_on: "power on".to_string(),
            power_off: "power off".to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Assert,
    Deassert,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RejectReason {
    NotUtf8,
    Unrecognized(String),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::NotUtf8 => write!(f, "payload is not valid UTF-8"),
            RejectReason::Unrecognized(text) => write!(f, "unrecognized command {:?}", text),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Interpretation {
    Action(Action),
    Rejected(RejectReason),
}

/// Exact, case-sensitive match against the two configured literals.
#[derive(Clone, Debug)]
pub struct CommandInterpreter {
    power_on: String,
    power_off: String,
}

impl CommandInterpreter {
    pub fn new(config: &CommandConfig) -> Self {
        Self {
            power_on: config.power_on.clone(),
            power_off: config.power_off.clone(),
        }
    }

    pub fn interpret(&self, payload: &[u8]) -> Interpretation {
        let Ok(text) = std::str::from_utf8(payload) else {
            return Interpretation::Rejected(RejectReason::NotUtf8);
        };
        if text == self.power_on {
            Interpretation::Action(Action::Assert)
        } else if text == self.power_off {
            Interpretation::Action(Action::Deassert)
        } else {
            Interpretation::Rejected(RejectReason::Unrecognized(text.to_string()))
        }
    }
}
