//! # MQTT Connection Module
//!
//! Keeps one durable session with the broker and feeds received commands to
//! the relay. Transport trouble is never fatal: every failure goes through
//! the bounded exponential backoff and the supervisor tries again, forever.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs        - Broker settings
//! ├── message.rs       - Received command messages
//! ├── backoff.rs       - Pure retry delay policy
//! ├── session.rs       - Session state and named transitions
//! ├── link.rs          - BrokerLink seam and the rumqttc implementation
//! └── mqtt_handler.rs  - Supervisor: event loop and dispatch
//! ```
//!
//! ## Delivery semantics
//!
//! Commands are only applied while the session is fully up, i.e. connected
//! and the command subscription acknowledged. Anything arriving earlier is
//! dropped rather than queued.

pub mod backoff;
pub mod config;
pub mod link;
pub mod message;
pub mod mqtt_handler;
pub mod session;
