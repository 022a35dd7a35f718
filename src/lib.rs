//! Anchorage - witness-network anchoring node
//!
//! A node that ingests activities over HTTP, brokers them through an
//! AMQP-backed publish/subscribe bus with redelivery and delayed dispatch,
//! and evaluates witness proofs on anchors against a configurable policy.

pub mod config;
pub mod ingress;
pub mod lifecycle;
pub mod policy;
pub mod pubsub;
pub mod store;
pub mod utils;

// Re-export common types for library usage
pub use config::Config;
pub use ingress::HttpSubscriber;
pub use policy::{Witness, WitnessPolicy, WitnessProof, WitnessType};
pub use pubsub::{AmqpPubSub, Disposition, MemoryPubSub, Message, PubSub};
