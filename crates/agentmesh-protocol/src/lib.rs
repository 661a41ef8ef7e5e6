//! agentmesh protocol - wire envelope and message definitions.
//!
//! Agents exchange JSON envelopes over a shared publish/subscribe transport.
//! This crate owns the envelope shape, the message type taxonomy, typed
//! payloads, channel naming, and the codec that validates inbound bytes.

pub mod codec;
pub mod constants;
pub mod error;
pub mod identity;
pub mod messages;
pub mod types;

pub use codec::{decode, encode};
pub use constants::*;
pub use error::*;
pub use identity::*;
pub use messages::*;
pub use types::*;
