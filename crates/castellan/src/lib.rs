//! Castellan — the control plane of an E4-style end-to-end encryption
//! scheme layered over a publish/subscribe transport.
//!
//! The service owns client and topic keys and the client↔topic graph, and
//! converges devices to the intended cryptographic state by publishing
//! protected commands over the broker.

pub mod config;
mod error;
mod service;
pub mod telemetry;

pub use error::Error;
pub use service::{validate_name_or_id_pair, E4Service, IdNamePair, ServiceConfig};
