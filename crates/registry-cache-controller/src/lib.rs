//! Registry cache extension controller
//!
//! The [`controller`] dispatches `Extension` events to the [`actuator`],
//! which composes shoot objects ([`composer`]), issues certificates
//! ([`secrets`], [`pki`]), ships everything through managed resources
//! ([`managed_resources`]) and removes stale node configuration
//! ([`cleaner`]).

#![deny(missing_docs)]

pub mod actuator;
pub mod cleaner;
pub mod clients;
pub mod composer;
pub mod controller;
pub mod managed_resources;
pub mod pki;
pub mod secrets;

#[cfg(test)]
mod testing;

pub use controller::{Context, ControllerConfig};
