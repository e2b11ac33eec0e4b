//! Admission webhooks of the registry cache extension
//!
//! - [`validator`] rejects Shoots with an unusable registry-cache config.
//! - [`mutator`] points containerd on the shoot's nodes at the caches.
//!
//! Both are plain axum handlers; [`server`] wires them into TLS servers.

#![deny(missing_docs)]

pub mod error;
pub mod hosts;
pub mod mutator;
pub mod readers;
pub mod server;
pub mod validator;

pub use error::WebhookError;
pub use mutator::MutatorState;
pub use readers::KubeReader;
pub use validator::ValidatorState;
