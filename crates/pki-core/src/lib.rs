//! pki-core — registration records, line protocol and configuration.
//! The runtime crates depend on this one.

pub mod config;
pub mod endpoint;
pub mod wire;

pub use endpoint::{Category, Endpoint, RegistrationError, RegistrationMessage};
pub use wire::{Announcement, RegistrationStatus, SnapshotKind};
