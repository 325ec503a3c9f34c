//! pki-services — the coordinator's runtime pieces: node registry,
//! registration listener, broadcast engine and epoch scheduler, plus the
//! node-side client used by evaluated nodes.

pub mod broadcast;
pub mod listener;
pub mod node;
pub mod registry;
pub mod scheduler;
pub mod tls;

pub use broadcast::{BroadcastReport, Broadcaster, RetryPolicy};
pub use listener::RegistrationListener;
pub use node::BroadcastInbox;
pub use registry::{EpochDirectory, NodeRegistry, SharedDirectory};
pub use scheduler::{EpochPhase, EpochReport, EpochTiming, Scheduler};
pub use tls::Credentials;
