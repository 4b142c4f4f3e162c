//! Capability-aware JSON-RPC relay.
//!
//! A [`RelayCore`] sits between a downstream peer and one upstream
//! [`UpstreamChannel`](relay_mcp::UpstreamChannel). It learns what the upstream
//! supports during the handshake, refuses calls the upstream cannot answer
//! without touching the wire, retries transient failures, and salvages
//! messages out of corrupted frames.

mod capability;
mod config;
mod dispatch;
mod error;
mod gate;
mod recovery;
mod relay;
mod retry;
mod serve;

pub use capability::{Capability, CapabilitySet};
pub use config::SessionConfig;
pub use dispatch::{DispatchTable, LocalRoute, Route};
pub use error::{CANCELLED, NOT_READY, RelayError, TIMEOUT, TRANSPORT_FAILURE};
pub use gate::{DenyList, allow, family_of};
pub use recovery::{RecoveringSource, recover, recover_message};
pub use relay::{RelayCore, SessionState};
pub use retry::{PendingCall, RetryExecutor};
pub use serve::serve;
