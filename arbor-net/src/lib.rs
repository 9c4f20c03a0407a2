//! Arbor runtime on tokio.
//!
//! Leaves register with the stem's listener; the stem places each leaf in the
//! branch for its role, where a dedicated worker services it until it goes quiet.

pub mod branch;
pub mod hooks;
pub mod leaf;
pub mod prune;
pub mod stem;
pub mod transport;
pub mod worker;

pub use branch::{Branch, BranchError, BranchHooks};
pub use hooks::{Account, AccountError, AccountResolver, BroadcastHandler, PacketHandler};
pub use leaf::{Leaf, LeafConfig, LeafError, RegistrationFailure, RegistrationStatus};
pub use stem::{Stem, StemBuilder, StemConfig, StemError};
pub use transport::{Received, Transport, TransportError};
pub use worker::{Worker, WorkerState};
