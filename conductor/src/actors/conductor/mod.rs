//! Conductor - drives one distributed query through its checkpointed stages
//!
//! The Conductor owns the persisted query record and walks a fixed sequence
//! of stages on every `lead`. Each stage is gated by a checkpoint that, once
//! set, is never re-executed:
//!
//! ```text
//! ci ──► fetch ──► tf ──► t ──► da
//! │       │         │     │      │
//! │       │         │     │      └─ layer 0 ─► layer 1 ─► … ─► results
//! │       │         │     └─ local query (completed by callback)
//! │       │         └─ target selection
//! │       └─ subscriber address lists
//! └─ concept hashes
//! ```
//!
//! `lead` returns as soon as outstanding asynchronous work is dispatched.
//! It is re-entered by the local-query callback and by every worker result,
//! and may be called by several racing triggers at once: stage writes are
//! compare-and-set, and layer fan-out is guarded by the task store's
//! insert-if-absent.
//!
//! HTTP handlers reach it through [`ConductorActor`]; tests and embedders
//! may drive a [`Conductor`] directly.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let conductor = Conductor::new(store, remote, "node-a");
//! let (actor, _handle) =
//!     Actor::spawn(None, ConductorActor, ConductorArguments { conductor }).await?;
//! let query = ractor::call!(actor, |reply| ConductorMsg::Submit { submission, reply })??;
//! ```

pub mod actor;
pub mod protocol;
mod runtime;
pub mod service;
pub mod state;

pub use actor::{ConductorActor, ConductorArguments};
pub use protocol::{ConductorError, ConductorMsg, LeadOutcome, LocalResultsOutcome};
pub use service::Conductor;
