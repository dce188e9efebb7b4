//! SessionActor - serializes executions for one `(owner, session)` pair
//!
//! The SessionActor is the single writer for its session:
//! - Starts an execution at once when the session is idle, queues it otherwise
//! - Drains the queue in `seq` order whenever an execution finishes
//! - Guards every status change with the execution state machine
//! - Arbitrates runner leases on individual executions
//!
//! ## State Machine
//!
//! ```text
//! pending ──► running ──► completed
//!    │           ├──────► failed
//!    │           ▼
//!    └──────► cancelled
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ractor::Actor;
//! use crate::actors::session::{SessionActor, SessionArguments, SessionMsg};
//!
//! let (session_ref, _handle) = Actor::spawn(None, SessionActor, args).await?;
//! let outcome = ractor::call!(session_ref, |reply| SessionMsg::EnqueueExecution {
//!     execution_id: "exec-1".to_string(),
//!     payload,
//!     start_immediately: true,
//!     reply,
//! })??;
//! ```

pub mod actor;
pub mod dispatcher;
pub mod protocol;

pub use actor::{SessionActor, SessionArguments, SessionSettings, SessionState};
pub use protocol::{
    EnqueueOutcome, SessionError, SessionKey, SessionMsg, StartAccepted, StatusUpdate,
    SweepReport,
};
