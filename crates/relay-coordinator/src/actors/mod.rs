//! Actor model for session coordination.
//!
//! ```text
//! SessionCoordinator (singleton)
//! └── supervises N SessionActors
//!     └── SessionActor (one per signaling connection)
//!         ├── owns the session state machine
//!         └── forwards bus notifications to its client
//! ```
//!
//! Shared state (router, transports, producer slot, consumers) lives in the
//! registries, not in the actors.

pub mod coordinator;
pub mod messages;
pub mod metrics;
pub mod session;

pub use coordinator::{monitor_worker, SessionCoordinator};
pub use messages::{
    ConsumerPhase, CoordinatorStatus, ProducerPhase, SessionReply, SessionRequest, SessionResult,
    SessionSnapshot,
};
pub use metrics::{ActorMetrics, ActorType, MailboxMonitor};
pub use session::{SessionActor, SessionHandle};
