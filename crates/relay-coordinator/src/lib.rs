//! Relay Coordinator Service Library
//!
//! Signaling coordinator for a single-room WebRTC relay. Clients negotiate
//! transports over a WebSocket, one of them publishes the room's single
//! producer, and every other client consumes it.
//!
//! # Architecture
//!
//! ```text
//! signaling (WebSocket)
//! └── SessionCoordinator (singleton)
//!     └── SessionActor (one per connection, owns the session state machine)
//!         └── registries (shared state)
//!             ├── CapabilityRegistry   (router + RTP capabilities)
//!             ├── TransportRegistry    (per-session transports)
//!             ├── MediaEndpointRegistry (producer slot + consumers)
//!             └── NotificationBus      (newProducer / producerClosed)
//!                 └── relay engine (RelayWorker / RelayRouter traits)
//! ```
//!
//! # Key Design Decisions
//!
//! - **Last writer wins**: a new producer replaces the old one and orphaned
//!   consumers are closed and notified
//! - **No lock across relay calls**: registries re-validate after each call
//! - **Bounded relay calls**: every relay call has a timeout
//! - **Fatal worker death**: the process exits and is restarted externally
//!
//! # Modules
//!
//! - [`actors`] - Session actors and the coordinator
//! - [`bus`] - Notification fan-out
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types with wire error codes
//! - [`registry`] - Shared coordinator state
//! - [`relay`] - Relay engine interface and the mediasoup engine
//! - [`signaling`] - WebSocket signaling protocol

pub mod actors;
pub mod bus;
pub mod config;
pub mod errors;
pub mod observability;
pub mod registry;
pub mod relay;
pub mod signaling;
pub mod types;
