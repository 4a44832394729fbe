//! # Relay Test Utilities
//!
//! Shared test utilities for the Relay Coordinator.
//!
//! - `mock_relay` - Scriptable relay engine that records every call
//! - `fixtures` - RTP payloads and settings used across tests
//!
//! ## Usage
//!
//! ```rust,ignore
//! use relay_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let relay = MockRelay::builder()
//!         .fail_consume()
//!         .build();
//!     let worker = MockWorker::new(relay.clone());
//!
//!     // Install the router, run requests, then inspect relay.calls()
//! }
//! ```

pub mod fixtures;
pub mod mock_relay;

pub use fixtures::*;
pub use mock_relay::*;
