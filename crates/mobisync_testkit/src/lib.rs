//! # MobiSync Testkit
//!
//! Test utilities for MobiSync.
//!
//! This crate provides:
//! - A scriptable in-memory remote table service
//! - A local store with injectable write failures
//! - Recording and conflict-resolving sync handlers
//! - Sync context fixtures
//! - Property-based generators for local mutation sequences
//!
//! ## Usage
//!
//! ```rust,ignore
//! use mobisync_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn pushes_an_insert() {
//!     let sync = TestSync::new().await;
//!     sync.insert("todo", item("a", "milk")).await.unwrap();
//!     sync.push().await.unwrap();
//!     assert_eq!(sync.remote.rows("todo").len(), 1);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod flaky_store;
pub mod generators;
pub mod handlers;
pub mod mock_remote;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::flaky_store::*;
    pub use crate::generators::*;
    pub use crate::handlers::*;
    pub use crate::mock_remote::*;
}

pub use fixtures::*;
pub use flaky_store::*;
pub use generators::*;
pub use handlers::*;
pub use mock_remote::*;
