//! # Docstore Testkit
//!
//! Test utilities for the docstore client.
//!
//! This crate provides:
//! - `InMemoryServer`, a `RequestExecutor` with real change-vector and
//!   compare-exchange index checks
//! - Entity fixtures and store helpers
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use docstore_testkit::prelude::*;
//!
//! #[test]
//! fn saves_an_order() {
//!     let (server, store) = test_store();
//!     let mut session = store.open_session().unwrap();
//!     session.store(&Order::sample()).unwrap();
//!     session.save_changes().unwrap();
//!     assert_eq!(server.document_count(), 1);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod server;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::server::*;
}

pub use fixtures::*;
pub use generators::*;
pub use server::*;
