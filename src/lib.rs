//! Docket library
//!
//! This module exposes shared functionality used by both the main binary
//! and integration tests.

pub mod conflict;
pub mod format;
pub mod git;
pub mod migrate;
pub mod refgraph;
pub mod slug;
pub mod storage;
pub mod types;
pub mod watch;
