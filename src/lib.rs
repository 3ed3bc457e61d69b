//! Rewind - record/replay HTTP cache engine
//!
//! Requests flow through a reconfigurable modifier pipeline. The cache
//! modifier records responses into a single-file archive keyed by a digest
//! of the request, and replays them later without touching the network.
//! Conditions and filters route traffic to modifiers, and every modifier
//! can be built from a JSON envelope through the registry.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::cargo)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::field_reassign_with_default,
    clippy::multiple_crate_versions
)]

pub mod cache;
pub mod config;
pub mod error;
pub mod filter;
pub mod key;
pub mod message;
pub mod modifier;
pub mod proxy;
pub mod registry;
pub mod storage;

pub use error::{Result, RewindError};
