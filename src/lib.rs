//! Lazytile - concurrent image acquisition for scrolling tile views.
//!
//! This crate loads remote images into display slots through a memory and
//! disk cache, coalescing duplicate requests and discarding results for
//! slots that have moved on to other content.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Domain layer containing entities, errors, and port definitions.
pub mod domain;
/// Infrastructure layer containing adapters for external services.
pub mod infrastructure;
/// Presentation layer containing image consumers.
pub mod presentation;

/// Current version of the application.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name.
pub const NAME: &str = "lazytile";
