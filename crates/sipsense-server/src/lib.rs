//! # sipsense-server
//!
//! HTTP server library for the sipsense smart water bottle client.
//!
//! This library provides the API handlers and state management for sipsense.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod api;
pub mod logging;
pub mod state;
