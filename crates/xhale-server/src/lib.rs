//! # xhale-server
//!
//! HTTP host library for the XHale sensor session manager.
//!
//! Holds the API handlers, logging setup and shared state so the binary and
//! the `gen-openapi` tool can share them.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod api;
pub mod logging;
pub mod state;
