//! # scanbridge-server
//!
//! Host-facing side of the scanbridge daemon.
//!
//! This library provides the two host transports (HTTP+SSE and a serial
//! link), the HTTP API handlers and OpenAPI document, command-line
//! handling, and logging setup. The binary in `main.rs` wires them to
//! [`scanbridge_core::Bridge`].

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod api;
pub mod cli;
pub mod logging;
pub mod state;
pub mod transport;
