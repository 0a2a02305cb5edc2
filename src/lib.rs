// src/lib.rs

//! Ordered, asynchronous execution of shell commands over one persistent
//! interpreter process.
//!
//! A [`core::session::Session`] owns a single long-lived shell process and a
//! FIFO command queue. Every submitted [`core::command::Command`] is written
//! to the interpreter followed by a token trailer that reports its exit
//! status, so per-command output can be demultiplexed back off the shared
//! output stream. [`core::toolbox::Toolbox`] builds common operations
//! (root check, kill-by-name, existence probes, file copy) on top of that
//! protocol.

pub mod constants;
pub mod core;
pub mod models;
pub mod system;
