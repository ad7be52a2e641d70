//! Hypha Node - daemon running a single Hypha node over TCP.
//!
//! Provides:
//! - Daemon configuration layered from TOML, environment and CLI
//! - The demo training state streamed between peers
//! - The broadcast loop and the stdout metrics subscriber

#![forbid(unsafe_code)]

pub mod config;
pub mod daemon;
pub mod demo;
