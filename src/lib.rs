//! ferry: sandboxed remote file access over a two-channel TCP protocol
//!
//! A control connection carries one JSON request and one JSON response;
//! uploads and downloads then move over a short-lived data channel.

pub mod checksum;
pub mod cli;
pub mod config;
pub mod data_channel;
pub mod dispatch;
pub mod error;
pub mod logger;
pub mod net_async;
pub mod progress;
pub mod protocol;
pub mod protocol_core;
pub mod staging;
