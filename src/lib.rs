//! Orderly - HTTP/1.x request lifecycle core
//!
//! Turns parsed request events into ordered responses while application
//! logic for pipelined requests runs concurrently.

pub mod app;
pub mod config;
pub mod http;
pub mod server;
