//! HTTP/1.x request lifecycle.
//!
//! # Architecture
//!
//! - **`parser`**: incremental tokenizer turning bytes into head/body events
//! - **`request`**: normalized request record and the keep-alive decision
//! - **`response`**: status codes, responses and lazy bodies
//! - **`writer`**: serializes responses to wire bytes
//! - **`gate`**: per-connection FIFO that keeps pipelined responses in order
//! - **`error`**: application errors and their HTTP mapping
//! - **`context`**: what the application sees, including streaming and hooks
//! - **`controller`**: one request's state machine
//! - **`connection`**: the read loop feeding controllers
//!
//! # Request flow
//!
//! ```text
//!  socket ──► parser ──► controller ──spawn──► application task
//!                                                    │
//!  socket ◄── gate (arrival order) ◄── writer ◄──────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use orderly::app::Hello;
//! use orderly::config::ServerConfig;
//! use orderly::http::connection::Connection;
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Arc::new(ServerConfig::new(Hello));
//!     let listener = TcpListener::bind("127.0.0.1:8080").await?;
//!
//!     loop {
//!         let (socket, _addr) = listener.accept().await?;
//!         let config = Arc::clone(&config);
//!         tokio::spawn(async move {
//!             if let Err(e) = Connection::new(socket, config).run().await {
//!                 eprintln!("Connection error: {}", e);
//!             }
//!         });
//!     }
//! }
//! ```

pub mod connection;
pub mod context;
pub mod controller;
pub mod error;
pub mod gate;
pub mod parser;
pub mod request;
pub mod response;
pub mod writer;
