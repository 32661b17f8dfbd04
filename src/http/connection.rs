use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadHalf};

use crate::config::ServerConfig;
use crate::http::controller::Controller;
use crate::http::error::AppError;
use crate::http::gate::DeliveryGate;
use crate::http::parser::{ParseEvent, RequestParser};

/// Read side of one client connection.
///
/// Feeds parser events into one [`Controller`] per request. Requests are
/// handed off as soon as they are fully read, so several can be in flight
/// at once; their responses leave in arrival order through the
/// [`DeliveryGate`].
pub struct Connection<S> {
    reader: ReadHalf<S>,
    buffer: BytesMut,
    parser: RequestParser,
    gate: DeliveryGate,
    config: Arc<ServerConfig>,
    peer: Option<SocketAddr>,
    state: ConnectionState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Reading,
    Closed,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(stream: S, config: Arc<ServerConfig>) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader,
            buffer: BytesMut::with_capacity(4096),
            parser: RequestParser::new(),
            gate: DeliveryGate::new(Box::new(writer)),
            config,
            peer: None,
            state: ConnectionState::Reading,
        }
    }

    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    /// Reads requests until the client hangs up or a response closes the
    /// connection. Requests still in flight finish on their own tasks, or are
    /// abandoned once the client is gone.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut current: Option<Controller> = None;

        while self.state == ConnectionState::Reading {
            let event = match self.parser.next_event(&mut self.buffer) {
                Ok(Some(event)) => event,
                Ok(None) => {
                    if let Err(e) = self.fill_buffer().await {
                        if let Some(mut controller) = current.take() {
                            controller.on_connection_closed().await;
                        }
                        return Err(e);
                    }
                    if self.state == ConnectionState::Closed {
                        if let Some(mut controller) = current.take() {
                            controller.on_connection_closed().await;
                        }
                    }
                    continue;
                }
                Err(e) => {
                    tracing::debug!(peer = ?self.peer, error = %e, "Rejecting malformed request");
                    let status = e.status();
                    let mut controller = match current.take() {
                        Some(controller) => controller,
                        None => Controller::new(Arc::clone(&self.config), self.gate.reserve()),
                    };
                    controller
                        .on_failure(AppError::validation(status, e.to_string()))
                        .await;
                    break;
                }
            };

            match event {
                ParseEvent::Headers { line, headers } => {
                    let mut controller =
                        Controller::new(Arc::clone(&self.config), self.gate.reserve());
                    controller.on_headers_parsed(line, headers).await;
                    current = Some(controller);
                }
                ParseEvent::Body(chunk) => {
                    if let Some(controller) = current.as_mut() {
                        controller.on_body_chunk(chunk).await;
                    }
                }
                ParseEvent::Complete => {
                    if let Some(controller) = current.take() {
                        controller.process();
                    }
                }
            }

            if self.gate.is_closed() {
                self.state = ConnectionState::Closed;
            }
        }

        Ok(())
    }

    /// Reads more bytes, or marks the connection closed on EOF or once a
    /// response has closed it. EOF hangs up every in-flight request.
    async fn fill_buffer(&mut self) -> anyhow::Result<()> {
        tokio::select! {
            read = self.reader.read_buf(&mut self.buffer) => {
                let read = match read {
                    Ok(n) => n,
                    Err(e) => {
                        self.gate.hang_up();
                        return Err(e.into());
                    }
                };
                if read == 0 {
                    if !self.buffer.is_empty() || !self.parser.is_idle() {
                        tracing::debug!(peer = ?self.peer, "Client closed connection mid-request");
                    }
                    self.gate.hang_up();
                    self.state = ConnectionState::Closed;
                }
            }
            _ = self.gate.closed() => {
                self.state = ConnectionState::Closed;
            }
        }
        Ok(())
    }
}
