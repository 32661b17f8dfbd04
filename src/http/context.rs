//! What the application sees of an in-flight request.

use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::oneshot;

use crate::http::error::AppError;
use crate::http::gate::Slot;
use crate::http::request::Request;
use crate::http::response::{Response, StatusCode};
use crate::http::writer::{mark_closing, serialize_head};

/// Receives request body chunks instead of the body buffer.
#[async_trait]
pub trait BodyConsumer: Send {
    async fn consume(&mut self, chunk: Bytes) -> Result<(), AppError>;
}

/// Runs once, right after the request head has been normalized.
#[async_trait]
pub trait HeadersHook: Send {
    async fn after_headers(&mut self, request: &mut Request) -> Result<(), AppError>;
}

/// Runs when the client connection goes away before the request completes.
#[async_trait]
pub trait CloseHook: Send {
    async fn on_close(&mut self, request: &Request) -> Result<(), AppError>;
}

/// What the application hands back.
#[derive(Debug)]
pub enum Outcome {
    Immediate(Response),
    /// The response arrives later through the [`Completion`] from [`Context::defer`].
    Deferred,
}

impl From<Response> for Outcome {
    fn from(response: Response) -> Self {
        Outcome::Immediate(response)
    }
}

/// Delivers a deferred response.
#[derive(Debug)]
pub struct Completion {
    tx: oneshot::Sender<Result<Response, AppError>>,
}

impl Completion {
    pub fn complete(self, result: Result<Response, AppError>) {
        if self.tx.send(result).is_err() {
            tracing::debug!("Deferred response arrived after the request was dropped");
        }
    }

    pub fn respond(self, response: Response) {
        self.complete(Ok(response));
    }

    pub fn fail(self, error: impl Into<AppError>) {
        self.complete(Err(error.into()));
    }
}

pub(crate) type Pending = oneshot::Receiver<Result<Response, AppError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamState {
    Idle,
    Open,
    Closed,
}

/// Per-request state shared between the controller and the application.
///
/// The hook slots may be filled in [`Application::prepare`](crate::app::Application::prepare)
/// or while the application runs.
pub struct Context {
    pub request: Request,
    /// Response as last handed to the wire.
    pub response: Response,
    pub body_consumer: Option<Box<dyn BodyConsumer>>,
    pub headers_hook: Option<Box<dyn HeadersHook>>,
    pub close_hook: Option<Box<dyn CloseHook>>,
    /// Span every log line for this request belongs to.
    pub span: tracing::Span,
    pub(crate) pending: Option<Pending>,
    pub(crate) stream: StreamState,
    pub(crate) slot: Option<Slot>,
}

impl Context {
    pub fn new(slot: Slot) -> Self {
        let span = tracing::info_span!(
            "request",
            ticket = slot.ticket(),
            method = tracing::field::Empty,
            path = tracing::field::Empty,
        );
        Self {
            request: Request::new(),
            response: Response::default(),
            body_consumer: None,
            headers_hook: None,
            close_hook: None,
            span,
            pending: None,
            stream: StreamState::Idle,
            slot: Some(slot),
        }
    }

    pub fn started_at(&self) -> Instant {
        self.request.started_at()
    }

    /// Switches this request to a deferred response.
    ///
    /// Return [`Outcome::Deferred`] afterwards and deliver the response through
    /// the returned handle, from any task.
    pub fn defer(&mut self) -> Completion {
        let (tx, rx) = oneshot::channel();
        self.pending = Some(rx);
        Completion { tx }
    }

    /// True once a response (full or streamed) has left through the gate.
    pub fn has_responded(&self) -> bool {
        self.slot.is_none()
    }

    pub fn is_streaming(&self) -> bool {
        self.stream != StreamState::Idle
    }

    /// Writes the status line and headers now, ahead of the body.
    ///
    /// Waits for every earlier response on the connection. The head always
    /// carries `Connection: close`.
    pub async fn stream_start<K, V>(
        &mut self,
        status: impl Into<StatusCode>,
        headers: impl IntoIterator<Item = (K, V)>,
    ) -> Result<(), AppError>
    where
        K: Into<String>,
        V: Into<String>,
    {
        if self.stream != StreamState::Idle {
            return Err(AppError::msg("stream already started"));
        }
        let slot = self
            .slot
            .as_mut()
            .ok_or_else(|| AppError::msg("response already sent"))?;

        self.response = Response::new(status);
        self.response.headers = headers
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        // Streams end with the connection
        mark_closing(&mut self.response.headers);

        let head = serialize_head(self.response.status, &self.response.headers);
        self.stream = StreamState::Open;
        slot.write(&head).await?;
        Ok(())
    }

    /// Writes one body chunk after everything sent before it.
    pub async fn stream_send(&mut self, data: impl Into<Bytes>) -> Result<(), AppError> {
        if self.stream != StreamState::Open {
            return Err(AppError::msg("stream is not open"));
        }
        let slot = self
            .slot
            .as_mut()
            .ok_or_else(|| AppError::msg("stream is not open"))?;

        let data = data.into();
        if !data.is_empty() {
            slot.write(&data).await?;
        }
        Ok(())
    }

    /// Ends the stream and closes the connection after it.
    pub async fn stream_close(&mut self) -> Result<(), AppError> {
        if self.stream != StreamState::Open {
            return Err(AppError::msg("stream is not open"));
        }
        self.stream = StreamState::Closed;
        self.request.terminate = true;

        if let Some(slot) = self.slot.take() {
            slot.release(false).await?;
        }
        Ok(())
    }
}
