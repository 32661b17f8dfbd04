//! Per-request lifecycle.
//!
//! A [`Controller`] is created when a request head arrives and owns that
//! request until its response has been handed to the delivery gate:
//!
//! ```text
//!   Parsing ──on_headers_parsed──► Processing ──process()──► Finished
//!                                     │  ▲                     │
//!                                     └──┘ on_body_chunk       ▼
//!                                                      application task
//!                                                      on_application_result
//! ```
//!
//! A client hangup abandons a request that is still running or waiting on a
//! deferred response; its close hook runs instead.
//!
//! Every entry point handles its own failures. Errors are routed to
//! [`Controller::on_failure`] exactly once; failures in cleanup paths are
//! only logged.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::FutureExt;
use tracing::Instrument;

use crate::config::ServerConfig;
use crate::http::context::{Context, Outcome, StreamState};
use crate::http::error::{AppError, failure_response, panic_error};
use crate::http::gate::{GateError, Hangup, Slot};
use crate::http::parser::RequestLine;
use crate::http::request::{Method, RequestState};
use crate::http::response::Response;
use crate::http::writer::ResponseWriter;

pub struct Controller {
    config: Arc<ServerConfig>,
    ctx: Context,
    hangup: Hangup,
    close_notified: bool,
}

impl Controller {
    pub fn new(config: Arc<ServerConfig>, slot: Slot) -> Self {
        let hangup = slot.hangup();
        let mut ctx = Context::new(slot);
        config.app.prepare(&mut ctx);
        Self {
            config,
            ctx,
            hangup,
            close_notified: false,
        }
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn is_finished(&self) -> bool {
        self.ctx.request.is_finished()
    }

    /// Normalizes the request head and runs the head hook.
    pub async fn on_headers_parsed(&mut self, line: RequestLine, headers: Vec<(String, String)>) {
        if self.ctx.request.state() != RequestState::Parsing {
            tracing::warn!(parent: &self.ctx.span, "Request head received twice; ignoring");
            return;
        }

        let request = &mut self.ctx.request;
        request.apply_headers(headers);
        request.apply_request_line(&line);
        request.advance(RequestState::Processing);

        self.ctx.span.record("method", request.method.as_str());
        self.ctx.span.record("path", request.path.as_str());

        if let Some(mut hook) = self.ctx.headers_hook.take() {
            let result = AssertUnwindSafe(hook.after_headers(&mut self.ctx.request))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| Err(panic_error(payload)));

            if let Err(e) = result {
                self.on_failure(e).await;
            }
        }
    }

    /// Hands a body chunk to the body consumer, or buffers it.
    pub async fn on_body_chunk(&mut self, chunk: Bytes) {
        // Answered early by the failure path; the rest of the body is unread noise
        if self.ctx.request.is_finished() {
            return;
        }

        match self.ctx.body_consumer.as_mut() {
            Some(consumer) => {
                let result = AssertUnwindSafe(consumer.consume(chunk))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|payload| Err(panic_error(payload)));

                if let Err(e) = result {
                    self.on_failure(e).await;
                }
            }
            None => self.ctx.request.body.extend(&chunk),
        }
    }

    /// Runs the close hook. Only the first call has any effect.
    pub async fn on_connection_closed(&mut self) {
        if self.close_notified {
            return;
        }
        self.close_notified = true;

        let Some(mut hook) = self.ctx.close_hook.take() else {
            return;
        };

        let result = AssertUnwindSafe(hook.on_close(&self.ctx.request))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(panic_error(payload)));

        if let Err(e) = result {
            tracing::error!(parent: &self.ctx.span, error = ?e, "Close hook failed");
        }
    }

    /// Starts the application for a fully read request.
    ///
    /// The controller moves into the task; the call returns immediately.
    pub fn process(mut self) {
        if self.ctx.request.is_finished() {
            // Already answered by the failure path
            return;
        }

        self.ctx.request.advance(RequestState::Finished);
        self.ctx.request.body.rewind();

        let spawner = Arc::clone(&self.config.spawner);
        let span = self.ctx.span.clone();
        spawner.spawn(Box::pin(self.run().instrument(span)));
    }

    async fn run(mut self) {
        let app = Arc::clone(&self.config.app);
        let result = {
            let call = AssertUnwindSafe(app.call(&mut self.ctx)).catch_unwind();
            tokio::select! {
                biased;
                result = call => Some(result.unwrap_or_else(|payload| Err(panic_error(payload)))),
                _ = self.hangup.wait() => None,
            }
        };
        let Some(result) = result else {
            self.abandon().await;
            return;
        };

        if self.ctx.is_streaming() {
            self.finish_stream(result).await;
            return;
        }

        match result {
            Ok(outcome) => {
                let deferred = matches!(outcome, Outcome::Deferred);
                self.on_application_result(outcome).await;
                if deferred {
                    self.await_deferred().await;
                }
            }
            Err(e) => self.on_failure(e).await,
        }
    }

    async fn await_deferred(&mut self) {
        let Some(pending) = self.ctx.pending.take() else {
            self.on_failure(AppError::msg(
                "application deferred its response without calling defer()",
            ))
            .await;
            return;
        };

        let result = tokio::select! {
            biased;
            result = pending => Some(result),
            _ = self.hangup.wait() => None,
        };
        let Some(result) = result else {
            self.abandon().await;
            return;
        };

        match result {
            Ok(Ok(response)) => self.on_application_result(Outcome::Immediate(response)).await,
            Ok(Err(e)) => self.on_failure(e).await,
            Err(_) => {
                self.on_failure(AppError::msg(
                    "deferred response was dropped without completing",
                ))
                .await
            }
        }
    }

    /// Gives up on a request whose connection went away mid-flight.
    async fn abandon(&mut self) {
        if self.ctx.has_responded() {
            // The response left before the connection did
            self.log_access();
            return;
        }

        tracing::debug!("Connection gone before the request was answered");
        self.ctx.request.terminate = true;
        self.ctx.request.advance(RequestState::Finished);
        self.on_connection_closed().await;
        drop(self.ctx.slot.take());
    }

    /// Accepts the application's output.
    ///
    /// `Deferred` is a no-op; the real response arrives later.
    pub async fn on_application_result(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Deferred => {}
            Outcome::Immediate(response) => self.finalize(response).await,
        }
    }

    /// Turns `error` into the terminal response for this request.
    ///
    /// Forces the connection to close and releases the request's place in the
    /// delivery queue, whatever state it was in.
    pub async fn on_failure(&mut self, error: AppError) {
        self.ctx.request.terminate = true;

        if error.is_disconnect() {
            tracing::debug!(error = %error, "Connection gone while handling request");
            self.on_connection_closed().await;
        }

        if self.ctx.stream == StreamState::Open {
            // The head is already on the wire; all that is left is to cut it short
            tracing::error!(error = ?error, "Failure while streaming response");
            self.close_stream().await;
        } else {
            let response = failure_response(&error, self.config.production);
            self.finalize(response).await;
        }

        self.ctx.request.advance(RequestState::Finished);
        drop(self.ctx.slot.take());
    }

    /// Assembles `response`, writes it through the gate, logs it and hands
    /// the connection on.
    async fn finalize(&mut self, mut response: Response) {
        let Some(mut slot) = self.ctx.slot.take() else {
            tracing::debug!("Response already sent; dropping another one");
            return;
        };

        let head_only = self.ctx.request.method == Method::HEAD;
        let writer = ResponseWriter::new(&mut response, head_only, self.ctx.request.keep_open());
        if writer.close_delimited() {
            self.ctx.request.terminate = true;
        }
        self.ctx.response = response;

        if let Err(e) = writer.write_to(&mut slot).await {
            if e.downcast_ref::<GateError>().is_some() {
                tracing::debug!(error = %e, "Connection gone before response was written");
                drop(slot);
                self.on_connection_closed().await;
                return;
            }
            tracing::error!(error = ?e, "Response body failed mid-write");
            self.ctx.request.terminate = true;
        }

        self.log_access();

        let keep_open = self.ctx.request.keep_open();
        if let Err(e) = slot.release(keep_open).await {
            tracing::debug!(error = %e, "Failed to close connection");
        }
    }

    async fn finish_stream(&mut self, result: Result<Outcome, AppError>) {
        if let Err(e) = result {
            self.on_failure(e).await;
            return;
        }
        if self.ctx.stream == StreamState::Open {
            self.close_stream().await;
        }
        self.log_access();
    }

    async fn close_stream(&mut self) {
        if let Err(e) = self.ctx.stream_close().await {
            tracing::debug!(error = %e, "Failed to close response stream");
        }
    }

    fn log_access(&self) {
        let elapsed_ms = self.ctx.started_at().elapsed().as_secs_f64() * 1000.0;
        let access_log = &self.config.access_log;

        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            access_log.log(&self.ctx.request, &self.ctx.response, elapsed_ms)
        }))
        .unwrap_or_else(|payload| Err(panic_error(payload).into_inner()));

        if let Err(e) = result {
            tracing::warn!(error = %e, "Access log hook failed");
        }
    }
}
