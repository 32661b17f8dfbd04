//! Access logging.

use crate::http::request::Request;
use crate::http::response::Response;

/// Called once per completed request, after its response has been flushed.
///
/// Errors are logged and otherwise ignored.
pub trait AccessLog: Send + Sync {
    fn log(&self, request: &Request, response: &Response, elapsed_ms: f64) -> anyhow::Result<()>;
}

impl<F> AccessLog for F
where
    F: Fn(&Request, &Response, f64) -> anyhow::Result<()> + Send + Sync,
{
    fn log(&self, request: &Request, response: &Response, elapsed_ms: f64) -> anyhow::Result<()> {
        self(request, response, elapsed_ms)
    }
}

/// Emits one `info` event per request on the `access` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAccessLog;

impl AccessLog for TracingAccessLog {
    fn log(&self, request: &Request, response: &Response, elapsed_ms: f64) -> anyhow::Result<()> {
        tracing::info!(
            target: "access",
            method = %request.method,
            path = %request.path,
            query = request.query.as_deref().unwrap_or(""),
            http = %request.protocol(),
            status = response.status.as_u16(),
            duration_ms = elapsed_ms,
            ua = request.header("HTTP_USER_AGENT").unwrap_or("-"),
            "request completed"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoAccessLog;

impl AccessLog for NoAccessLog {
    fn log(&self, _: &Request, _: &Response, _: f64) -> anyhow::Result<()> {
        Ok(())
    }
}
