//! The application seam.

use async_trait::async_trait;

use crate::http::context::{Context, Outcome};
use crate::http::error::AppError;
use crate::http::response::{Response, StatusCode};

/// Application logic invoked once per request.
///
/// `call` runs as its own task and may suspend freely; other requests on the
/// same connection keep being processed meanwhile.
#[async_trait]
pub trait Application: Send + Sync + 'static {
    /// Runs when the request context is created, before its head is
    /// normalized. Install body consumers and head hooks here.
    fn prepare(&self, _ctx: &mut Context) {}

    async fn call(&self, ctx: &mut Context) -> Result<Outcome, AppError>;
}

/// Default application of the binary.
pub struct Hello;

#[async_trait]
impl Application for Hello {
    async fn call(&self, ctx: &mut Context) -> Result<Outcome, AppError> {
        let request = &ctx.request;
        let body = format!(
            "Hello from orderly\n{} {} {}\n",
            request.method,
            request.path,
            request.protocol()
        );
        Ok(Response::text(StatusCode::OK, body).into())
    }
}
