use std::collections::BTreeMap;

use bytes::Bytes;
use futures_util::StreamExt;

use crate::http::gate::Slot;
use crate::http::response::{Response, ResponseBody, StatusCode};

const HTTP_VERSION: &str = "HTTP/1.1";

/// Serializes the status line and header block, including the blank line.
pub fn serialize_head(status: StatusCode, headers: &BTreeMap<String, String>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(128);

    // Status line
    let status_line = format!(
        "{} {} {}\r\n",
        HTTP_VERSION,
        status.as_u16(),
        status.reason_phrase()
    );
    buf.extend_from_slice(status_line.as_bytes());

    // Headers
    for (k, v) in headers {
        buf.extend_from_slice(k.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(v.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    // Header/body separator
    buf.extend_from_slice(b"\r\n");

    buf
}

/// Replaces any `Connection` header with `Connection: close`.
pub fn mark_closing(headers: &mut BTreeMap<String, String>) {
    headers.retain(|name, _| !name.eq_ignore_ascii_case("Connection"));
    headers.insert("Connection".to_string(), "close".to_string());
}

/// A response split into wire-ready head bytes and body chunks.
pub struct ResponseWriter {
    head: Vec<u8>,
    body: ResponseBody,
    close_delimited: bool,
}

impl ResponseWriter {
    /// Takes the body out of `response` and fixes up framing headers.
    ///
    /// A `Content-Length` set by the application is kept as is. Otherwise it
    /// is computed when the body length is known; a lazy body without one is
    /// delimited by closing the connection. A response that ends the
    /// connection says so with `Connection: close`.
    pub fn new(response: &mut Response, head_only: bool, keep_open: bool) -> Self {
        let mut body = std::mem::take(&mut response.body);
        let mut close_delimited = false;

        if response.status.forbids_body() {
            body = ResponseBody::Empty;
        } else if response.header("Content-Length").is_none() {
            match body.known_length() {
                Some(len) => {
                    response
                        .headers
                        .insert("Content-Length".to_string(), len.to_string());
                }
                None => close_delimited = true,
            }
        }

        if head_only {
            body = ResponseBody::Empty;
        }
        if close_delimited || !keep_open {
            mark_closing(&mut response.headers);
        }

        Self {
            head: serialize_head(response.status, &response.headers),
            body,
            close_delimited,
        }
    }

    /// True when the end of the body is signalled by closing the connection.
    pub fn close_delimited(&self) -> bool {
        self.close_delimited
    }

    pub fn head(&self) -> &[u8] {
        &self.head
    }

    /// Writes head and body through `slot`, chunk by chunk.
    pub async fn write_to(self, slot: &mut Slot) -> anyhow::Result<()> {
        slot.write(&self.head).await?;

        match self.body {
            ResponseBody::Empty => {}
            ResponseBody::Full(bytes) => write_chunk(slot, &bytes).await?,
            ResponseBody::Chunks(chunks) => {
                for chunk in chunks {
                    write_chunk(slot, &chunk).await?;
                }
            }
            ResponseBody::Stream(mut stream) => {
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk.map_err(|e| e.into_inner().context("response body stream failed"))?;
                    write_chunk(slot, &chunk).await?;
                }
            }
        }

        Ok(())
    }
}

async fn write_chunk(slot: &mut Slot, chunk: &Bytes) -> anyhow::Result<()> {
    if !chunk.is_empty() {
        slot.write(chunk).await?;
    }
    Ok(())
}
