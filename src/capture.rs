use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;

use actix_web::HttpMessage;
use actix_web::dev::{Payload, ServiceRequest};
use actix_web::error::PayloadError;

pub(crate) const SKIP_REQUEST_BODY: &str = "skip request body";
pub(crate) const SKIP_RESPONSE_BODY: &str = "skip response body";
pub(crate) const LARGER_REQUEST_BODY: &str = "larger request body";
pub(crate) const LARGER_RESPONSE_BODY: &str = "larger response body";

/// Read the whole request payload and put an identical payload back, so
/// downstream extractors still see the body.
pub(crate) async fn read_payload(req: &mut ServiceRequest) -> Result<Bytes, PayloadError> {
    let mut payload = req.take_payload();
    let mut body = BytesMut::new();
    while let Some(chunk) = payload.next().await {
        body.extend_from_slice(&chunk?);
    }

    let body = body.freeze();
    req.set_payload(bytes_to_payload(body.clone()));
    Ok(body)
}

fn bytes_to_payload(buf: Bytes) -> Payload {
    let (_, mut payload) = actix_http::h1::Payload::create(true);
    payload.unread_data(buf);
    Payload::from(payload)
}

/// Render a captured body, replacing it with `placeholder` when `len`
/// reaches a non-zero `limit`.
pub(crate) fn render_body(body: &[u8], len: usize, limit: usize, placeholder: &str) -> String {
    if limit > 0 && len >= limit {
        placeholder.to_string()
    } else {
        String::from_utf8_lossy(body).into_owned()
    }
}

/// Copy of the bytes written to a response body.
///
/// Every chunk counts towards the length. Bytes past `limit` are not kept
/// since the rendered body is a placeholder at that point anyway.
#[derive(Debug, Default)]
pub(crate) struct BodyCapture {
    buf: BytesMut,
    len: usize,
    limit: usize,
}

impl BodyCapture {
    pub(crate) fn new(limit: usize) -> Self {
        BodyCapture {
            buf: BytesMut::new(),
            len: 0,
            limit,
        }
    }

    pub(crate) fn write(&mut self, chunk: &[u8]) {
        self.len += chunk.len();
        if self.limit == 0 || self.buf.len() < self.limit {
            self.buf.extend_from_slice(chunk);
        }
    }

    pub(crate) fn render(&self) -> String {
        render_body(&self.buf, self.len, self.limit, LARGER_RESPONSE_BODY)
    }
}
