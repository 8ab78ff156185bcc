use std::{cell::RefCell, fmt, rc::Rc};

use actix_web::HttpMessage;
use actix_web::HttpRequest;
use actix_web::dev::ResponseHead;
use actix_web::http::header::HeaderMap;
use actix_web::http::{Method, StatusCode, Uri, Version};

/// Read-only view of the current exchange, handed to predicates, level
/// selectors and custom field producers.
///
/// Response data is only available after the downstream service has
/// produced a response.
pub struct RequestContext<'a> {
    source: Source<'a>,
    status: Option<StatusCode>,
    response_headers: Option<&'a HeaderMap>,
    errors: &'a [String],
}

enum Source<'a> {
    Live(&'a HttpRequest),
    Snapshot(&'a RequestSnapshot),
}

impl<'a> RequestContext<'a> {
    pub(crate) fn new(request: &'a HttpRequest) -> Self {
        Self::with_source(Source::Live(request))
    }

    pub(crate) fn from_snapshot(snapshot: &'a RequestSnapshot) -> Self {
        Self::with_source(Source::Snapshot(snapshot))
    }

    fn with_source(source: Source<'a>) -> Self {
        RequestContext {
            source,
            status: None,
            response_headers: None,
            errors: &[],
        }
    }

    pub(crate) fn with_response(mut self, head: &'a ResponseHead) -> Self {
        self.status = Some(head.status);
        self.response_headers = Some(&head.headers);
        self
    }

    pub(crate) fn with_status(mut self, status: StatusCode) -> Self {
        self.status = Some(status);
        self
    }

    pub(crate) fn with_errors(mut self, errors: &'a [String]) -> Self {
        self.errors = errors;
        self
    }

    /// The live request.
    ///
    /// `None` when the downstream service failed or panicked: the request
    /// was consumed and only the data copied before the call is left.
    pub fn request(&self) -> Option<&'a HttpRequest> {
        match self.source {
            Source::Live(req) => Some(req),
            Source::Snapshot(_) => None,
        }
    }

    pub fn method(&self) -> &'a Method {
        match self.source {
            Source::Live(req) => req.method(),
            Source::Snapshot(snapshot) => &snapshot.method,
        }
    }

    pub fn uri(&self) -> &'a Uri {
        match self.source {
            Source::Live(req) => req.uri(),
            Source::Snapshot(snapshot) => &snapshot.uri,
        }
    }

    pub fn path(&self) -> &'a str {
        self.uri().path()
    }

    /// Raw query string, empty when absent.
    pub fn query(&self) -> &'a str {
        self.uri().query().unwrap_or_default()
    }

    pub fn headers(&self) -> &'a HeaderMap {
        match self.source {
            Source::Live(req) => req.headers(),
            Source::Snapshot(snapshot) => &snapshot.headers,
        }
    }

    /// Response status, once known.
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    pub fn response_headers(&self) -> Option<&'a HeaderMap> {
        self.response_headers
    }

    /// Errors recorded for this request, see [`record_error`].
    pub fn errors(&self) -> &'a [String] {
        self.errors
    }

    /// Client IP, honouring `Forwarded` and `X-Forwarded-For` headers.
    /// Empty when unknown.
    pub fn client_ip(&self) -> String {
        match self.source {
            Source::Live(req) => client_ip(req),
            Source::Snapshot(snapshot) => snapshot.ip.clone(),
        }
    }
}

fn client_ip(req: &HttpRequest) -> String {
    req.connection_info()
        .realip_remote_addr()
        .unwrap_or_default()
        .to_string()
}

/// Owned copy of the request head.
///
/// Routing needs the only handle to the request, so middlewares copy what
/// they log before calling downstream instead of keeping a clone.
#[derive(Debug, Clone)]
pub(crate) struct RequestSnapshot {
    pub(crate) method: Method,
    pub(crate) uri: Uri,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
    pub(crate) host: String,
    pub(crate) ip: String,
}

impl RequestSnapshot {
    pub(crate) fn new(req: &HttpRequest) -> Self {
        RequestSnapshot {
            method: req.method().clone(),
            uri: req.uri().clone(),
            version: req.version(),
            headers: req.headers().clone(),
            host: req.connection_info().host().to_string(),
            ip: client_ip(req),
        }
    }
}

/// Errors recorded for one request.
///
/// Shared with the request extensions so the list survives the request
/// being consumed downstream.
#[derive(Debug, Clone, Default)]
pub(crate) struct RecordedErrors(Rc<RefCell<Vec<String>>>);

impl RecordedErrors {
    /// Handle stored in `req` extensions, inserted when missing.
    pub(crate) fn attach(req: &HttpRequest) -> Self {
        if let Some(errors) = req.extensions().get::<RecordedErrors>() {
            return errors.clone();
        }
        let errors = RecordedErrors::default();
        req.extensions_mut().insert(errors.clone());
        errors
    }

    pub(crate) fn to_vec(&self) -> Vec<String> {
        self.0.borrow().clone()
    }
}

/// Record a request-scoped error.
///
/// Recorded errors do not abort the request. [`Logger`](crate::Logger)
/// logs the request at error level and attaches one `error` field per
/// recorded error.
///
/// # Examples
/// ```rust
/// use actix_web::{HttpRequest, HttpResponse};
/// use actix_web_middleware_reqlog::record_error;
///
/// async fn handler(req: HttpRequest) -> HttpResponse {
///     record_error(&req, "cache unavailable, served from origin");
///     HttpResponse::Ok().finish()
/// }
/// ```
pub fn record_error(req: &HttpRequest, err: impl fmt::Display) {
    RecordedErrors::attach(req).0.borrow_mut().push(err.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::HttpResponse;
    use actix_web::test::TestRequest;

    #[test]
    fn test_record_error_accumulates() {
        let req = TestRequest::default().to_http_request();
        let errors = RecordedErrors::attach(&req);
        assert!(errors.to_vec().is_empty());

        record_error(&req, "first");
        record_error(&req, std::io::Error::other("second"));
        assert_eq!(errors.to_vec(), vec!["first", "second"]);
        assert_eq!(RecordedErrors::attach(&req).to_vec(), vec!["first", "second"]);
    }

    #[test]
    fn test_recorded_errors_outlive_request() {
        let req = TestRequest::default().to_http_request();
        let errors = RecordedErrors::attach(&req);
        record_error(&req, "late failure");
        drop(req);

        assert_eq!(errors.to_vec(), vec!["late failure"]);
    }

    #[test]
    fn test_context_response_data() {
        let req = TestRequest::default()
            .uri("/health?verbose=1")
            .peer_addr("10.0.0.7:41000".parse().unwrap())
            .to_http_request();
        let res = HttpResponse::NotFound()
            .insert_header(("content-type", "text/plain"))
            .finish();
        let errors = vec!["boom".to_string()];

        let ctx = RequestContext::new(&req);
        assert_eq!(ctx.status(), None);
        assert!(ctx.response_headers().is_none());
        assert!(ctx.errors().is_empty());
        assert!(ctx.request().is_some());

        let ctx = ctx.with_response(res.head()).with_errors(&errors);
        assert_eq!(ctx.path(), "/health");
        assert_eq!(ctx.query(), "verbose=1");
        assert_eq!(ctx.status(), Some(StatusCode::NOT_FOUND));
        assert_eq!(
            ctx.response_headers()
                .and_then(|h| h.get("content-type"))
                .and_then(|v| v.to_str().ok()),
            Some("text/plain")
        );
        assert_eq!(ctx.errors(), ["boom"]);
        assert!(ctx.client_ip().starts_with("10.0.0.7"));
    }

    #[test]
    fn test_snapshot_context() {
        let req = TestRequest::post()
            .uri("/orders?draft=1")
            .insert_header(("user-agent", "curl/8.0"))
            .insert_header(("x-forwarded-for", "203.0.113.9"))
            .to_http_request();
        let snapshot = RequestSnapshot::new(&req);
        drop(req);

        let ctx = RequestContext::from_snapshot(&snapshot).with_status(StatusCode::BAD_GATEWAY);
        assert!(ctx.request().is_none());
        assert_eq!(ctx.method(), &Method::POST);
        assert_eq!(ctx.path(), "/orders");
        assert_eq!(ctx.query(), "draft=1");
        assert_eq!(ctx.headers().get("user-agent").unwrap(), "curl/8.0");
        assert_eq!(ctx.client_ip(), "203.0.113.9");
        assert_eq!(ctx.status(), Some(StatusCode::BAD_GATEWAY));
    }

    #[test]
    fn test_client_ip_from_forwarded_header() {
        let req = TestRequest::default()
            .insert_header(("x-forwarded-for", "203.0.113.9"))
            .to_http_request();
        let ctx = RequestContext::new(&req);
        assert_eq!(ctx.client_ip(), "203.0.113.9");
    }
}
