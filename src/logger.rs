use std::{
    borrow::Cow,
    panic::{self, AssertUnwindSafe},
    pin::Pin,
    rc::Rc,
    task::{Context, Poll},
};

use bytes::Bytes;
use futures_core::ready;
use futures_util::FutureExt;
use futures_util::future::LocalBoxFuture;
use log::Level;
use pin_project_lite::pin_project;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

use actix_service::{Service, Transform};
use actix_utils::future::{Ready, ready};
use actix_web::body::{BodySize, MessageBody};
use actix_web::dev::{ServiceRequest, ServiceResponse};
use actix_web::http::header::USER_AGENT;
use actix_web::{Error, Result};

use crate::capture::{self, BodyCapture};
use crate::config::{Config, FieldName};
use crate::context::{RecordedErrors, RequestContext, RequestSnapshot};
use crate::field::{Field, Value};
use crate::recovery;
use crate::sink::LogSink;

const MESSAGE: &str = "access log";

/// Middleware emitting one structured record per request.
///
/// The record is written once the response body has been sent, so latency
/// covers body streaming and the captured response body is complete.
///
/// # Default Format
/// Fields: `status`, `method`, `path`, `route`, `query`, `ip`,
/// `user-agent`, `latency`, followed by custom fields and one `error` field
/// per recorded error. With [`Config::enable_body`], `requestBody` and
/// `responseBody` follow `latency`.
///
/// # Examples
/// ```rust
/// use actix_web::App;
/// use actix_web_middleware_reqlog::Logger;
///
/// let app = App::new()
///     .wrap(Logger::default());
/// ```
pub struct Logger(Rc<Inner>);

struct Inner {
    sink: LogSink,
    config: Config,
}

impl Logger {
    /// Create `Logger` middleware writing to `sink`.
    pub fn new(sink: LogSink, config: Config) -> Logger {
        Logger(Rc::new(Inner { sink, config }))
    }
}

impl Default for Logger {
    /// Global `log` logger, default [`Config`].
    fn default() -> Self {
        Logger::new(LogSink::default(), Config::default())
    }
}

impl<S, B> Transform<S, ServiceRequest> for Logger
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<StreamLog<B>>;
    type Error = Error;
    type Transform = LoggerMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(LoggerMiddleware {
            service: Rc::new(service),
            inner: Rc::clone(&self.0),
        }))
    }
}

/// Logger middleware service.
pub struct LoggerMiddleware<S> {
    inner: Rc<Inner>,
    service: Rc<S>,
}

impl<S, B> Service<ServiceRequest> for LoggerMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<StreamLog<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    actix_service::forward_ready!(service);

    fn call(&self, mut req: ServiceRequest) -> Self::Future {
        let service = Rc::clone(&self.service);
        let inner = Rc::clone(&self.inner);

        Box::pin(async move {
            let config = &inner.config;

            if config.is_excluded(req.path()) {
                let res = service.call(req).await?;
                return Ok(res.map_body(|_, body| StreamLog::passthrough(body)));
            }

            let mut request_body = None;
            if config.enable_body {
                request_body = Some(capture::SKIP_REQUEST_BODY.to_string());
                if !config.skips_request_body(req.request()) {
                    let body = capture::read_payload(&mut req)
                        .await
                        .map_err(actix_web::error::ErrorInternalServerError)?;
                    request_body = Some(capture::render_body(
                        &body,
                        body.len(),
                        config.limit,
                        capture::LARGER_REQUEST_BODY,
                    ));
                }
            }

            // downstream middlewares may rewrite the request
            let summary = Summary {
                start: OffsetDateTime::now_utc(),
                request: RequestSnapshot::new(req.request()),
                request_body,
            };
            let recorded = RecordedErrors::attach(req.request());

            let called = AssertUnwindSafe(async { service.call(req).await })
                .catch_unwind()
                .await;
            let res = match called {
                Ok(Ok(res)) => res,
                Ok(Err(err)) => {
                    inner.log_failure(&summary, &recorded, &err);
                    return Err(err);
                }
                Err(payload) => {
                    inner.log_failure(&summary, &recorded, &recovery::panic_error(&*payload));
                    panic::resume_unwind(payload);
                }
            };

            let mut errors = recorded.to_vec();
            if let Some(err) = res.response().error() {
                errors.push(err.to_string());
            }

            let record = {
                let ctx = RequestContext::new(res.request())
                    .with_response(res.response().head())
                    .with_errors(&errors);
                if (config.skip_logging)(&ctx) {
                    None
                } else {
                    Some(PendingRecord::new(config, &ctx, &summary))
                }
            };

            let capture = record
                .as_ref()
                .filter(|record| record.captures_response())
                .map(|_| BodyCapture::new(config.limit));
            let sink = inner.sink.clone();

            Ok(res.map_body(move |_, body| StreamLog {
                body,
                record,
                capture,
                sink: Some(sink),
            }))
        })
    }
}

impl Inner {
    /// Log a request whose downstream service returned an error or
    /// panicked. The request itself is gone, so the record is built from
    /// the summary.
    fn log_failure(&self, summary: &Summary, recorded: &RecordedErrors, err: &Error) {
        let mut errors = recorded.to_vec();
        errors.push(err.to_string());
        let ctx = RequestContext::from_snapshot(&summary.request)
            .with_status(err.as_response_error().status_code())
            .with_errors(&errors);
        if !(self.config.skip_logging)(&ctx) {
            let (level, fields) = PendingRecord::new(&self.config, &ctx, summary).finish(None);
            self.sink.log(level, MESSAGE, &fields);
        }
    }
}

/// Request data taken before calling downstream.
struct Summary {
    start: OffsetDateTime,
    request: RequestSnapshot,
    request_body: Option<String>,
}

/// Access log record waiting for the end of the response body.
struct PendingRecord {
    level: Level,
    start: OffsetDateTime,
    head: Vec<Field>,
    latency: Cow<'static, str>,
    bodies: Option<Bodies>,
    tail: Vec<Field>,
}

struct Bodies {
    request: Field,
    response_key: Cow<'static, str>,
    skip_response: bool,
}

impl PendingRecord {
    fn new(config: &Config, ctx: &RequestContext<'_>, summary: &Summary) -> Self {
        let names = config.field_names();
        let req = RequestContext::from_snapshot(&summary.request);

        let level = if ctx.errors().is_empty() {
            (config.logger_level)(ctx)
        } else {
            Level::Error
        };

        let status = ctx.status().map_or(0, |status| i64::from(status.as_u16()));
        let route = ctx
            .request()
            .and_then(|live| live.match_pattern())
            .unwrap_or_default();
        let user_agent = req
            .headers()
            .get(USER_AGENT)
            .map(|v| v.to_str().unwrap_or_default().to_string())
            .unwrap_or_default();

        let head = vec![
            Field::new(names.get(FieldName::Status).clone(), status),
            Field::new(names.get(FieldName::Method).clone(), req.method().as_str()),
            Field::new(names.get(FieldName::Path).clone(), req.path()),
            Field::new(names.get(FieldName::Route).clone(), route),
            Field::new(names.get(FieldName::Query).clone(), req.query()),
            Field::new(names.get(FieldName::Ip).clone(), req.client_ip()),
            Field::new(names.get(FieldName::UserAgent).clone(), user_agent),
        ];

        let bodies = config.enable_body.then(|| Bodies {
            request: Field::new(
                names.get(FieldName::RequestBody).clone(),
                summary
                    .request_body
                    .clone()
                    .unwrap_or_else(|| capture::SKIP_REQUEST_BODY.to_string()),
            ),
            response_key: names.get(FieldName::ResponseBody).clone(),
            skip_response: (config.skip_response_body)(ctx),
        });

        let mut tail = Vec::with_capacity(1 + config.custom_fields.len() + ctx.errors().len());
        if config.datetime {
            if let Ok(time) = summary.start.format(&Rfc3339) {
                tail.push(Field::new("time", time));
            }
        }
        tail.extend(config.custom_fields.iter().map(|field| field.produce(ctx)));
        tail.extend(
            ctx.errors()
                .iter()
                .map(|err| Field::new("error", err.as_str())),
        );

        PendingRecord {
            level,
            start: summary.start,
            head,
            latency: names.get(FieldName::Latency).clone(),
            bodies,
            tail,
        }
    }

    fn captures_response(&self) -> bool {
        self.bodies.as_ref().is_some_and(|bodies| !bodies.skip_response)
    }

    fn finish(self, capture: Option<&BodyCapture>) -> (Level, Vec<Field>) {
        let latency = (OffsetDateTime::now_utc() - self.start).unsigned_abs();

        let mut fields = self.head;
        fields.push(Field::new(self.latency, latency));
        if let Some(bodies) = self.bodies {
            let response = if bodies.skip_response {
                capture::SKIP_RESPONSE_BODY.to_string()
            } else {
                capture.map(BodyCapture::render).unwrap_or_default()
            };
            fields.push(bodies.request);
            fields.push(Field::new(bodies.response_key, Value::Str(response)));
        }
        fields.extend(self.tail);

        (self.level, fields)
    }
}

pin_project! {
    /// Response body wrapper.
    ///
    /// Forwards every chunk unchanged, duplicating it into the capture buffer
    /// when response bodies are logged. The pending record is written when
    /// the body is dropped.
    pub struct StreamLog<B> {
        #[pin]
        body: B,
        record: Option<PendingRecord>,
        capture: Option<BodyCapture>,
        sink: Option<LogSink>,
    }

    impl<B> PinnedDrop for StreamLog<B> {
        fn drop(this: Pin<&mut Self>) {
            let this = this.project();
            if let (Some(record), Some(sink)) = (this.record.take(), this.sink.as_ref()) {
                let (level, fields) = record.finish(this.capture.as_ref());
                sink.log(level, MESSAGE, &fields);
            }
        }
    }
}

impl<B> StreamLog<B> {
    fn passthrough(body: B) -> Self {
        StreamLog {
            body,
            record: None,
            capture: None,
            sink: None,
        }
    }
}

impl<B: MessageBody> MessageBody for StreamLog<B> {
    type Error = B::Error;

    #[inline]
    fn size(&self) -> BodySize {
        self.body.size()
    }

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Bytes, Self::Error>>> {
        let this = self.project();

        match ready!(this.body.poll_next(cx)) {
            Some(Ok(chunk)) => {
                if let Some(capture) = this.capture {
                    capture.write(&chunk);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Some(Err(err)) => Poll::Ready(Some(Err(err))),
            None => Poll::Ready(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::record_error;
    use crate::field::{self, CustomField};
    use crate::sink::testing::{Captured, MemoryLogger};
    use actix_web::http::StatusCode;
    use actix_web::dev::Payload;
    use actix_web::error::PayloadError;
    use actix_web::test::{TestRequest, call_service, init_service, read_body};
    use actix_web::{App, HttpRequest, HttpResponse, web};
    use std::cell::Cell;

    async fn ping() -> &'static str {
        "pong"
    }

    async fn echo(body: Bytes) -> HttpResponse {
        HttpResponse::Ok().content_type("text/plain").body(body)
    }

    async fn user(id: web::Path<u32>) -> String {
        format!("user {}", id.into_inner())
    }

    async fn with_errors(req: HttpRequest) -> HttpResponse {
        record_error(&req, "An error happen 1");
        record_error(&req, "An error happen 2");
        HttpResponse::Ok().finish()
    }

    async fn missing() -> HttpResponse {
        HttpResponse::NotFound().finish()
    }

    async fn invalid() -> Result<HttpResponse, Error> {
        Err(actix_web::error::ErrorBadRequest("invalid payload"))
    }

    async fn request(config: Config, req: TestRequest) -> (StatusCode, Bytes, Vec<Captured>) {
        let memory = MemoryLogger::default();
        let app = init_service(
            App::new()
                .wrap(Logger::new(memory.sink(), config))
                .route("/ping", web::get().to(ping))
                .route("/echo", web::post().to(echo))
                .route("/users/{id}", web::get().to(user))
                .route("/errors", web::get().to(with_errors))
                .route("/missing", web::get().to(missing))
                .route("/invalid", web::get().to(invalid)),
        )
        .await;

        let res = call_service(&app, req.to_request()).await;
        let status = res.status();
        let body = read_body(res).await;
        (status, body, memory.records())
    }

    #[actix_web::test]
    async fn test_one_record_per_request() {
        let req = TestRequest::get()
            .uri("/ping?lang=en")
            .insert_header(("user-agent", "test-agent"))
            .peer_addr("127.0.0.1:50000".parse().unwrap());
        let (status, body, records) = request(Config::default(), req).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Bytes::from_static(b"pong"));
        assert_eq!(records.len(), 1);

        let record = &records[0];
        assert_eq!(record.level, Level::Info);
        assert_eq!(record.message, "access log");
        assert_eq!(
            record.keys(),
            ["status", "method", "path", "route", "query", "ip", "user-agent", "latency"]
        );
        assert_eq!(record.get("status"), Some("200"));
        assert_eq!(record.get("method"), Some("GET"));
        assert_eq!(record.get("path"), Some("/ping"));
        assert_eq!(record.get("route"), Some("/ping"));
        assert_eq!(record.get("query"), Some("lang=en"));
        assert_eq!(record.get("user-agent"), Some("test-agent"));
        assert!(record.get("ip").unwrap().starts_with("127.0.0.1"));

        let latency: f64 = record.get("latency").unwrap().parse().unwrap();
        assert!((0.0..5.0).contains(&latency));
    }

    #[actix_web::test]
    async fn test_route_is_matched_pattern() {
        let req = TestRequest::get().uri("/users/42");
        let (_, body, records) = request(Config::default(), req).await;

        assert_eq!(body, Bytes::from_static(b"user 42"));
        assert_eq!(records[0].get("path"), Some("/users/42"));
        assert_eq!(records[0].get("route"), Some("/users/{id}"));
    }

    #[actix_web::test]
    async fn test_level_follows_status() {
        let req = TestRequest::get().uri("/missing");
        let (status, _, records) = request(Config::default(), req).await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].level, Level::Warn);
        assert_eq!(records[0].get("status"), Some("404"));
    }

    #[actix_web::test]
    async fn test_level_selector() {
        let config = Config::default().logger_level(|_| Level::Debug);
        let req = TestRequest::get().uri("/missing");
        let (_, _, records) = request(config, req).await;

        assert_eq!(records[0].level, Level::Debug);
    }

    #[actix_web::test]
    async fn test_recorded_errors() {
        let config = Config::default().logger_level(|_| Level::Debug);
        let req = TestRequest::get().uri("/errors");
        let (status, _, records) = request(config, req).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].level, Level::Error);
        assert_eq!(
            records[0].all("error"),
            ["An error happen 1", "An error happen 2"]
        );
    }

    #[actix_web::test]
    async fn test_handler_error() {
        let req = TestRequest::get().uri("/invalid");
        let (status, _, records) = request(Config::default(), req).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(records[0].level, Level::Error);
        assert_eq!(records[0].get("status"), Some("400"));
        assert_eq!(records[0].all("error"), ["invalid payload"]);
    }

    #[actix_web::test]
    async fn test_skip_logging() {
        let config = Config::default().skip_logging(|ctx| ctx.path() == "/ping");
        let (_, body, records) = request(config.clone(), TestRequest::get().uri("/ping")).await;
        assert_eq!(body, Bytes::from_static(b"pong"));
        assert!(records.is_empty());

        let (_, _, records) = request(config, TestRequest::get().uri("/users/1")).await;
        assert_eq!(records.len(), 1);
    }

    #[actix_web::test]
    async fn test_skip_logging_sees_status() {
        let config = Config::default()
            .skip_logging(|ctx| ctx.status().is_some_and(|status| status.is_success()));
        let (_, _, records) = request(config.clone(), TestRequest::get().uri("/ping")).await;
        assert!(records.is_empty());

        let (_, _, records) = request(config, TestRequest::get().uri("/missing")).await;
        assert_eq!(records.len(), 1);
    }

    #[actix_web::test]
    async fn test_excluded_paths() {
        let config = Config::default()
            .exclude("/ping")
            .exclude_regex("^/users/.*")
            .unwrap()
            .enable_body(true);

        let (_, body, records) = request(config.clone(), TestRequest::get().uri("/ping")).await;
        assert_eq!(body, Bytes::from_static(b"pong"));
        assert!(records.is_empty());

        let (_, _, records) = request(config, TestRequest::get().uri("/users/9")).await;
        assert!(records.is_empty());
    }

    #[actix_web::test]
    async fn test_bodies_not_logged_by_default() {
        let req = TestRequest::post().uri("/echo").set_payload("secret");
        let (_, body, records) = request(Config::default(), req).await;

        assert_eq!(body, Bytes::from_static(b"secret"));
        assert!(records[0].get("requestBody").is_none());
        assert!(records[0].get("responseBody").is_none());
        assert!(records[0].fields.iter().all(|(_, v)| v != "secret"));
    }

    #[actix_web::test]
    async fn test_bodies_logged() {
        let config = Config::default().enable_body(true);
        let req = TestRequest::post()
            .uri("/echo")
            .set_payload("hello world");
        let (_, body, records) = request(config, req).await;

        // downstream still reads the request body
        assert_eq!(body, Bytes::from_static(b"hello world"));
        let record = &records[0];
        assert_eq!(
            record.keys(),
            [
                "status",
                "method",
                "path",
                "route",
                "query",
                "ip",
                "user-agent",
                "latency",
                "requestBody",
                "responseBody"
            ]
        );
        assert_eq!(record.get("requestBody"), Some("hello world"));
        assert_eq!(record.get("responseBody"), Some("hello world"));
    }

    #[actix_web::test]
    async fn test_bodies_over_limit() {
        let config = Config::default().enable_body(true).body_limit(5);
        let req = TestRequest::post()
            .uri("/echo")
            .set_payload("hello world");
        let (_, body, records) = request(config, req).await;

        assert_eq!(body, Bytes::from_static(b"hello world"));
        assert_eq!(records[0].get("requestBody"), Some("larger request body"));
        assert_eq!(records[0].get("responseBody"), Some("larger response body"));
    }

    #[actix_web::test]
    async fn test_multipart_request_body_skipped() {
        let config = Config::default().enable_body(true);
        let req = TestRequest::post()
            .uri("/echo")
            .insert_header(("content-type", "multipart/form-data; boundary=xyz"))
            .set_payload("--xyz--");
        let (_, body, records) = request(config, req).await;

        assert_eq!(body, Bytes::from_static(b"--xyz--"));
        assert_eq!(records[0].get("requestBody"), Some("skip request body"));
        assert_eq!(records[0].get("responseBody"), Some("--xyz--"));
    }

    #[actix_web::test]
    async fn test_skip_body_predicates() {
        let config = Config::default()
            .enable_body(true)
            .skip_request_body(|ctx| ctx.path() == "/echo")
            .skip_response_body(|ctx| ctx.status() == Some(StatusCode::OK));
        let req = TestRequest::post().uri("/echo").set_payload("data");
        let (_, body, records) = request(config, req).await;

        assert_eq!(body, Bytes::from_static(b"data"));
        assert_eq!(records[0].get("requestBody"), Some("skip request body"));
        assert_eq!(records[0].get("responseBody"), Some("skip response body"));
    }

    #[actix_web::test]
    async fn test_custom_fields() {
        let config = Config::default()
            .custom_fields([
                field::string("service", "example"),
                field::int("shard", 7),
                CustomField::new(|ctx| {
                    let status = ctx.status().map_or(0, |status| status.as_u16());
                    Field::new("custom", format!("{} {}", ctx.path(), status))
                }),
            ])
            .with_datetime();
        let (_, _, records) = request(config, TestRequest::get().uri("/ping")).await;

        let record = &records[0];
        assert_eq!(record.get("service"), Some("example"));
        assert_eq!(record.get("shard"), Some("7"));
        assert_eq!(record.get("custom"), Some("/ping 200"));
        assert_eq!(&record.keys()[8..], ["time", "service", "shard", "custom"]);
    }

    #[actix_web::test]
    async fn test_renamed_fields() {
        let config = Config::default()
            .field_name(FieldName::Status, "httpStatusCode")
            .field_name(FieldName::UserAgent, "ua");
        let (_, _, records) = request(config, TestRequest::get().uri("/ping")).await;

        assert_eq!(records[0].get("httpStatusCode"), Some("200"));
        assert!(records[0].get("status").is_none());
        assert_eq!(records[0].keys()[6], "ua");
    }

    #[actix_web::test]
    async fn test_downstream_error_is_logged_and_propagated() {
        let memory = MemoryLogger::default();
        let app = init_service(
            App::new()
                .wrap_fn(|_req, _srv| {
                    ready(Err::<actix_web::dev::ServiceResponse, _>(
                        actix_web::error::ErrorServiceUnavailable("backend down"),
                    ))
                })
                .wrap(Logger::new(memory.sink(), Config::default()))
                .route("/ping", web::get().to(ping)),
        )
        .await;

        let result = app.call(TestRequest::get().uri("/ping").to_request()).await;
        let err = match result {
            Ok(_) => panic!("downstream error should propagate"),
            Err(err) => err,
        };
        assert_eq!(
            err.as_response_error().status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );

        let records = memory.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].level, Level::Error);
        assert_eq!(records[0].get("status"), Some("503"));
        assert_eq!(records[0].all("error"), ["backend down"]);
    }

    #[actix_web::test]
    async fn test_unreadable_request_body() {
        let memory = MemoryLogger::default();
        let called = Rc::new(Cell::new(false));
        let flag = Rc::clone(&called);
        let downstream = actix_service::fn_service(move |req: ServiceRequest| {
            flag.set(true);
            async move { Ok::<_, Error>(req.into_response(HttpResponse::Ok().finish())) }
        });

        let logger = Logger::new(memory.sink(), Config::default().enable_body(true));
        let middleware = logger.new_transform(downstream).await.unwrap();

        let mut req = TestRequest::post().uri("/echo").to_srv_request();
        req.set_payload(Payload::Stream {
            payload: Box::pin(futures_util::stream::once(async {
                Err::<Bytes, _>(PayloadError::Overflow)
            })),
        });

        let err = match middleware.call(req).await {
            Ok(_) => panic!("unreadable body must fail the request"),
            Err(err) => err,
        };
        assert_eq!(
            err.as_response_error().status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert!(!called.get());
        assert!(memory.records().is_empty());
    }

    #[test]
    fn test_pending_record_without_capture() {
        let req = TestRequest::get().uri("/ping").to_http_request();
        let config = Config::default().enable_body(true);
        let ctx = RequestContext::new(&req).with_status(StatusCode::OK);
        let summary = Summary {
            start: OffsetDateTime::now_utc(),
            request: RequestSnapshot::new(&req),
            request_body: None,
        };

        let (level, fields) = PendingRecord::new(&config, &ctx, &summary).finish(None);
        assert_eq!(level, Level::Info);
        assert_eq!(fields[2], Field::new("path", "/ping"));
        assert_eq!(fields[8], Field::new("requestBody", "skip request body"));
        assert_eq!(fields[9], Field::new("responseBody", ""));
    }
}
