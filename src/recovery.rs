use std::{
    any::Any,
    backtrace::Backtrace,
    cell::RefCell,
    io,
    panic::{self, AssertUnwindSafe},
    rc::Rc,
    sync::Once,
};

use futures_util::FutureExt;
use futures_util::future::LocalBoxFuture;
use log::Level;

use actix_service::{Service, Transform};
use actix_utils::future::{Ready, ready};
use actix_web::body::MessageBody;
use actix_web::dev::{ServiceRequest, ServiceResponse};
use actix_web::http::StatusCode;
use actix_web::http::header::HOST;
use actix_web::{Error, HttpResponse, ResponseError, Result};

use crate::config::Config;
use crate::context::{RequestContext, RequestSnapshot};
use crate::field::{CustomField, Field};
use crate::sink::LogSink;

/// The client went away while the response was being written.
///
/// Returned by [`Recovery`] instead of a response. Its status is the
/// non-standard `499 Client Closed Request` with an empty body: the
/// connection is gone, so whatever the server attempts to write is lost.
#[derive(Debug, thiserror::Error)]
#[error("broken connection: {message}")]
pub struct BrokenConnection {
    message: String,
}

impl ResponseError for BrokenConnection {
    fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST)
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::new(self.status_code())
    }
}

/// A downstream service panicked.
///
/// Rendered as an empty `500 Internal Server Error`.
#[derive(Debug, thiserror::Error)]
#[error("panic: {message}")]
pub struct RecoveredPanic {
    message: String,
}

impl ResponseError for RecoveredPanic {
    fn error_response(&self) -> HttpResponse {
        HttpResponse::new(self.status_code())
    }
}

/// Middleware recovering from panics raised by downstream services.
///
/// Panics are logged at error level with the panic message and a dump of the
/// request line and headers. The request then ends with an error: a
/// [`BrokenConnection`] for broken pipe and connection reset panics, a
/// [`RecoveredPanic`] rendered as an empty `500 Internal Server Error` for
/// anything else.
///
/// # Examples
/// ```rust
/// use actix_web::App;
/// use actix_web_middleware_reqlog::{Config, LogSink, Logger, Recovery};
///
/// let app = App::new()
///     .wrap(Recovery::new(LogSink::global(), true, Config::default()))
///     .wrap(Logger::default());
/// ```
pub struct Recovery(Rc<Inner>);

struct Inner {
    sink: LogSink,
    custom_fields: Vec<CustomField>,
    stack: bool,
}

impl Recovery {
    /// Create `Recovery` middleware writing to `sink`.
    ///
    /// With `stack` set, panics other than broken pipes carry a `stack`
    /// field. This installs a process-wide panic hook, chained to the
    /// previous one, that keeps the backtrace of the panicking thread.
    pub fn new(sink: LogSink, stack: bool, config: Config) -> Recovery {
        if stack {
            keep_panic_backtraces();
        }
        Recovery(Rc::new(Inner {
            sink,
            custom_fields: config.custom_fields,
            stack,
        }))
    }
}

impl Default for Recovery {
    fn default() -> Self {
        Recovery::new(LogSink::default(), false, Config::default())
    }
}

impl<S, B> Transform<S, ServiceRequest> for Recovery
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Transform = RecoveryMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RecoveryMiddleware {
            service,
            inner: Rc::clone(&self.0),
        }))
    }
}

/// Recovery middleware service.
pub struct RecoveryMiddleware<S> {
    inner: Rc<Inner>,
    service: S,
}

impl<S, B> Service<ServiceRequest> for RecoveryMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    actix_service::forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let inner = Rc::clone(&self.inner);
        let snapshot = RequestSnapshot::new(req.request());

        let fut = match panic::catch_unwind(AssertUnwindSafe(|| self.service.call(req))) {
            Ok(fut) => fut,
            Err(payload) => {
                return Box::pin(async move { Err(inner.recover(payload, &snapshot)) });
            }
        };

        Box::pin(async move {
            match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(res) => res,
                Err(payload) => Err(inner.recover(payload, &snapshot)),
            }
        })
    }
}

impl Inner {
    fn recover(&self, payload: Box<dyn Any + Send>, req: &RequestSnapshot) -> Error {
        let backtrace = take_panic_backtrace();
        let message = panic_message(&*payload);
        let ctx = RequestContext::from_snapshot(req);

        let mut fields = Vec::with_capacity(3 + self.custom_fields.len());
        fields.push(Field::new("error", message.clone()));
        fields.push(Field::new("request", dump_request(req)));
        fields.extend(self.custom_fields.iter().map(|field| field.produce(&ctx)));

        if is_broken_pipe(&*payload) {
            self.sink.log(Level::Error, ctx.path(), &fields);
            return BrokenConnection { message }.into();
        }

        if self.stack {
            let backtrace = backtrace.unwrap_or_else(Backtrace::force_capture);
            fields.push(Field::new("stack", backtrace.to_string()));
        }
        self.sink.log(Level::Error, "recovery from panic", &fields);

        RecoveredPanic { message }.into()
    }
}

/// Error a recovered panic resolves to.
pub(crate) fn panic_error(payload: &(dyn Any + Send)) -> Error {
    let message = panic_message(payload);
    if is_broken_pipe(payload) {
        BrokenConnection { message }.into()
    } else {
        RecoveredPanic { message }.into()
    }
}

thread_local! {
    static PANIC_BACKTRACE: RefCell<Option<Backtrace>> = const { RefCell::new(None) };
}

fn keep_panic_backtraces() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let backtrace = Backtrace::force_capture();
            let _ = PANIC_BACKTRACE.try_with(|slot| *slot.borrow_mut() = Some(backtrace));
            previous(info);
        }));
    });
}

/// Backtrace of the last panic on this thread, if the hook captured one.
fn take_panic_backtrace() -> Option<Backtrace> {
    PANIC_BACKTRACE
        .try_with(|slot| slot.borrow_mut().take())
        .ok()
        .flatten()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else if let Some(err) = payload.downcast_ref::<io::Error>() {
        err.to_string()
    } else {
        "unknown panic payload".to_string()
    }
}

/// A broken connection is not a condition that warrants a panic stack trace.
fn is_broken_pipe(payload: &(dyn Any + Send)) -> bool {
    if let Some(err) = payload.downcast_ref::<io::Error>() {
        if matches!(
            err.kind(),
            io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
        ) {
            return true;
        }
    }

    let message = panic_message(payload).to_lowercase();
    message.contains("broken pipe") || message.contains("connection reset by peer")
}

/// Request line and headers in HTTP/1 wire format, without the body.
fn dump_request(req: &RequestSnapshot) -> String {
    let target = req.uri.path_and_query().map_or("/", |pq| pq.as_str());
    let mut dump = format!(
        "{} {} {}\r\n",
        req.method,
        target,
        version_str(req.version)
    );
    dump.push_str(&format!("Host: {}\r\n", req.host));

    let mut headers: Vec<_> = req
        .headers
        .iter()
        .filter(|(name, _)| **name != HOST)
        .collect();
    headers.sort_by(|(a, _), (b, _)| a.as_str().cmp(b.as_str()));
    for (name, value) in headers {
        dump.push_str(&format!(
            "{}: {}\r\n",
            name,
            String::from_utf8_lossy(value.as_bytes())
        ));
    }

    dump.push_str("\r\n");
    dump
}

fn version_str(version: actix_http::Version) -> &'static str {
    match version {
        actix_http::Version::HTTP_09 => "HTTP/0.9",
        actix_http::Version::HTTP_10 => "HTTP/1.0",
        actix_http::Version::HTTP_11 => "HTTP/1.1",
        actix_http::Version::HTTP_2 => "HTTP/2.0",
        actix_http::Version::HTTP_3 => "HTTP/3.0",
        _ => "unknown",
    }
}
