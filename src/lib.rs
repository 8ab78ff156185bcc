//! Actix-web middlewares for structured access logs and panic recovery.
//!
//! - [`Logger`] emits one structured `log` record per request: status,
//!   method, path, matched route, query, client IP, user agent, latency and,
//!   optionally, request and response bodies and custom fields.
//! - [`Recovery`] catches panics raised by downstream services, logs them and
//!   ends the request with an empty `500 Internal Server Error`.
//!
//! # Examples:
//! ## Records are written through the standard `log` crate.
//! ```bash
//! cargo add actix-web-middleware-reqlog
//! ```
//! Example usage with `structured_logger` crate:
//! ```rust,no_run
//! use actix_web::{web, App, HttpServer};
//! use actix_web_middleware_reqlog::{Config, LogSink, Logger, Recovery, field};
//! use structured_logger::{Builder, async_json::new_writer};
//!
//! #[actix_web::main] // or #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     Builder::new()
//!         .with_target_writer("*", new_writer(tokio::io::stdout()))
//!         .init();
//!
//!     HttpServer::new(|| {
//!         let config = Config::default()
//!             .custom_field(field::string("service", "example"))
//!             .skip_logging(|ctx| ctx.path() == "/skiplogging");
//!
//!         App::new()
//!             .wrap(Recovery::new(LogSink::global(), true, config.clone()))
//!             .wrap(Logger::new(LogSink::global(), config))
//!             .route("/", web::get().to(|| async { "Hello world!" }))
//!     })
//!     .bind("127.0.0.1:8080")?
//!     .run()
//!     .await
//! }
//! ```
//! The middlewares can be registered in either order. A panicking request
//! still gets exactly one access record, with status `500` and the panic
//! message as its `error` field.
//!
//! ## `tracing-request-id` feature allows to log Request ID that set by `TracingLogger`.
//! ```bash
//! cargo add actix-web-middleware-reqlog --features tracing-request-id
//! ```
//! ```rust,no_run
//! use actix_web::{web, App, HttpServer};
//! use actix_web_middleware_reqlog::{Config, LogSink, Logger, field};
//! use tracing_actix_web::TracingLogger;
//!
//! #[actix_web::main]
//! async fn main() -> std::io::Result<()> {
//!     HttpServer::new(|| {
//!         let config = Config::default().custom_field(field::tracing_request_id());
//!         App::new()
//!             .wrap(Logger::new(LogSink::global(), config))
//!             .wrap(TracingLogger::default())
//!             .route("/", web::get().to(|| async { "Hello world!" }))
//!     })
//!     .bind("127.0.0.1:8080")?
//!     .run()
//!     .await
//! }
//! ```
//! # Configuration
//!
//! ## Bodies
//!
//! Request and response bodies are logged with [`Config::enable_body`]. Bodies
//! of [`Config::body_limit`] bytes or more are replaced by a placeholder.
//! Multipart request bodies are never read.
//!
//! ```rust
//! use actix_web_middleware_reqlog::Config;
//!
//! let config = Config::default()
//!     .enable_body(true)
//!     .body_limit(4096)
//!     .skip_request_body(|ctx| ctx.path().starts_with("/upload"));
//! ```
//!
//! ## Path Exclusions
//!
//! ```rust
//! use actix_web_middleware_reqlog::Config;
//!
//! let config = Config::default()
//!     .exclude("/health")
//!     .exclude("/metrics")
//!     .exclude_regex(r"^/assets/.*")
//!     .unwrap();
//! ```
//!
//! ## Levels
//!
//! Requests with recorded errors (see [`record_error`]) are logged at error
//! level. Otherwise the level comes from [`Config::logger_level`], which
//! defaults to [`default_level`].
//!
//! # Available Fields
//!
//! - `status` - Response status code
//! - `method` - HTTP method (GET, POST, etc.)
//! - `path` - Request path
//! - `route` - Matched route pattern
//! - `query` - Raw query string
//! - `ip` - Client IP address
//! - `user-agent` - Client user agent
//! - `latency` - Request duration in seconds
//! - `time` - Request start in RFC3339 format, see [`Config::with_datetime`]
//! - `requestBody`, `responseBody` - Bodies, see [`Config::enable_body`]
//! - `error` - One per recorded error
//!
//! The first ten can be renamed with [`Config::field_name`].
//!
//! # Feature Flags
//!
//! - `uuid_v4` (default) - Generate UUIDv4 request IDs in [`field::request_id`]
//! - `uuid_v7` - Use UUIDv7 instead of UUIDv4 for request IDs
//! - `tracing-request-id` - Enable [`field::tracing_request_id`]

mod capture;
mod config;
mod context;
pub mod field;
mod logger;
mod recovery;
mod sink;

pub use crate::config::{Config, FieldName, FieldNames, LevelSelector, Predicate};
pub use crate::config::{binary_response, default_level};
pub use crate::context::{RequestContext, record_error};
pub use crate::field::{CustomField, Field, RequestId, Value};
pub use crate::logger::{Logger, LoggerMiddleware, StreamLog};
pub use crate::recovery::{BrokenConnection, RecoveredPanic, Recovery, RecoveryMiddleware};
pub use crate::sink::LogSink;
