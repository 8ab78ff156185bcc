use std::{borrow::Cow, collections::HashSet, rc::Rc};

use actix_web::HttpMessage;
use actix_web::HttpRequest;
use actix_web::http::header::CONTENT_TYPE;
use log::Level;
use regex::Regex;

use crate::context::RequestContext;
use crate::field::CustomField;

/// Predicate evaluated against the current request.
pub type Predicate = Rc<dyn Fn(&RequestContext<'_>) -> bool>;

/// Chooses the level of the access log record.
pub type LevelSelector = Rc<dyn Fn(&RequestContext<'_>) -> Level>;

/// Renameable fields of the access log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldName {
    /// Status code. Example: 200, 404
    Status,
    /// Method. Example: GET
    Method,
    /// Request path. Example: /index.html
    Path,
    /// Matched route pattern. Example: /users/{id}
    Route,
    /// Raw query string. Example: search=actix
    Query,
    /// Client IP address. Example: 192.168.0.1
    Ip,
    /// User agent. Example: Mozilla/5.0
    UserAgent,
    /// Duration of the request in seconds. Example: 0.001985
    Latency,
    /// Captured request body, see [`Config::enable_body`].
    RequestBody,
    /// Captured response body, see [`Config::enable_body`].
    ResponseBody,
}

impl FieldName {
    const COUNT: usize = 10;

    fn default_name(self) -> &'static str {
        match self {
            FieldName::Status => "status",
            FieldName::Method => "method",
            FieldName::Path => "path",
            FieldName::Route => "route",
            FieldName::Query => "query",
            FieldName::Ip => "ip",
            FieldName::UserAgent => "user-agent",
            FieldName::Latency => "latency",
            FieldName::RequestBody => "requestBody",
            FieldName::ResponseBody => "responseBody",
        }
    }
}

/// Display names of the access log fields.
#[derive(Debug, Clone)]
pub struct FieldNames([Cow<'static, str>; FieldName::COUNT]);

impl FieldNames {
    /// Name the field is logged under.
    pub fn get(&self, field: FieldName) -> &Cow<'static, str> {
        &self.0[field as usize]
    }

    fn set(&mut self, field: FieldName, name: Cow<'static, str>) {
        self.0[field as usize] = name;
    }
}

impl Default for FieldNames {
    fn default() -> Self {
        let names = [
            FieldName::Status,
            FieldName::Method,
            FieldName::Path,
            FieldName::Route,
            FieldName::Query,
            FieldName::Ip,
            FieldName::UserAgent,
            FieldName::Latency,
            FieldName::RequestBody,
            FieldName::ResponseBody,
        ];
        FieldNames(names.map(|field| Cow::Borrowed(field.default_name())))
    }
}

/// Configuration shared by [`Logger`](crate::Logger) and
/// [`Recovery`](crate::Recovery).
///
/// # Examples
/// ```rust
/// use actix_web::http::StatusCode;
/// use actix_web_middleware_reqlog::{Config, CustomField, Field, FieldName, field};
/// use log::Level;
///
/// let config = Config::default()
///     .custom_field(field::string("service", "billing"))
///     .custom_field(CustomField::new(|ctx| Field::new("client", ctx.client_ip())))
///     .skip_logging(|ctx| ctx.path() == "/skiplogging")
///     .enable_body(true)
///     .body_limit(4096)
///     .field_name(FieldName::Status, "httpStatusCode")
///     .logger_level(|ctx| match ctx.status() {
///         Some(StatusCode::NOT_FOUND) => Level::Debug,
///         _ => Level::Info,
///     })
///     .exclude("/health");
/// ```
#[derive(Clone)]
pub struct Config {
    pub(crate) custom_fields: Vec<CustomField>,
    pub(crate) skip_logging: Predicate,
    pub(crate) skip_request_body: Predicate,
    pub(crate) skip_response_body: Predicate,
    pub(crate) logger_level: LevelSelector,
    pub(crate) enable_body: bool,
    /// 0 means no limit
    pub(crate) limit: usize,
    pub(crate) field_names: FieldNames,
    pub(crate) exclude: HashSet<String>,
    pub(crate) exclude_regex: Vec<Regex>,
    pub(crate) datetime: bool,
}

impl Default for Config {
    /// Bodies disabled, nothing skipped, level chosen by [`default_level`].
    fn default() -> Self {
        Config {
            custom_fields: Vec::new(),
            skip_logging: Rc::new(|_| false),
            skip_request_body: Rc::new(|_| false),
            skip_response_body: Rc::new(binary_response),
            logger_level: Rc::new(default_level),
            enable_body: false,
            limit: 0,
            field_names: FieldNames::default(),
            exclude: HashSet::new(),
            exclude_regex: Vec::new(),
            datetime: false,
        }
    }
}

impl Config {
    /// Same as [`Config::default`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the custom fields.
    pub fn custom_fields(mut self, fields: impl IntoIterator<Item = CustomField>) -> Self {
        self.custom_fields = fields.into_iter().collect();
        self
    }

    /// Append one custom field.
    pub fn custom_field(mut self, field: CustomField) -> Self {
        self.custom_fields.push(field);
        self
    }

    /// Do not log the request when `f` returns true.
    ///
    /// Evaluated once the response status is known.
    pub fn skip_logging<F>(mut self, f: F) -> Self
    where
        F: Fn(&RequestContext<'_>) -> bool + 'static,
    {
        self.skip_logging = Rc::new(f);
        self
    }

    /// Do not read the request body when `f` returns true.
    ///
    /// Multipart bodies are never read regardless of `f`.
    pub fn skip_request_body<F>(mut self, f: F) -> Self
    where
        F: Fn(&RequestContext<'_>) -> bool + 'static,
    {
        self.skip_request_body = Rc::new(f);
        self
    }

    /// Do not log the response body when `f` returns true.
    ///
    /// Replaces the default policy, which skips binary content types.
    pub fn skip_response_body<F>(mut self, f: F) -> Self
    where
        F: Fn(&RequestContext<'_>) -> bool + 'static,
    {
        self.skip_response_body = Rc::new(f);
        self
    }

    /// Capture request and response bodies.
    pub fn enable_body(mut self, enable: bool) -> Self {
        self.enable_body = enable;
        self
    }

    /// Bodies of `limit` bytes or more are logged as a placeholder.
    /// `0` disables the limit.
    pub fn body_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Rename a log field. Empty names are ignored.
    pub fn field_name(mut self, field: FieldName, name: impl Into<Cow<'static, str>>) -> Self {
        let name = name.into();
        if !name.is_empty() {
            self.field_names.set(field, name);
        }
        self
    }

    /// Choose the record level for requests without recorded errors.
    pub fn logger_level<F>(mut self, f: F) -> Self
    where
        F: Fn(&RequestContext<'_>) -> Level + 'static,
    {
        self.logger_level = Rc::new(f);
        self
    }

    /// Ignore and do not log access info for specified path.
    pub fn exclude<T: Into<String>>(mut self, path: T) -> Self {
        self.exclude.insert(path.into());
        self
    }

    /// Ignore and do not log access info for paths that match regex.
    pub fn exclude_regex(mut self, pattern: &str) -> Result<Self, regex::Error> {
        self.exclude_regex.push(Regex::new(pattern)?);
        Ok(self)
    }

    /// Add a `time` field with the request start time in RFC 3339 format.
    pub fn with_datetime(mut self) -> Self {
        self.datetime = true;
        self
    }

    /// Current field names, after renames.
    pub fn field_names(&self) -> &FieldNames {
        &self.field_names
    }

    pub(crate) fn is_excluded(&self, path: &str) -> bool {
        self.exclude.contains(path) || self.exclude_regex.iter().any(|r| r.is_match(path))
    }

    pub(crate) fn skips_request_body(&self, req: &HttpRequest) -> bool {
        is_multipart(req) || (self.skip_request_body)(&RequestContext::new(req))
    }
}

/// Default level selector.
///
/// - `Error` for status 500..=511
/// - `Warn` for status 400..=451
/// - `Info` otherwise
pub fn default_level(ctx: &RequestContext<'_>) -> Level {
    match ctx.status().map(|status| status.as_u16()) {
        Some(500..=511) => Level::Error,
        Some(400..=451) => Level::Warn,
        _ => Level::Info,
    }
}

/// Default response body policy: skip content that is not meaningful as text.
pub fn binary_response(ctx: &RequestContext<'_>) -> bool {
    let content_type = ctx
        .response_headers()
        .and_then(|headers| headers.get(CONTENT_TYPE))
        .and_then(|value| value.to_str().ok())
        .map(str::to_ascii_lowercase);

    match content_type {
        Some(ct) => {
            ct.starts_with("image/")
                || ct.starts_with("audio/")
                || ct.starts_with("video/")
                || ct.starts_with("multipart/")
                || ct.starts_with("application/octet-stream")
        }
        None => false,
    }
}

fn is_multipart(req: &HttpRequest) -> bool {
    match req.mime_type() {
        Ok(Some(mime)) => {
            matches!(mime.essence_str(), "multipart/form-data" | "multipart/mixed")
                && mime.params().any(|(name, _)| name.as_str() == "boundary")
        }
        _ => false,
    }
}
