use std::{borrow::Cow, fmt, rc::Rc, time::Duration};

use actix_web::HttpMessage;
use actix_web::http::header::HeaderName;
use uuid::Uuid;

use crate::context::RequestContext;

/// Value of a structured log field.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    I64(i64),
    U64(u64),
    F64(f64),
    Str(String),
    /// Rendered as seconds with fractional part. Example: 0.001985
    Duration(Duration),
}

impl Value {
    pub(crate) fn to_kv(&self) -> log::kv::Value<'_> {
        match self {
            Value::Null => log::kv::Value::null(),
            Value::Bool(v) => log::kv::Value::from(*v),
            Value::I64(v) => log::kv::Value::from(*v),
            Value::U64(v) => log::kv::Value::from(*v),
            Value::F64(v) => log::kv::Value::from(*v),
            Value::Str(v) => log::kv::Value::from(v.as_str()),
            Value::Duration(v) => log::kv::Value::from(v.as_secs_f64()),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::I64(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::U64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::F64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Duration> for Value {
    fn from(v: Duration) -> Self {
        Value::Duration(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Named structured log field.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    key: Cow<'static, str>,
    value: Value,
}

impl Field {
    pub fn new(key: impl Into<Cow<'static, str>>, value: impl Into<Value>) -> Self {
        Field {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &Value {
        &self.value
    }
}

/// Produces one field per request.
///
/// Custom fields are evaluated once the response status is known (for
/// [`Logger`](crate::Logger)) or when a panic is recovered (for
/// [`Recovery`](crate::Recovery)).
///
/// # Examples
/// ```rust
/// use actix_web_middleware_reqlog::{CustomField, Field};
///
/// let client = CustomField::new(|ctx| Field::new("client", ctx.client_ip()));
/// let service = CustomField::immutable(Field::new("service", "billing"));
/// ```
#[derive(Clone)]
pub struct CustomField(Rc<dyn Fn(&RequestContext<'_>) -> Field>);

impl CustomField {
    /// Dynamic field computed from the current request.
    pub fn new<F>(producer: F) -> Self
    where
        F: Fn(&RequestContext<'_>) -> Field + 'static,
    {
        CustomField(Rc::new(producer))
    }

    /// Field computed once and reused for every request.
    pub fn immutable(field: Field) -> Self {
        CustomField(Rc::new(move |_| field.clone()))
    }

    pub(crate) fn produce(&self, ctx: &RequestContext<'_>) -> Field {
        (self.0)(ctx)
    }
}

impl fmt::Debug for CustomField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CustomField")
    }
}

/// Immutable string field.
pub fn string(key: impl Into<Cow<'static, str>>, value: impl Into<String>) -> CustomField {
    CustomField::immutable(Field::new(key, Value::Str(value.into())))
}

/// Immutable signed integer field.
pub fn int(key: impl Into<Cow<'static, str>>, value: i64) -> CustomField {
    CustomField::immutable(Field::new(key, value))
}

/// Immutable unsigned integer field.
pub fn uint(key: impl Into<Cow<'static, str>>, value: u64) -> CustomField {
    CustomField::immutable(Field::new(key, value))
}

/// Immutable floating point field.
pub fn float(key: impl Into<Cow<'static, str>>, value: f64) -> CustomField {
    CustomField::immutable(Field::new(key, value))
}

/// Immutable boolean field.
pub fn boolean(key: impl Into<Cow<'static, str>>, value: bool) -> CustomField {
    CustomField::immutable(Field::new(key, value))
}

/// Immutable field holding the `Debug` rendering of any value.
pub fn any<T: fmt::Debug>(key: impl Into<Cow<'static, str>>, value: T) -> CustomField {
    CustomField::immutable(Field::new(key, format!("{value:?}")))
}

/// Request ID stored in request extensions by [`request_id`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestId(Uuid);

impl RequestId {
    pub(crate) fn new() -> Self {
        #[cfg(not(feature = "uuid_v7"))]
        {
            Self(Uuid::new_v4())
        }
        #[cfg(feature = "uuid_v7")]
        {
            Self(Uuid::now_v7())
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.as_hyphenated(), f)
    }
}

/// Request ID field. Example: 7b77f3f1-8e15-4b6a-9b3f-7f4b6f4b6f4b.
///
/// The value is taken from the `header` request header. When the client did
/// not send one, an ID is generated and stored in request extensions so later
/// producers see the same value. Once the request has been consumed by a
/// failing downstream service a fresh ID is generated.
pub fn request_id(header: HeaderName) -> CustomField {
    CustomField::new(move |ctx| {
        let value = match ctx.headers().get(&header) {
            Some(val) => val.to_str().unwrap_or_default().to_string(),
            None => match ctx.request() {
                Some(req) => {
                    let existing = req.extensions().get::<RequestId>().copied();
                    let id = existing.unwrap_or_else(|| {
                        let id = RequestId::new();
                        req.extensions_mut().insert(id);
                        id
                    });
                    id.to_string()
                }
                None => RequestId::new().to_string(),
            },
        };
        Field::new(header.to_string(), value)
    })
}

/// Request ID assigned by `tracing_actix_web::TracingLogger`.
///
/// Null when the request is no longer available.
#[cfg(feature = "tracing-request-id")]
pub fn tracing_request_id() -> CustomField {
    CustomField::new(|ctx| {
        let id = ctx.request().and_then(|req| {
            req.extensions()
                .get::<tracing_actix_web::RequestId>()
                .map(|id| id.to_string())
        });
        Field::new("tracing_request_id", id)
    })
}
