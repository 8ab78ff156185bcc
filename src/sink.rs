use std::{borrow::Cow, panic::Location, sync::Arc};

use log::{Level, Log};

use crate::field::Field;

const DEFAULT_TARGET: &str = "actix_web_middleware_reqlog";

/// Logger handle the middlewares write records to.
///
/// Every [`Field`] becomes a key-value pair of the emitted `log::Record`, so
/// a structured backend (for example `structured-logger`) outputs them as
/// separate JSON keys.
///
/// # Examples
/// ```rust
/// use actix_web_middleware_reqlog::LogSink;
///
/// // global `log` logger, custom target
/// let sink = LogSink::global().target("http");
/// ```
#[derive(Clone)]
pub struct LogSink {
    logger: Option<Arc<dyn Log>>,
    target: Cow<'static, str>,
}

impl LogSink {
    /// Write to the logger installed with `log::set_logger`.
    pub fn global() -> Self {
        LogSink {
            logger: None,
            target: Cow::Borrowed(DEFAULT_TARGET),
        }
    }

    /// Write to `logger` instead of the global logger.
    pub fn new<L: Log + 'static>(logger: L) -> Self {
        Self::from_arc(Arc::new(logger))
    }

    pub fn from_arc(logger: Arc<dyn Log>) -> Self {
        LogSink {
            logger: Some(logger),
            target: Cow::Borrowed(DEFAULT_TARGET),
        }
    }

    /// Sets the logging target to `target`.
    ///
    /// By default, the log target is `actix_web_middleware_reqlog`.
    ///
    /// # Examples
    /// Using `.target("http_log")` would have this effect on request logs:
    /// ```diff
    /// - [2015-10-21T07:28:00Z INFO  actix_web_middleware_reqlog] access log
    /// + [2015-10-21T07:28:00Z INFO  http_log] access log
    ///                               ^^^^^^^^
    /// ```
    pub fn target(mut self, target: impl Into<Cow<'static, str>>) -> Self {
        self.target = target.into();
        self
    }

    #[track_caller]
    pub(crate) fn log(&self, level: Level, message: &str, fields: &[Field]) {
        let loc = Location::caller();
        let kvs: Vec<(&str, log::kv::Value)> = fields
            .iter()
            .map(|field| (field.key(), field.value().to_kv()))
            .collect();
        let kvs = kvs.as_slice();

        let logger: &dyn Log = match &self.logger {
            Some(logger) => logger.as_ref(),
            None => log::logger(),
        };

        logger.log(
            &log::Record::builder()
                .args(format_args!("{message}"))
                .level(level)
                .target(&self.target)
                .module_path_static(Some(module_path!()))
                .file_static(Some(loc.file()))
                .line(Some(loc.line()))
                .key_values(&kvs)
                .build(),
        );
    }
}

impl Default for LogSink {
    fn default() -> Self {
        LogSink::global()
    }
}
