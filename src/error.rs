use derive_more::From;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, From)]
pub enum Error {
    #[from]
    Json(serde_json::Error),

    #[from]
    Yaml(serde_yaml::Error),

    #[from]
    Kube(kube::Error),

    #[from]
    Infer(kube::config::InferConfigError),

    #[from]
    HttpHeader(hyper::http::Error),

    #[from]
    Io(std::io::Error),

    /// Subscription spec rejected before any session was started
    InvalidSpec(String),

    /// No live subscription with this id
    UnknownSubscription(String),

    /// The manager has been stopped and accepts no new subscriptions
    ShuttingDown,

    /// `stop` gave up waiting; names the sessions still running
    ShutdownTimeout { stragglers: Vec<String> },

    /// Remote call did not complete in time
    Timeout(String),

    /// Remote closed the connection or the transport failed
    ConnectionClosed(String),

    /// Configuration could not be loaded or failed validation
    Config(String),

    /// Custom error message
    Custom(String),
}

impl core::fmt::Display for Error {
    fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::result::Result<(), core::fmt::Error> {
        match self {
            Self::InvalidSpec(msg) => write!(fmt, "invalid subscription spec: {msg}"),
            Self::UnknownSubscription(id) => write!(fmt, "unknown subscription: {id}"),
            Self::ShuttingDown => write!(fmt, "manager is shutting down"),
            Self::ShutdownTimeout { stragglers } => write!(
                fmt,
                "shutdown timed out with {} session(s) still running: {}",
                stragglers.len(),
                stragglers.join(", ")
            ),
            Self::Timeout(msg) => write!(fmt, "timeout: {msg}"),
            Self::ConnectionClosed(msg) => write!(fmt, "connection closed: {msg}"),
            Self::Config(msg) => write!(fmt, "configuration error: {msg}"),
            Self::Custom(msg) => write!(fmt, "{msg}"),
            _ => write!(fmt, "{self:?}"),
        }
    }
}

impl std::error::Error for Error {}

/// How a remote failure should be treated by the session machinery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    NotFound,
    Forbidden,
    Timeout,
    ConnectionClosed,
    Other,
}

impl ErrorClass {
    /// Failures the watch loop sees routinely; everything else is logged louder.
    #[must_use]
    pub const fn is_expected(self) -> bool {
        !matches!(self, Self::Other)
    }

    /// Failures that select the compatibility API in the event manager.
    #[must_use]
    pub const fn triggers_fallback(self) -> bool {
        matches!(self, Self::NotFound | Self::Forbidden)
    }
}

impl Error {
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Kube(kube::Error::Api(resp)) => match resp.code {
                404 => ErrorClass::NotFound,
                401 | 403 => ErrorClass::Forbidden,
                408 | 504 => ErrorClass::Timeout,
                _ => ErrorClass::Other,
            },
            Self::Kube(kube::Error::HyperError(_) | kube::Error::Service(_)) => {
                ErrorClass::ConnectionClosed
            }
            Self::Io(e) if e.kind() == std::io::ErrorKind::TimedOut => ErrorClass::Timeout,
            Self::Io(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::ConnectionReset
                        | std::io::ErrorKind::ConnectionAborted
                        | std::io::ErrorKind::BrokenPipe
                        | std::io::ErrorKind::UnexpectedEof
                ) =>
            {
                ErrorClass::ConnectionClosed
            }
            Self::Timeout(_) => ErrorClass::Timeout,
            Self::ConnectionClosed(_) => ErrorClass::ConnectionClosed,
            _ => ErrorClass::Other,
        }
    }
}

/// Build a kube API error with the given status code, as the API server would report it
#[must_use]
pub fn api_error(code: u16, reason: &str, message: &str) -> Error {
    Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: message.to_string(),
        reason: reason.to_string(),
        code,
    }))
}
