//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;

use http::StatusCode;

/// Result type often returned from methods that can have weft `Error`s.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur while serving connections.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    /// Malformed bytes on the wire.
    Parse(Parse),
    /// An HTTP/2 or WebSocket state-machine violation.
    Protocol,
    /// A deadline expired.
    Timeout(Timeout),
    /// An error escaped the user handler and every registered error handler.
    #[allow(unused)]
    Handler,
    /// An `io::Error` while reading or writing a network stream.
    Io,
    /// Buffer pool or connection limits.
    #[allow(unused)]
    Resource,
    /// Error creating a listener.
    Listen,
    /// Error accepting a single connection.
    Accept,
    /// Invalid run options.
    Config,
    /// A (method, template) pair was registered twice.
    RouteConflict,
    /// A message reached EOF, but is not complete.
    IncompleteMessage,
}

#[derive(Debug)]
pub(crate) enum Parse {
    Method,
    Version,
    Uri,
    UriTooLong,
    Header,
    HeadTooLarge,
    BodyTooLarge,
    ContentLength,
    TransferEncoding,
}

#[derive(Debug)]
pub(crate) enum Timeout {
    /// No request bytes arrived within the keep-alive window. The driver
    /// closes silently in this case, so no error usually surfaces.
    #[allow(unused)]
    Idle,
    /// A request started but did not complete in time.
    Request,
}

impl Error {
    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    /// Returns true if this was caused by malformed wire input.
    pub fn is_parse(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(_))
    }

    /// Returns true if this was a protocol state-machine violation.
    pub fn is_protocol(&self) -> bool {
        matches!(self.inner.kind, Kind::Protocol)
    }

    /// Returns true if a deadline expired.
    pub fn is_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::Timeout(_))
    }

    /// Returns true if this was an I/O failure on the transport.
    pub fn is_io(&self) -> bool {
        matches!(self.inner.kind, Kind::Io)
    }

    /// Returns true if the run options were invalid.
    pub fn is_config(&self) -> bool {
        matches!(self.inner.kind, Kind::Config)
    }

    /// Returns true if a route was registered twice.
    pub fn is_route_conflict(&self) -> bool {
        matches!(self.inner.kind, Kind::RouteConflict)
    }

    /// The process exit code this error maps to.
    ///
    /// Fatal startup failures (bind, TLS load) are 1, configuration errors
    /// are 2, anything else 0.
    pub fn exit_code(&self) -> i32 {
        match self.inner.kind {
            Kind::Listen => 1,
            Kind::Config => 2,
            _ => 0,
        }
    }

    /// Consumes the error, returning its cause.
    pub fn into_cause(self) -> Option<Cause> {
        self.inner.cause
    }

    /// The HTTP status an error response for this error should carry, if the
    /// connection is still in a state where one can be written.
    pub(crate) fn response_status(&self) -> Option<StatusCode> {
        match self.inner.kind {
            Kind::Parse(Parse::UriTooLong) => Some(StatusCode::URI_TOO_LONG),
            Kind::Parse(Parse::HeadTooLarge) => {
                Some(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE)
            }
            Kind::Parse(Parse::BodyTooLarge) => Some(StatusCode::PAYLOAD_TOO_LARGE),
            Kind::Parse(_) => Some(StatusCode::BAD_REQUEST),
            Kind::Timeout(Timeout::Request) => Some(StatusCode::REQUEST_TIMEOUT),
            Kind::Resource => Some(StatusCode::SERVICE_UNAVAILABLE),
            _ => None,
        }
    }

    pub(crate) fn new_parse(parse: Parse) -> Error {
        Error::new(Kind::Parse(parse))
    }

    pub(crate) fn new_protocol<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Protocol).with(cause)
    }

    pub(crate) fn new_request_timeout() -> Error {
        Error::new(Kind::Timeout(Timeout::Request))
    }

    pub(crate) fn new_io(cause: std::io::Error) -> Error {
        Error::new(Kind::Io).with(cause)
    }

    pub(crate) fn new_listen<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Listen).with(cause)
    }

    pub(crate) fn new_accept<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Accept).with(cause)
    }

    pub(crate) fn new_config(message: &'static str) -> Error {
        Error::new(Kind::Config).with(message)
    }

    pub(crate) fn new_route_conflict(template: &str) -> Error {
        Error::new(Kind::RouteConflict).with(template.to_owned())
    }

    pub(crate) fn new_incomplete() -> Error {
        Error::new(Kind::IncompleteMessage)
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::Parse(Parse::Method) => "invalid HTTP method parsed",
            Kind::Parse(Parse::Version) => "invalid HTTP version parsed",
            Kind::Parse(Parse::Uri) => "invalid request target",
            Kind::Parse(Parse::UriTooLong) => "request target too long",
            Kind::Parse(Parse::Header) => "invalid HTTP header parsed",
            Kind::Parse(Parse::HeadTooLarge) => "message head is too large",
            Kind::Parse(Parse::BodyTooLarge) => "message body is too large",
            Kind::Parse(Parse::ContentLength) => "invalid content-length parsed",
            Kind::Parse(Parse::TransferEncoding) => "invalid transfer-encoding parsed",
            Kind::Protocol => "protocol violation",
            Kind::Timeout(Timeout::Idle) => "connection idle timeout",
            Kind::Timeout(Timeout::Request) => "request timeout",
            Kind::Handler => "handler error",
            Kind::Io => "connection error",
            Kind::Resource => "resource limit reached",
            Kind::Listen => "error creating server listener",
            Kind::Accept => "error accepting connection",
            Kind::Config => "invalid server configuration",
            Kind::RouteConflict => "route registered twice",
            Kind::IncompleteMessage => "connection closed before message completed",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("weft::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref cause) = self.inner.cause {
            write!(f, "{}: {}", self.description(), cause)
        } else {
            f.write_str(self.description())
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

impl From<Parse> for Error {
    fn from(parse: Parse) -> Error {
        Error::new_parse(parse)
    }
}

impl From<httparse::Error> for Parse {
    fn from(err: httparse::Error) -> Parse {
        match err {
            httparse::Error::HeaderName
            | httparse::Error::HeaderValue
            | httparse::Error::NewLine
            | httparse::Error::Token => Parse::Header,
            httparse::Error::Status => Parse::Uri,
            httparse::Error::TooManyHeaders => Parse::HeadTooLarge,
            httparse::Error::Version => Parse::Version,
        }
    }
}

impl From<http::method::InvalidMethod> for Parse {
    fn from(_: http::method::InvalidMethod) -> Parse {
        Parse::Method
    }
}

impl From<http::header::InvalidHeaderName> for Parse {
    fn from(_: http::header::InvalidHeaderName) -> Parse {
        Parse::Header
    }
}

impl From<http::header::InvalidHeaderValue> for Parse {
    fn from(_: http::header::InvalidHeaderValue) -> Parse {
        Parse::Header
    }
}
