use std::fmt::{self, Display};
use std::{io, result};

/// The single error type threaded through the whole crate.
///
/// Boxed to keep `Result<T>` small on the stack - most call sites only ever
/// check `is_transport()`/`is_user()` before propagating, so the size of the
/// success path matters more than the size of the error path.
#[derive(Debug)]
pub struct Error(Box<ErrorKind>);

#[derive(Debug)]
pub enum ErrorKind {
    /// The peer closed the connection, or we closed it locally.
    Closed,
    /// An in-flight suspension was cancelled by `Reactor::stop()`.
    Cancelled,
    /// A framing engine or protocol method was called before a suspension
    /// context was installed, i.e. outside of a callback or scheduled call.
    NoSuspensionContext,
    Io(io::Error),
    Tls(rustls::Error),
    Yaml(serde_yaml::Error),
    Config(String),
    /// Anything a user callback returned as `Err`. Opaque to the core;
    /// `on_error` receives this and may downcast the inner error if it
    /// knows the concrete protocol's error type.
    User(Box<dyn std::error::Error + Send + Sync>),
}

pub type Result<T> = result::Result<T, Error>;

impl Error {
    pub fn new<S: ToString>(s: S) -> Self {
        Error(Box::new(ErrorKind::Config(s.to_string())))
    }

    pub fn closed() -> Self {
        Error(Box::new(ErrorKind::Closed))
    }

    pub fn cancelled() -> Self {
        Error(Box::new(ErrorKind::Cancelled))
    }

    pub fn no_suspension_context() -> Self {
        Error(Box::new(ErrorKind::NoSuspensionContext))
    }

    pub fn user<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
        Error(Box::new(ErrorKind::User(Box::new(err))))
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.0
    }

    /// True for errors that originate below the protocol layer: peer close,
    /// reset, TLS failure, executor cancellation. These never reach
    /// `on_error` - they drive the connection straight to `on_disconnect`.
    pub fn is_transport(&self) -> bool {
        !matches!(*self.0, ErrorKind::User(_))
    }

    pub fn is_user(&self) -> bool {
        matches!(*self.0, ErrorKind::User(_))
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorKind::Closed => f.write_str("connection closed"),
            ErrorKind::Cancelled => f.write_str("operation cancelled"),
            ErrorKind::NoSuspensionContext => {
                f.write_str("no suspension context is current on this strand")
            }
            ErrorKind::Io(e) => Display::fmt(e, f),
            ErrorKind::Tls(e) => Display::fmt(e, f),
            ErrorKind::Yaml(e) => Display::fmt(e, f),
            ErrorKind::Config(s) => f.write_str(s),
            ErrorKind::User(e) => Display::fmt(e, f),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof
            || err.kind() == io::ErrorKind::ConnectionReset
            || err.kind() == io::ErrorKind::ConnectionAborted
            || err.kind() == io::ErrorKind::BrokenPipe
        {
            return Error(Box::new(ErrorKind::Closed));
        }
        Error(Box::new(ErrorKind::Io(err)))
    }
}

impl From<rustls::Error> for Error {
    fn from(err: rustls::Error) -> Self {
        Error(Box::new(ErrorKind::Tls(err)))
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error(Box::new(ErrorKind::Yaml(err)))
    }
}

impl From<std::net::AddrParseError> for Error {
    fn from(err: std::net::AddrParseError) -> Self {
        Error::new(err)
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error(Box::new(ErrorKind::Cancelled))
    }
}
