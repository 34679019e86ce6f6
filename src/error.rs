use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;

/// Boxed error returned by application callbacks.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Operation is not valid in the current lifecycle state (no active cycle, no children, ...)
    InvalidOperation,
    /// Error related to the underlying WebSocket transport
    WebSocket,
    /// Error raised by an application callback (message handler, hooks, preprocessor)
    Handler,
    /// Operation was aborted because its cancellation scope was cancelled
    Cancelled,
    /// Internal error from dependencies
    Internal,
}

#[derive(Debug)]
pub struct Error {
    kind: Kind,
    source: Option<BoxError>,
    backtrace: Backtrace,
}

impl Error {
    pub fn with_source<S: StdError + Send + Sync + 'static>(kind: Kind, source: S) -> Self {
        Self::from_boxed(kind, Box::new(source))
    }

    /// Wraps an already boxed error, as returned by application callbacks.
    #[must_use]
    pub fn from_boxed(kind: Kind, source: BoxError) -> Self {
        Self {
            kind,
            source: Some(source),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    pub fn inner(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        let e = self.source.as_deref()?;
        e.downcast_ref::<E>()
    }

    pub fn invalid_operation<S: Into<String>>(message: S) -> Self {
        InvalidOperation {
            reason: message.into(),
        }
        .into()
    }

    #[must_use]
    pub fn cancelled() -> Self {
        Cancelled.into()
    }

    #[must_use]
    pub fn handler(source: BoxError) -> Self {
        Self::from_boxed(Kind::Handler, source)
    }

    /// Whether this error was produced by a cancelled scope.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.kind == Kind::Cancelled
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(src) => write!(f, "{:?}: {}", self.kind, src),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

#[non_exhaustive]
#[derive(Debug)]
pub struct InvalidOperation {
    pub reason: String,
}

impl fmt::Display for InvalidOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid operation: {}", self.reason)
    }
}

impl StdError for InvalidOperation {}

#[non_exhaustive]
#[derive(Debug)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "operation cancelled")
    }
}

impl StdError for Cancelled {}

impl From<InvalidOperation> for Error {
    fn from(err: InvalidOperation) -> Self {
        Error::with_source(Kind::InvalidOperation, err)
    }
}

impl From<Cancelled> for Error {
    fn from(err: Cancelled) -> Self {
        Error::with_source(Kind::Cancelled, err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::with_source(Kind::Internal, e)
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::with_source(Kind::InvalidOperation, e)
    }
}
