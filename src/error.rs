use std::fmt::Display;

/// Error returned from bridge operations.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: String,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        kind: ErrorKind,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    #[track_caller]
    pub(crate) fn log_error(self) -> Self {
        log::error!("{}", self);
        self
    }

    /// Get the error kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(source) = &self.source {
            write!(f, ": {}", source)?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<nusb::Error> for Error {
    fn from(err: nusb::Error) -> Self {
        let kind = match err.kind() {
            nusb::ErrorKind::Disconnected => ErrorKind::Transport,
            nusb::ErrorKind::Busy => ErrorKind::Transport,
            nusb::ErrorKind::PermissionDenied => ErrorKind::Transport,
            nusb::ErrorKind::NotFound => ErrorKind::Transport,
            nusb::ErrorKind::Unsupported => ErrorKind::Unsupported,
            _ => ErrorKind::Transport,
        };
        Error::with_source(kind, "USB transport error", err)
    }
}

impl From<nusb::transfer::TransferError> for Error {
    fn from(err: nusb::transfer::TransferError) -> Self {
        let kind = match err {
            nusb::transfer::TransferError::Disconnected => ErrorKind::Transport,
            _ => ErrorKind::Transport,
        };
        Error::with_source(kind, "USB transfer failed", err)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::with_source(ErrorKind::PtyIo, "PTY I/O failed", err)
    }
}

impl From<nix::Error> for Error {
    fn from(err: nix::Error) -> Self {
        Error::with_source(ErrorKind::PtyIo, "PTY syscall failed", err)
    }
}

/// General category of error, mirroring the taxonomy in the design document.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// CLI or driver-registry error; fatal before the supervisor starts.
    Config,

    /// Rejected serial setting; does not disturb bridge state.
    InvalidParam,

    /// A legitimate request the driver cannot honor on this chip.
    Unsupported,

    /// Failure during the driver init sequence.
    Init,

    /// Any USB error from claim/submit/completion.
    Transport,

    /// Read/write on a PTY master.
    PtyIo,

    /// Unrecoverable error; process exits non-zero.
    Fatal,
}

impl ErrorKind {
    /// Whether this error kind should terminate the process rather than
    /// transition the bridge to `Disconnected`.
    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorKind::Config | ErrorKind::Fatal)
    }
}

pub(crate) type Result<T> = std::result::Result<T, Error>;
