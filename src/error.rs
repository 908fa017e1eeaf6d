//! Error types for pump-postgres.
//!
//! Every public entry point fails with exactly one [`Error`]. Server failures
//! keep their full diagnostic fields; [`Error::kind`] classifies any error
//! into the small taxonomy callers branch on (API misuse vs. connectivity vs.
//! bad data vs. broken invariants).

use thiserror::Error;

/// Result type for pump-postgres operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Diagnostic fields attached to a server error or notice.
#[derive(Debug, Clone, Default)]
pub struct ServerError {
    /// Severity: ERROR, FATAL, PANIC, WARNING, NOTICE, DEBUG, INFO, LOG
    pub severity: Option<String>,
    /// SQLSTATE error code (5 characters)
    pub sqlstate: Option<String>,
    /// Primary error message
    pub message: Option<String>,
    /// Detailed error explanation
    pub detail: Option<String>,
    /// Suggestion for fixing the error
    pub hint: Option<String>,
    /// Cursor position in query string (1-based)
    pub position: Option<u32>,
    /// Context/stack trace
    pub where_: Option<String>,
    /// Schema name
    pub schema: Option<String>,
    /// Table name
    pub table: Option<String>,
    /// Column name
    pub column: Option<String>,
    /// Data type name
    pub data_type: Option<String>,
    /// Constraint name
    pub constraint: Option<String>,
    /// Source file name
    pub file: Option<String>,
    /// Source line number
    pub line: Option<u32>,
    /// Source routine name
    pub routine: Option<String>,
}

impl ServerError {
    /// Build a minimal server error from a message and SQLSTATE.
    pub fn new(message: impl Into<String>, sqlstate: impl Into<String>) -> Self {
        Self {
            severity: Some("ERROR".into()),
            sqlstate: Some(sqlstate.into()),
            message: Some(message.into()),
            ..Self::default()
        }
    }

    /// The two-character SQLSTATE class, if a code is present.
    pub fn sqlstate_class(&self) -> Option<&str> {
        self.sqlstate.as_deref().and_then(|c| c.get(..2))
    }
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(severity) = &self.severity {
            write!(f, "{}: ", severity)?;
        }
        if let Some(message) = &self.message {
            write!(f, "{}", message)?;
        }
        if let Some(code) = &self.sqlstate {
            write!(f, " (SQLSTATE {})", code)?;
        }
        if let Some(detail) = &self.detail {
            write!(f, "\nDETAIL: {}", detail)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\nHINT: {}", hint)?;
        }
        Ok(())
    }
}

/// Coarse error classification.
///
/// `Database` is the generic parent kind for server errors whose SQLSTATE
/// class is not in the fixed mapping table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Misuse of the API shape (fetching with no result, closed cursor).
    Interface,
    /// Misuse of the transactional/prepared-statement state machine, SQL syntax.
    Programming,
    /// Connectivity, timeouts, server shutdown, insufficient resources.
    Operational,
    /// Value out of range, malformed literal, type mismatch.
    Data,
    /// Constraint violations.
    Integrity,
    /// Protocol invariant violated.
    Internal,
    /// Feature requires a newer protocol/server than available.
    NotSupported,
    /// Generic server error with an unmapped SQLSTATE class.
    Database,
}

/// Error type for pump-postgres.
#[derive(Debug, Error)]
pub enum Error {
    /// Server error response
    #[error("PostgreSQL error: {0}")]
    Server(ServerError),

    /// Misuse of the API shape
    #[error("Interface error: {0}")]
    Interface(String),

    /// Misuse of the transactional or prepared-statement state machine
    #[error("Programming error: {0}")]
    Programming(String),

    /// Connectivity or server-side operational failure
    #[error("Operational error: {0}")]
    Operational(String),

    /// Malformed input data
    #[error("Data error: {0}")]
    Data(String),

    /// Protocol invariant violated
    #[error("Internal error: {0}")]
    Internal(String),

    /// Feature requires a newer protocol or server
    #[error("Unsupported: {0}")]
    NotSupported(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Connection attempt exceeded its deadline
    #[error("Connection timeout: {0}")]
    ConnectionTimeout(String),

    /// A cancel-safe request exceeded its deadline
    #[error("Cancellation timed out")]
    CancellationTimeout,

    /// Connection is broken and cannot be reused
    #[error("Connection is broken")]
    ConnectionBroken,
}

impl Error {
    /// Classify this error into the coarse taxonomy.
    ///
    /// Server errors are classified by the first two characters of their
    /// SQLSTATE through a fixed class table; unmapped classes stay `Database`.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Server(fields) => fields
                .sqlstate_class()
                .and_then(kind_for_sqlstate_class)
                .unwrap_or(ErrorKind::Database),
            Error::Interface(_) => ErrorKind::Interface,
            Error::Programming(_) => ErrorKind::Programming,
            Error::Operational(_)
            | Error::Io(_)
            | Error::ConnectionTimeout(_)
            | Error::CancellationTimeout
            | Error::ConnectionBroken => ErrorKind::Operational,
            Error::Data(_) => ErrorKind::Data,
            Error::Internal(_) => ErrorKind::Internal,
            Error::NotSupported(_) => ErrorKind::NotSupported,
        }
    }

    /// Returns true if the error indicates the connection is broken and
    /// cannot be reused.
    pub fn is_connection_broken(&self) -> bool {
        match self {
            Error::Io(_) | Error::ConnectionBroken => true,
            Error::Server(fields) => {
                matches!(fields.severity.as_deref(), Some("FATAL") | Some("PANIC"))
            }
            _ => false,
        }
    }

    /// Returns true for failures of the transport itself, as opposed to
    /// failures the server reported over a healthy transport.
    pub(crate) fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::ConnectionBroken | Error::Operational(_)
        )
    }

    /// Get the SQLSTATE code if this is a server error.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Server(fields) => fields.sqlstate.as_deref(),
            _ => None,
        }
    }
}

/// Fixed SQLSTATE class to error-kind table.
///
/// Covers the classes the server actually emits; anything else is a plain
/// `Database` error and is reported with its full diagnostics anyway.
pub fn kind_for_sqlstate_class(class: &str) -> Option<ErrorKind> {
    use ErrorKind::*;
    Some(match class {
        "08" => Operational,
        "0A" => NotSupported,
        "20" | "21" => Programming,
        "22" => Data,
        "23" => Integrity,
        "24" => Internal,
        "25" | "26" | "27" | "28" => Operational,
        "2B" | "2D" | "2F" => Internal,
        "34" => Operational,
        "38" | "39" | "3B" => Internal,
        "3D" | "3F" => Programming,
        "40" => Operational,
        "42" | "44" => Programming,
        "53" | "54" | "55" | "57" | "58" => Operational,
        "F0" | "XX" => Internal,
        "HV" => Operational,
        "P0" => Programming,
        _ => return None,
    })
}
