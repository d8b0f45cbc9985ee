//! Error taxonomy for the `SQLite` bridge.
//!
//! Every native result code maps to one [`ErrorKind`] through a fixed table
//! built at compile time. All kinds share one root, [`ErrorKind::Database`],
//! which is also used for unknown codes and for failures detected by the
//! binding itself (closed handles, bad result types, unknown step results).

use std::fmt;

use strum::{EnumCount, EnumIter, IntoStaticStr};
use thiserror::Error;

use super::ffi::NativeMessage;

/// Code carried by errors that originate in the binding rather than the engine.
pub const BINDING_ERROR: i32 = -1;

/// Exception kind derived from a native result code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumCount, IntoStaticStr)]
pub enum ErrorKind {
    /// Root of the hierarchy: general and binding-internal errors.
    #[strum(serialize = "DatabaseException")]
    Database,
    /// Error in the SQL text or a missing database object (`SQLITE_ERROR`).
    #[strum(serialize = "SQLException")]
    Sql,
    /// Internal consistency check failed inside the engine.
    #[strum(serialize = "InternalException")]
    Internal,
    /// Access permission denied.
    #[strum(serialize = "PermissionsException")]
    Permissions,
    /// Operation aborted by a callback.
    #[strum(serialize = "AbortException")]
    Abort,
    /// The database file is locked by another connection.
    #[strum(serialize = "BusyException")]
    Busy,
    /// A table in the database is locked.
    #[strum(serialize = "LockedException")]
    Locked,
    /// A native allocation failed.
    #[strum(serialize = "OutOfMemoryException")]
    OutOfMemory,
    /// Attempt to write a read-only database.
    #[strum(serialize = "ReadOnlyException")]
    ReadOnly,
    /// Operation terminated by an interrupt request.
    #[strum(serialize = "InterruptException")]
    Interrupt,
    /// Disk I/O error.
    #[strum(serialize = "IOErrorException")]
    IoError,
    /// The database image is malformed.
    #[strum(serialize = "CorruptException")]
    Corrupt,
    /// Unknown opcode or table not found.
    #[strum(serialize = "NotFoundException")]
    NotFound,
    /// Insertion failed because the database is full.
    #[strum(serialize = "FullException")]
    Full,
    /// Unable to open the database file.
    #[strum(serialize = "CantOpenException")]
    CantOpen,
    /// Locking protocol violation.
    #[strum(serialize = "ProtocolException")]
    Protocol,
    /// Database table is empty.
    #[strum(serialize = "EmptyException")]
    Empty,
    /// The schema changed underneath a compiled statement.
    #[strum(serialize = "SchemaChangedException")]
    SchemaChanged,
    /// String or blob exceeds the size limit.
    #[strum(serialize = "TooBigException")]
    TooBig,
    /// Constraint violation.
    #[strum(serialize = "ConstraintException")]
    Constraint,
    /// Data type mismatch.
    #[strum(serialize = "MismatchException")]
    Mismatch,
    /// Library used incorrectly.
    #[strum(serialize = "MisuseException")]
    Misuse,
    /// Uses an OS feature not supported on the host.
    #[strum(serialize = "UnsupportedOSFeatureException")]
    UnsupportedOsFeature,
    /// Authorization denied.
    #[strum(serialize = "AuthorizationException")]
    Authorization,
    /// Auxiliary database format error.
    #[strum(serialize = "FormatException")]
    Format,
    /// Parameter index out of range.
    #[strum(serialize = "RangeException")]
    Range,
    /// File opened that is not a database file.
    #[strum(serialize = "NotADatabaseException")]
    NotADatabase,
}

/// Native result code -> kind, indexed by code. Slot 0 is `SQLITE_OK`, which
/// is never raised and resolves to the root.
static ERROR_KINDS: [ErrorKind; ErrorKind::COUNT] = [
    ErrorKind::Database,
    ErrorKind::Sql,
    ErrorKind::Internal,
    ErrorKind::Permissions,
    ErrorKind::Abort,
    ErrorKind::Busy,
    ErrorKind::Locked,
    ErrorKind::OutOfMemory,
    ErrorKind::ReadOnly,
    ErrorKind::Interrupt,
    ErrorKind::IoError,
    ErrorKind::Corrupt,
    ErrorKind::NotFound,
    ErrorKind::Full,
    ErrorKind::CantOpen,
    ErrorKind::Protocol,
    ErrorKind::Empty,
    ErrorKind::SchemaChanged,
    ErrorKind::TooBig,
    ErrorKind::Constraint,
    ErrorKind::Mismatch,
    ErrorKind::Misuse,
    ErrorKind::UnsupportedOsFeature,
    ErrorKind::Authorization,
    ErrorKind::Format,
    ErrorKind::Range,
    ErrorKind::NotADatabase,
];

impl ErrorKind {
    /// Resolves a native result code. Extended codes are reduced to their
    /// primary code; unknown, zero and negative codes resolve to the root.
    #[must_use]
    pub fn from_code(code: i32) -> Self {
        if code <= 0 {
            return Self::Database;
        }
        usize::try_from(code & 0xff)
            .ok()
            .and_then(|idx| ERROR_KINDS.get(idx))
            .copied()
            .unwrap_or(Self::Database)
    }

    /// Returns the primary native code for this kind, or `None` for the root.
    #[must_use]
    pub fn code(self) -> Option<i32> {
        ERROR_KINDS
            .iter()
            .position(|kind| *kind == self)
            .filter(|idx| *idx > 0)
            .and_then(|idx| i32::try_from(idx).ok())
    }

    /// Returns `true` if `code` is a failure code present in the table.
    pub(crate) fn is_known_failure(code: i32) -> bool {
        usize::try_from(code).is_ok_and(|idx| idx > 0 && idx < ERROR_KINDS.len())
    }

    /// Exception name, e.g. `"BusyException"`.
    #[must_use]
    pub fn name(self) -> &'static str {
        self.into()
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Native handle a [`DbError::ClosedHandle`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handle {
    /// A database connection.
    Database,
    /// A compiled statement.
    Statement,
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Database => f.write_str("database"),
            Self::Statement => f.write_str("statement"),
        }
    }
}

/// Error returned by database operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DbError {
    /// A native result code mapped through the kind table.
    #[error("{kind}: {message}")]
    Sqlite {
        /// Kind resolved from `code`.
        kind: ErrorKind,
        /// Native (or binding) result code.
        code: i32,
        /// Native message, or a binding-formatted diagnostic.
        message: String,
    },

    /// The database could not be opened.
    #[error("unable to open database: {message}")]
    Open {
        /// Native result code (or [`BINDING_ERROR`] for rejected arguments).
        code: i32,
        /// Reason reported by the engine or the binding.
        message: String,
    },

    /// Operation on a connection after `close` or a statement after `finalize`.
    #[error("attempt to access a closed {0}")]
    ClosedHandle(Handle),

    /// A function result of a type the engine cannot receive.
    #[error("bad type in set result ({0})")]
    BadResultType(&'static str),

    /// `step` returned a status the binding does not understand.
    #[error("[BUG] unknown result {0} from step")]
    UnknownStepResult(i32),
}

impl DbError {
    /// Creates an error from a result code and a formatted message.
    pub(crate) fn new(code: i32, message: impl Into<String>) -> Self {
        Self::Sqlite {
            kind: ErrorKind::from_code(code),
            code,
            message: message.into(),
        }
    }

    /// Creates an error that adopts a message allocated by the engine. The
    /// message is released when this call returns.
    pub(crate) fn from_native(code: i32, message: Option<NativeMessage>) -> Self {
        let text = message
            .as_ref()
            .map_or_else(|| "(no message)".to_string(), NativeMessage::to_string_lossy);
        Self::new(code, text)
    }

    /// Creates an `open` failure.
    pub(crate) fn open(code: i32, message: impl Into<String>) -> Self {
        Self::Open {
            code,
            message: message.into(),
        }
    }

    /// Exception kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Sqlite { kind, .. } => *kind,
            Self::Open { code, .. } => ErrorKind::from_code(*code),
            Self::ClosedHandle(_) | Self::BadResultType(_) | Self::UnknownStepResult(_) => {
                ErrorKind::Database
            }
        }
    }

    /// Result code of this error; [`BINDING_ERROR`] for binding-internal errors.
    #[must_use]
    pub const fn code(&self) -> i32 {
        match self {
            Self::Sqlite { code, .. } | Self::Open { code, .. } => *code,
            Self::ClosedHandle(_) | Self::BadResultType(_) | Self::UnknownStepResult(_) => {
                BINDING_ERROR
            }
        }
    }

    /// Message without the kind prefix.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::Sqlite { message, .. } | Self::Open { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

/// Result type for database operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;
    use test_case::test_case;

    use super::*;

    #[test_case(1, ErrorKind::Sql ; "sql")]
    #[test_case(5, ErrorKind::Busy ; "busy")]
    #[test_case(6, ErrorKind::Locked ; "locked")]
    #[test_case(19, ErrorKind::Constraint ; "constraint")]
    #[test_case(21, ErrorKind::Misuse ; "misuse")]
    #[test_case(22, ErrorKind::UnsupportedOsFeature ; "nolfs")]
    #[test_case(26, ErrorKind::NotADatabase ; "notadb")]
    fn test_known_codes(code: i32, expected: ErrorKind) {
        assert_eq!(ErrorKind::from_code(code), expected);
        assert_eq!(expected.code(), Some(code));
    }

    #[test_case(0 ; "ok")]
    #[test_case(-1 ; "binding")]
    #[test_case(27 ; "notice")]
    #[test_case(100 ; "row")]
    #[test_case(101 ; "done")]
    fn test_unmapped_codes_fall_back_to_root(code: i32) {
        assert_eq!(ErrorKind::from_code(code), ErrorKind::Database);
    }

    #[test]
    fn test_extended_code_uses_primary_kind() {
        // SQLITE_CONSTRAINT_UNIQUE
        assert_eq!(ErrorKind::from_code(2067), ErrorKind::Constraint);
        // SQLITE_BUSY_SNAPSHOT
        assert_eq!(ErrorKind::from_code(517), ErrorKind::Busy);
    }

    #[test]
    fn test_every_leaf_kind_is_distinct_and_named() {
        let leaves: Vec<ErrorKind> = ErrorKind::iter().skip(1).collect();
        assert_eq!(leaves.len(), 26);
        for (idx, kind) in leaves.iter().enumerate() {
            let code = i32::try_from(idx + 1).expect("small index");
            assert_eq!(ErrorKind::from_code(code), *kind);
            assert!(kind.name().ends_with("Exception"));
        }
        assert_eq!(ErrorKind::Database.code(), None);
        assert_eq!(ErrorKind::IoError.name(), "IOErrorException");
    }

    #[test]
    fn test_is_known_failure() {
        assert!(!ErrorKind::is_known_failure(0));
        assert!(ErrorKind::is_known_failure(1));
        assert!(ErrorKind::is_known_failure(26));
        assert!(!ErrorKind::is_known_failure(27));
        assert!(!ErrorKind::is_known_failure(-5));
    }

    #[test]
    fn test_formatted_message() {
        let err = DbError::new(1, format!("create function {}({})", "maim", 1));
        assert_eq!(err.kind(), ErrorKind::Sql);
        assert_eq!(err.code(), 1);
        assert_eq!(err.message(), "create function maim(1)");
        assert_eq!(err.to_string(), "SQLException: create function maim(1)");
    }

    #[test]
    fn test_binding_errors_use_root_kind() {
        let closed = DbError::ClosedHandle(Handle::Database);
        assert_eq!(closed.kind(), ErrorKind::Database);
        assert_eq!(closed.code(), BINDING_ERROR);
        assert_eq!(closed.to_string(), "attempt to access a closed database");

        let bug = DbError::UnknownStepResult(42);
        assert_eq!(bug.kind(), ErrorKind::Database);
        assert_eq!(bug.to_string(), "[BUG] unknown result 42 from step");
    }

    #[test]
    fn test_missing_native_message() {
        let err = DbError::from_native(1, None);
        assert_eq!(err.message(), "(no message)");
    }
}
