use crate::RowId;
use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by the library.
///
/// Caller-caused errors ( constraint violations, invalid values ) leave the
/// database state unchanged. Corruption and I/O errors abort the current
/// write barrier and poison the database handle.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Page-level checksum failure, impossible offset or malformed descriptor.
    #[error("corrupt file: {0}")]
    CorruptFile(String),

    /// File version not in the version descriptor table.
    #[error("unsupported format version code 0x{0:04x}")]
    UnsupportedFormat(u16),

    /// Duplicate key inserted into a unique index.
    #[error("uniqueness violation on index '{index}': duplicate key")]
    UniquenessViolation {
        /// Name of the violated index.
        index: String,
    },

    /// Foreign key value missing from the referenced index, or a restricted
    /// parent mutation with live child rows.
    #[error("referential integrity violation on relationship '{relationship}'")]
    ReferentialIntegrityViolation {
        /// Name of the violated relationship.
        relationship: String,
    },

    /// Row or column level constraint failed.
    #[error("constraint violation on '{column}': {reason}")]
    ConstraintViolation {
        /// Offending column ( empty for row-level constraints ).
        column: String,
        /// Explanation from the validator.
        reason: String,
    },

    /// A value does not fit the declared column type.
    #[error("invalid value for column '{column}': {reason}")]
    InvalidValue {
        ///
        column: String,
        ///
        reason: String,
    },

    /// Wrong number or shape of arguments supplied to a lookup.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The relationship graph closed a cycle during a cascade.
    #[error("cascade cycle through relationship '{0}'")]
    CascadeCycle(String),

    /// Attachment or memo encoding flag not recognised.
    #[error("unknown encoding flag {0}")]
    UnknownEncoding(u32),

    /// Write to a version-history row.
    #[error("version history rows are immutable")]
    VersionImmutable,

    /// Data mutation on an ODBC-linked table.
    #[error("linked table '{0}' is read-only")]
    LinkedTableReadOnly(String),

    /// Savepoint restored onto an incompatible cursor.
    #[error("savepoint does not belong to this cursor")]
    SavepointMismatch,

    /// A prior fatal error invalidated the handle.
    #[error("database handle is poisoned by an earlier fatal error")]
    DatabasePoisoned,

    /// Backing-store failure.
    #[error("i/o error: {0}")]
    IOError(#[from] std::io::Error),
}

impl Error {
    /// Corrupt file error with a formatted context message.
    pub fn corrupt(msg: impl Into<String>) -> Error {
        Error::CorruptFile(msg.into())
    }

    /// Invalid value error for a named column.
    pub fn invalid(column: &str, reason: impl Into<String>) -> Error {
        Error::InvalidValue {
            column: column.to_string(),
            reason: reason.into(),
        }
    }

    /// True for errors that poison the database handle.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::CorruptFile(_) | Error::IOError(_) | Error::DatabasePoisoned
        )
    }

    /// Attach the row that was being processed, where known.
    pub fn at_row(self, rowid: RowId) -> Error {
        match self {
            Error::ConstraintViolation { column, reason } => Error::ConstraintViolation {
                column,
                reason: format!("{} (row {:?})", reason, rowid),
            },
            other => other,
        }
    }
}
