//! Error types for pgkit.
//!
//! Every failure surfaces as a distinct [`PgError`] variant so callers can
//! branch on category. Server errors keep their SQLSTATE, which is mapped to
//! an [`ErrorClass`] through a static table.

use std::collections::HashMap;
use std::fmt;
use std::io;

use thiserror::Error;

/// Result type for pgkit operations.
pub type PgResult<T> = Result<T, PgError>;

#[derive(Error, Debug)]
pub enum PgError {
    /// Bad DSN, conflicting options, out-of-range pool sizes.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport refused, SSL rejected, address unresolvable.
    #[error("connection error: {0}")]
    Connection(String),

    #[error("timed out while establishing a connection")]
    ConnectTimeout,

    #[error("operation timed out")]
    Timeout,

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("{0}")]
    Server(Box<ServerError>),

    /// The server invalidated a cached plan after a schema change.
    #[error("cached statement plan is invalid: {0}")]
    InvalidCachedStatement(Box<ServerError>),

    #[error("none of the hosts match the target attribute requirement {0}")]
    TargetServerAttributeNotMatched(String),

    /// Misuse of the API: released proxies, foreign connections, re-entrancy.
    #[error("interface error: {0}")]
    Interface(String),

    /// Broken internal invariant.
    #[error("internal client error: {0}")]
    InternalClient(String),

    #[error("connection is closed")]
    ConnectionClosed,

    #[error("type error: {0}")]
    Type(String),
}

impl PgError {
    pub(crate) fn interface(msg: impl Into<String>) -> Self {
        PgError::Interface(msg.into())
    }

    /// Build the error for a server `ErrorResponse`.
    pub(crate) fn from_fields(fields: &HashMap<u8, String>) -> Self {
        let err = ServerError::from_fields(fields);
        if err.is_invalid_cached_plan() {
            PgError::InvalidCachedStatement(Box::new(err))
        } else {
            PgError::Server(Box::new(err))
        }
    }

    /// The server error carried by this error, if any.
    pub fn server_error(&self) -> Option<&ServerError> {
        match self {
            PgError::Server(e) | PgError::InvalidCachedStatement(e) => Some(e),
            _ => None,
        }
    }

    pub fn sqlstate(&self) -> Option<&str> {
        self.server_error().map(|e| e.code.as_str())
    }

    /// Whether this failure makes an sslmode fallback attempt eligible.
    pub fn is_authorization_failure(&self) -> bool {
        match self.server_error() {
            Some(e) => {
                let class = e.class();
                class == ErrorClass::InvalidAuthorizationSpecification
                    || e.code == CONNECTION_DOES_NOT_EXIST
            }
            None => false,
        }
    }

    /// Failures that let multi-host negotiation move on to the next address.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            PgError::Io(_) | PgError::Connection(_) | PgError::ConnectTimeout | PgError::Tls(_)
        )
    }
}

/// SQLSTATE for "feature not supported", which the server also reports for
/// invalidated cached plans.
pub const FEATURE_NOT_SUPPORTED: &str = "0A000";
/// SQLSTATE `connection_does_not_exist`.
pub const CONNECTION_DOES_NOT_EXIST: &str = "08003";

/// Details of an `ErrorResponse` sent by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerError {
    pub severity: String,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    /// Source routine reported by the server (field `R`).
    pub routine: Option<String>,
}

impl ServerError {
    pub(crate) fn from_fields(fields: &HashMap<u8, String>) -> Self {
        Self {
            severity: fields
                .get(&b'V')
                .or_else(|| fields.get(&b'S'))
                .cloned()
                .unwrap_or_default(),
            code: fields.get(&b'C').cloned().unwrap_or_default(),
            message: fields.get(&b'M').cloned().unwrap_or_default(),
            detail: fields.get(&b'D').cloned(),
            hint: fields.get(&b'H').cloned(),
            routine: fields.get(&b'R').cloned(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        ErrorClass::from_sqlstate(&self.code)
    }

    fn is_invalid_cached_plan(&self) -> bool {
        self.code == FEATURE_NOT_SUPPORTED && self.routine.as_deref() == Some("RevalidateCachedQuery")
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.severity, self.message, self.code)?;
        if let Some(detail) = &self.detail {
            write!(f, "\nDetail: {}", detail)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\nHint: {}", hint)?;
        }
        Ok(())
    }
}

/// SQLSTATE classes (first two characters of the code).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    SuccessfulCompletion,
    Warning,
    NoData,
    SqlStatementNotYetComplete,
    ConnectionException,
    TriggeredActionException,
    FeatureNotSupported,
    InvalidTransactionInitiation,
    LocatorException,
    InvalidGrantor,
    InvalidRoleSpecification,
    DiagnosticsException,
    CaseNotFound,
    CardinalityViolation,
    DataException,
    IntegrityConstraintViolation,
    InvalidCursorState,
    InvalidTransactionState,
    InvalidSqlStatementName,
    TriggeredDataChangeViolation,
    InvalidAuthorizationSpecification,
    DependentPrivilegeDescriptorsStillExist,
    InvalidTransactionTermination,
    SqlRoutineException,
    InvalidCursorName,
    ExternalRoutineException,
    ExternalRoutineInvocationException,
    SavepointException,
    InvalidCatalogName,
    InvalidSchemaName,
    TransactionRollback,
    SyntaxErrorOrAccessRuleViolation,
    WithCheckOptionViolation,
    InsufficientResources,
    ProgramLimitExceeded,
    ObjectNotInPrerequisiteState,
    OperatorIntervention,
    SystemError,
    SnapshotFailure,
    ConfigurationFileError,
    ForeignDataWrapperError,
    PlpgsqlError,
    InternalError,
    Unknown,
}

impl ErrorClass {
    pub fn from_sqlstate(code: &str) -> Self {
        let class = code.get(..2).unwrap_or("");
        match class {
            "00" => ErrorClass::SuccessfulCompletion,
            "01" => ErrorClass::Warning,
            "02" => ErrorClass::NoData,
            "03" => ErrorClass::SqlStatementNotYetComplete,
            "08" => ErrorClass::ConnectionException,
            "09" => ErrorClass::TriggeredActionException,
            "0A" => ErrorClass::FeatureNotSupported,
            "0B" => ErrorClass::InvalidTransactionInitiation,
            "0F" => ErrorClass::LocatorException,
            "0L" => ErrorClass::InvalidGrantor,
            "0P" => ErrorClass::InvalidRoleSpecification,
            "0Z" => ErrorClass::DiagnosticsException,
            "20" => ErrorClass::CaseNotFound,
            "21" => ErrorClass::CardinalityViolation,
            "22" => ErrorClass::DataException,
            "23" => ErrorClass::IntegrityConstraintViolation,
            "24" => ErrorClass::InvalidCursorState,
            "25" => ErrorClass::InvalidTransactionState,
            "26" => ErrorClass::InvalidSqlStatementName,
            "27" => ErrorClass::TriggeredDataChangeViolation,
            "28" => ErrorClass::InvalidAuthorizationSpecification,
            "2B" => ErrorClass::DependentPrivilegeDescriptorsStillExist,
            "2D" => ErrorClass::InvalidTransactionTermination,
            "2F" => ErrorClass::SqlRoutineException,
            "34" => ErrorClass::InvalidCursorName,
            "38" => ErrorClass::ExternalRoutineException,
            "39" => ErrorClass::ExternalRoutineInvocationException,
            "3B" => ErrorClass::SavepointException,
            "3D" => ErrorClass::InvalidCatalogName,
            "3F" => ErrorClass::InvalidSchemaName,
            "40" => ErrorClass::TransactionRollback,
            "42" => ErrorClass::SyntaxErrorOrAccessRuleViolation,
            "44" => ErrorClass::WithCheckOptionViolation,
            "53" => ErrorClass::InsufficientResources,
            "54" => ErrorClass::ProgramLimitExceeded,
            "55" => ErrorClass::ObjectNotInPrerequisiteState,
            "57" => ErrorClass::OperatorIntervention,
            "58" => ErrorClass::SystemError,
            "72" => ErrorClass::SnapshotFailure,
            "F0" => ErrorClass::ConfigurationFileError,
            "HV" => ErrorClass::ForeignDataWrapperError,
            "P0" => ErrorClass::PlpgsqlError,
            "XX" => ErrorClass::InternalError,
            _ => ErrorClass::Unknown,
        }
    }
}
