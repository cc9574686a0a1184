use std::fmt;
use std::time::Duration;

use derive_more::From;

use crate::gtid::parser::ParseError;

/// Convenience alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Closed taxonomy of failures an operation can report.
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Raised before any mutation; retry after fixing the stated condition.
    Precondition,
    /// A required server or cluster cannot be reached or has no quorum.
    Availability,
    /// Errant, purged or stale transactions. Never downgraded silently.
    DataSafety,
    /// The caller named something that does not exist or cannot be used.
    BadArgument,
    /// A distributed lock could not be acquired in time.
    Lock,
    /// A GTID wait did not complete in time.
    Timeout,
    /// An internal value was used in a state it does not support.
    InvalidState,
    /// A statement failed while the topology was being changed.
    Mutation,
}

/// Numeric-style code attached to every orchestration failure.
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    UnsupportedVersion,
    UnsupportedTopologyMode,
    ViewChangeUuidMissing,
    MetadataOutdated,
    AsyncChannelsConfigured,
    AlreadyInClusterSet,
    InstanceAlreadyInGroup,
    ReplicationChannelNotHealthy,
    ClusterInvalidated,

    ClusterUnreachable,
    InstanceUnreachable,
    PrimaryClusterUnavailable,
    PrimaryClusterStillAvailable,
    PrimaryClusterNotUnreachable,
    GroupHasNoQuorum,
    ClusterOffline,

    DataErrantTransactions,
    DataUnrecoverableTransactions,
    BadargInstanceOutdated,

    ClusterNotFound,
    ClusterSetNotFound,
    TargetIsPrimary,
    RouterTargetConflict,
    RouterNotFound,
    ClusterNameInUse,
    InvalidOption,

    LockGetFailed,
    GtidSyncTimeout,
    GtidSetNotNormalized,
    MetadataInconsistent,
    TransactionActive,
}

impl ErrorCode {
    /// Maps the code into the error taxonomy.
    #[must_use]
    pub const fn kind(self) -> ErrorKind {
        match self {
            Self::UnsupportedVersion
            | Self::UnsupportedTopologyMode
            | Self::ViewChangeUuidMissing
            | Self::MetadataOutdated
            | Self::AsyncChannelsConfigured
            | Self::AlreadyInClusterSet
            | Self::InstanceAlreadyInGroup
            | Self::ReplicationChannelNotHealthy
            | Self::ClusterInvalidated => ErrorKind::Precondition,
            Self::ClusterUnreachable
            | Self::InstanceUnreachable
            | Self::PrimaryClusterUnavailable
            | Self::PrimaryClusterStillAvailable
            | Self::PrimaryClusterNotUnreachable
            | Self::GroupHasNoQuorum
            | Self::ClusterOffline => ErrorKind::Availability,
            Self::DataErrantTransactions
            | Self::DataUnrecoverableTransactions
            | Self::BadargInstanceOutdated => ErrorKind::DataSafety,
            Self::ClusterNotFound
            | Self::ClusterSetNotFound
            | Self::TargetIsPrimary
            | Self::RouterTargetConflict
            | Self::RouterNotFound
            | Self::ClusterNameInUse
            | Self::InvalidOption => ErrorKind::BadArgument,
            Self::LockGetFailed => ErrorKind::Lock,
            Self::GtidSyncTimeout => ErrorKind::Timeout,
            Self::GtidSetNotNormalized | Self::MetadataInconsistent | Self::TransactionActive => {
                ErrorKind::InvalidState
            }
        }
    }
}

/// A coded failure raised by the orchestration logic.
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub code: ErrorCode,
    pub message: String,
    pub cause: Option<Box<Error>>,
}

/// An error reported by a server while running a statement.
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    pub code: u32,
    pub message: String,
}

impl ServerError {
    /// `CR_CONNECTION_ERROR`
    pub const CONNECTION_ERROR: u32 = 2002;
    /// `CR_CONN_HOST_ERROR`
    pub const CONN_HOST_ERROR: u32 = 2003;
    /// `CR_SERVER_GONE_ERROR`
    pub const SERVER_GONE: u32 = 2006;
    /// `CR_SERVER_LOST`
    pub const SERVER_LOST: u32 = 2013;
    /// `ER_SPECIFIC_ACCESS_DENIED_ERROR`
    pub const ACCESS_DENIED: u32 = 1227;
    /// `ER_OPTION_PREVENTS_STATEMENT`
    pub const READ_ONLY: u32 = 1290;
    /// `ER_LOCKING_SERVICE_TIMEOUT`
    pub const LOCK_TIMEOUT: u32 = 3132;
    /// `ER_PARSE_ERROR`
    pub const PARSE_ERROR: u32 = 1064;

    #[must_use]
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Returns `true` for client-side connectivity errors.
    #[must_use]
    pub const fn is_network(&self) -> bool {
        matches!(
            self.code,
            Self::CONNECTION_ERROR | Self::CONN_HOST_ERROR | Self::SERVER_GONE | Self::SERVER_LOST
        )
    }
}

/// Every error surfaced by this crate.
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, From)]
pub enum Error {
    /// Orchestration logic rejected or aborted the operation.
    Operation(Failure),
    /// A server returned an error.
    Server(ServerError),
    /// A GTID set could not be parsed.
    Gtid(ParseError),
}

impl Error {
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Operation(Failure {
            code,
            message: message.into(),
            cause: None,
        })
    }

    #[must_use]
    pub fn with_cause(code: ErrorCode, message: impl Into<String>, cause: Self) -> Self {
        Self::Operation(Failure {
            code,
            message: message.into(),
            cause: Some(Box::new(cause)),
        })
    }

    /// Lock acquisition failed after waiting for `timeout`.
    #[must_use]
    pub fn lock_timeout(what: &str, timeout: Duration, cause: Self) -> Self {
        Self::with_cause(
            ErrorCode::LockGetFailed,
            format!(
                "Failed to acquire the lock on {what} after {}s, another operation is in progress",
                timeout.as_secs()
            ),
            cause,
        )
    }

    #[must_use]
    pub const fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Operation(failure) => Some(failure.code),
            Self::Server(_) | Self::Gtid(_) => None,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Operation(failure) => failure.code.kind(),
            Self::Server(err) if err.is_network() => ErrorKind::Availability,
            Self::Server(_) => ErrorKind::Mutation,
            Self::Gtid(_) => ErrorKind::InvalidState,
        }
    }

    /// Returns `true` if the error means the target could not be reached.
    #[must_use]
    pub const fn is_network(&self) -> bool {
        matches!(self, Self::Server(err) if err.is_network())
    }

    #[must_use]
    pub const fn server_code(&self) -> Option<u32> {
        match self {
            Self::Server(err) => Some(err.code),
            Self::Operation(_) | Self::Gtid(_) => None,
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (MySQL Error {})", self.message, self.code)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Operation(failure) => {
                write!(f, "{:?}: {}", failure.code, failure.message)?;
                if let Some(cause) = &failure.cause {
                    write!(f, " (caused by: {cause})")?;
                }
                Ok(())
            }
            Self::Server(err) => write!(f, "{err}"),
            Self::Gtid(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for ServerError {}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_errors_are_availability_failures() {
        let err = Error::from(ServerError::new(ServerError::CONN_HOST_ERROR, "refused"));
        assert!(err.is_network());
        assert_eq!(err.kind(), ErrorKind::Availability);

        let err = Error::from(ServerError::new(ServerError::READ_ONLY, "super_read_only"));
        assert!(!err.is_network());
        assert_eq!(err.kind(), ErrorKind::Mutation);
    }

    #[test]
    fn lock_timeout_carries_duration_and_cause() {
        let cause = Error::from(ServerError::new(ServerError::LOCK_TIMEOUT, "timeout"));
        let err = Error::lock_timeout("ClusterSet 'dom'", Duration::from_secs(7), cause.clone());
        assert_eq!(err.code(), Some(ErrorCode::LockGetFailed));
        assert_eq!(err.kind(), ErrorKind::Lock);
        let Error::Operation(failure) = &err else {
            panic!("expected an operation failure");
        };
        assert_eq!(failure.cause.as_deref(), Some(&cause));
        assert!(err.to_string().contains("after 7s"));
    }

    #[test]
    fn data_safety_codes() {
        for code in [
            ErrorCode::DataErrantTransactions,
            ErrorCode::DataUnrecoverableTransactions,
            ErrorCode::BadargInstanceOutdated,
        ] {
            assert_eq!(code.kind(), ErrorKind::DataSafety);
        }
    }
}
