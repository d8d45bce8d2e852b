//! Service-wide error taxonomy.
//!
//! Every failure surfaced to a caller is an [`ScError`]; each variant maps to
//! a stable numeric [`ErrorCode`] for the IPC surface.

use thiserror::Error;

use crate::click::ClickRejection;
use crate::component::ScId;
use crate::oracle::{EnhanceError, OracleError, Pid};
use crate::validator::ValidityError;

/// Numeric result codes returned over IPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    Ok = 0,
    InvalidArgument = 1,
    NotFound = 2,
    Conflict = 3,
    IntegrityFailure = 4,
    ClickInvalid = 5,
    PermissionDenied = 6,
    Unavailable = 7,
    WaitForConsent = 8,
    NoEnhanceModule = 9,
    ServiceError = 10,
}

impl ErrorCode {
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    /// Short code for logs and metric labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::IntegrityFailure => "INTEGRITY_FAILURE",
            Self::ClickInvalid => "CLICK_INVALID",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::Unavailable => "UNAVAILABLE",
            Self::WaitForConsent => "WAIT_FOR_CONSENT",
            Self::NoEnhanceModule => "NO_ENHANCE_MODULE",
            Self::ServiceError => "SERVICE_ERROR",
        }
    }
}

/// Errors returned by the component service.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScError {
    /// Malformed request: bad kind, bad id, unparsable info.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Declared component fails a validity rule.
    #[error("component invalid: {0}")]
    InvalidComponent(#[from] ValidityError),

    #[error("security component {sc_id} not found for pid {pid}")]
    NotFound { sc_id: ScId, pid: Pid },

    /// Overlapping rect or per-process capacity exhausted.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("integrity check failed: {0}")]
    IntegrityFailure(#[from] EnhanceError),

    #[error("process {pid} is quarantined")]
    Quarantined { pid: Pid },

    #[error("click event invalid: {0}")]
    ClickInvalid(#[from] ClickRejection),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Retry later; the service is shutting down.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// Retry after the first-use consent dialog closes.
    #[error("waiting for first-use consent")]
    WaitForConsent,

    #[error("enhance module is not present")]
    NoEnhanceModule,

    /// A required OS oracle failed; the request fails closed.
    #[error("oracle failure: {0}")]
    Oracle(#[from] OracleError),
}

impl ScError {
    /// Returns the IPC result code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidArgument(_) | Self::InvalidComponent(_) => ErrorCode::InvalidArgument,
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::Conflict(_) => ErrorCode::Conflict,
            Self::IntegrityFailure(_) => ErrorCode::IntegrityFailure,
            Self::ClickInvalid(_) => ErrorCode::ClickInvalid,
            Self::Quarantined { .. } | Self::PermissionDenied(_) => ErrorCode::PermissionDenied,
            Self::Unavailable(_) => ErrorCode::Unavailable,
            Self::WaitForConsent => ErrorCode::WaitForConsent,
            Self::NoEnhanceModule => ErrorCode::NoEnhanceModule,
            Self::Oracle(_) => ErrorCode::ServiceError,
        }
    }

    /// Returns `true` if the caller should simply retry later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::WaitForConsent)
    }
}

/// Result alias for service operations.
pub type ScResult<T> = Result<T, ScError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::occlusion::Occlusion;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(ErrorCode::Ok.as_i32(), 0);
        assert_eq!(ErrorCode::Conflict.as_i32(), 3);
        assert_eq!(ErrorCode::ServiceError.as_i32(), 10);
    }

    #[test]
    fn test_click_failures_share_one_code() {
        let errors = [
            ScError::from(ClickRejection::MissingExtraData),
            ScError::from(ClickRejection::BadKey { key_code: 1 }),
            ScError::from(ClickRejection::Occluded(Occlusion::WindowMissing {
                window_id: 3,
            })),
        ];
        for err in errors {
            assert_eq!(err.code(), ErrorCode::ClickInvalid);
        }
    }

    #[test]
    fn test_validity_maps_to_invalid_argument() {
        let err = ScError::from(ValidityError::FontContrast);
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
        assert!(err.to_string().contains("similar"));
    }

    #[test]
    fn test_retryable() {
        assert!(ScError::WaitForConsent.is_retryable());
        assert!(ScError::Unavailable("exiting".into()).is_retryable());
        assert!(!ScError::Conflict("overlap".into()).is_retryable());
        assert!(!ScError::Oracle(OracleError::unavailable("screen", "gone")).is_retryable());
    }
}
