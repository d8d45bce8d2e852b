//! Interfaces to the OS services the trust engine consults.
//!
//! Nothing here is implemented by this workspace for production; the daemon
//! is handed implementations at construction time. Every oracle error is
//! treated as fail-closed by the caller.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::component::{ComponentKind, SecurityComponent};
use crate::occlusion::WindowInfo;

/// Access-token identity used for permission grants.
pub type TokenId = u32;

/// Operating-system process id.
pub type Pid = i32;

/// Operating-system user id.
pub type Uid = u32;

/// Errors reported by an oracle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OracleError {
    /// The oracle could not answer.
    #[error("{oracle} unavailable: {reason}")]
    Unavailable {
        /// Which oracle failed.
        oracle: &'static str,
        /// Detail for logs.
        reason: String,
    },
}

impl OracleError {
    #[must_use]
    pub fn unavailable(oracle: &'static str, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            oracle,
            reason: reason.into(),
        }
    }
}

// =============================================================================
// Screen / window
// =============================================================================

/// Physical screen bounds for a display.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScreenInfo {
    pub width: f64,
    pub height: f64,
    /// Round (wearable) display.
    #[serde(default)]
    pub circular: bool,
}

impl ScreenInfo {
    #[must_use]
    pub const fn rectangular(width: f64, height: f64) -> Self {
        Self {
            width,
            height,
            circular: false,
        }
    }
}

/// Rendering scale of the hosting window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowScale {
    pub scale: f64,
    /// Compatibility scaling anchors at the window centre instead of its
    /// top-left corner.
    pub compat_mode: bool,
}

impl Default for WindowScale {
    fn default() -> Self {
        Self {
            scale: 1.0,
            compat_mode: false,
        }
    }
}

/// Display and window-manager queries.
pub trait ScreenOracle: Send + Sync {
    /// Screen size for `display_id` in the given cross-axis state.
    fn screen_size(&self, display_id: u64, cross_axis: bool) -> Result<ScreenInfo, OracleError>;

    /// Rendering scale of `window_id`.
    fn window_scale(&self, window_id: i32) -> Result<WindowScale, OracleError>;

    /// Current on-screen window stack.
    fn window_snapshot(&self) -> Result<Vec<WindowInfo>, OracleError>;
}

// =============================================================================
// Identity / permission
// =============================================================================

/// Access-token store.
pub trait PermissionOracle: Send + Sync {
    fn grant_permission(&self, token_id: TokenId, permission: &str) -> Result<(), OracleError>;

    fn revoke_permission(&self, token_id: TokenId, permission: &str) -> Result<(), OracleError>;

    fn verify_permission_granted(&self, token_id: TokenId, permission: &str) -> bool;
}

// =============================================================================
// First-use consent
// =============================================================================

/// Opaque handle to the caller's UI, used to anchor the consent dialog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallerToken(pub u64);

/// Outcome of a consent request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentDecision {
    /// The user has just agreed.
    Granted,
    /// A dialog is showing; the caller must retry once it closes.
    Wait,
    /// Consent was recorded elsewhere before.
    AlreadyGranted,
}

/// First-use consent dialog.
pub trait ConsentOracle: Send + Sync {
    fn request_consent(
        &self,
        token_id: TokenId,
        kind: ComponentKind,
        caller_token: Option<CallerToken>,
    ) -> Result<ConsentDecision, OracleError>;
}

// =============================================================================
// Enhance module
// =============================================================================

/// Errors reported by the enhance module.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnhanceError {
    /// Challenge or signature over the component info did not verify.
    #[error("integrity check rejected: {0}")]
    Rejected(String),
    /// Envelope could not be opened or sealed.
    #[error("envelope error: {0}")]
    Envelope(String),
}

/// Handle to the enhance module's client-side object.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EnhanceHandle(pub u64);

impl fmt::Debug for EnhanceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EnhanceHandle({:#x})", self.0)
    }
}

/// Optional integrity/challenge-response extension.
///
/// Absence of the module is a valid configuration.
pub trait EnhancePort: Send + Sync {
    /// Verifies that `raw` really came from the trusted rendering path of
    /// process `pid`.
    fn check_component_info(
        &self,
        pid: Pid,
        component: &SecurityComponent,
        raw: &str,
    ) -> Result<(), EnhanceError>;

    fn client_serialize(&self, payload: &[u8]) -> Result<Vec<u8>, EnhanceError>;

    fn client_deserialize(&self, envelope: &[u8]) -> Result<Vec<u8>, EnhanceError>;

    fn enable_input_enhance(&self);

    fn disable_input_enhance(&self);

    fn notify_process_died(&self, pid: Pid);

    fn add_process(&self, pid: Pid) -> Result<(), EnhanceError>;

    fn handle(&self) -> Option<EnhanceHandle>;
}
