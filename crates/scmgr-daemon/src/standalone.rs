//! In-process oracles for running the daemon without OS integration.
//!
//! The binary uses these when no platform services are wired in; the
//! integration tests use them as fakes.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError, RwLock};

use scmgr_core::component::ComponentKind;
use scmgr_core::config::DisplayConfig;
use scmgr_core::occlusion::WindowInfo;
use scmgr_core::oracle::{
    CallerToken, ConsentDecision, ConsentOracle, OracleError, PermissionOracle, ScreenInfo,
    ScreenOracle, TokenId, WindowScale,
};

/// Screen oracle backed by the configured display table and a settable
/// window stack.
#[derive(Debug, Default)]
pub struct StaticScreenOracle {
    displays: HashMap<u64, ScreenInfo>,
    scales: RwLock<HashMap<i32, WindowScale>>,
    windows: RwLock<Vec<WindowInfo>>,
}

impl StaticScreenOracle {
    #[must_use]
    pub fn new(displays: &[DisplayConfig]) -> Self {
        Self {
            displays: displays
                .iter()
                .map(|d| {
                    (
                        d.id,
                        ScreenInfo {
                            width: d.width,
                            height: d.height,
                            circular: d.circular,
                        },
                    )
                })
                .collect(),
            ..Self::default()
        }
    }

    pub fn set_window_snapshot(&self, windows: Vec<WindowInfo>) {
        *self.windows.write().unwrap_or_else(PoisonError::into_inner) = windows;
    }

    pub fn set_window_scale(&self, window_id: i32, scale: WindowScale) {
        self.scales
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(window_id, scale);
    }
}

impl ScreenOracle for StaticScreenOracle {
    fn screen_size(&self, display_id: u64, _cross_axis: bool) -> Result<ScreenInfo, OracleError> {
        self.displays
            .get(&display_id)
            .copied()
            .ok_or_else(|| {
                OracleError::unavailable("display", format!("unknown display {display_id}"))
            })
    }

    fn window_scale(&self, window_id: i32) -> Result<WindowScale, OracleError> {
        Ok(self
            .scales
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&window_id)
            .copied()
            .unwrap_or_default())
    }

    fn window_snapshot(&self) -> Result<Vec<WindowInfo>, OracleError> {
        Ok(self
            .windows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}

/// Permission store kept in memory.
#[derive(Debug, Default)]
pub struct InMemoryPermissionOracle {
    granted: Mutex<HashSet<(TokenId, String)>>,
}

impl InMemoryPermissionOracle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl PermissionOracle for InMemoryPermissionOracle {
    fn grant_permission(&self, token_id: TokenId, permission: &str) -> Result<(), OracleError> {
        self.granted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((token_id, permission.to_string()));
        Ok(())
    }

    fn revoke_permission(&self, token_id: TokenId, permission: &str) -> Result<(), OracleError> {
        self.granted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(token_id, permission.to_string()));
        Ok(())
    }

    fn verify_permission_granted(&self, token_id: TokenId, permission: &str) -> bool {
        self.granted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&(token_id, permission.to_string()))
    }
}

/// Consent oracle that agrees to everything. Without a dialog service,
/// the persisted consent records are the only gate.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoConsent;

impl ConsentOracle for AutoConsent {
    fn request_consent(
        &self,
        _token_id: TokenId,
        _kind: ComponentKind,
        _caller_token: Option<CallerToken>,
    ) -> Result<ConsentDecision, OracleError> {
        Ok(ConsentDecision::Granted)
    }
}
