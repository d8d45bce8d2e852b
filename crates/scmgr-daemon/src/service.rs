//! Service surface.
//!
//! The semantics of each IPC call, independent of transport. Callers hand
//! in the component info as an opaque envelope; with an enhance module it
//! is opened by `client_deserialize`, otherwise it must be plain UTF-8 JSON.
//! Click replies go back the same way, sealed by `client_serialize`.

use std::sync::Arc;

use scmgr_core::click::ClickEvent;
use scmgr_core::component::{ComponentKind, ScId, SecurityComponent};
use scmgr_core::oracle::{CallerToken, EnhanceHandle, OracleError, Pid, TokenId};
use scmgr_core::{ErrorCode, ScError, ScResult};
use tracing::{debug, info};

use crate::registry::{Caller, ComponentRegistry};

/// App lifecycle notifications forwarded by the platform observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Foreground,
    Background,
    Died,
}

/// Reply of [`ScService::report_click`]: a result code and a message for
/// the caller's logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClickReply {
    pub code: ErrorCode,
    pub message: String,
}

impl ClickReply {
    fn from_result(result: &ScResult<()>) -> Self {
        match result {
            Ok(()) => Self {
                code: ErrorCode::Ok,
                message: String::new(),
            },
            Err(err) => Self {
                code: err.code(),
                message: err.to_string(),
            },
        }
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.code == ErrorCode::Ok
    }
}

/// Entry point for every inbound call.
#[derive(Debug, Clone)]
pub struct ScService {
    registry: Arc<ComponentRegistry>,
    max_info_len: usize,
}

impl ScService {
    #[must_use]
    pub const fn new(registry: Arc<ComponentRegistry>, max_info_len: usize) -> Self {
        Self {
            registry,
            max_info_len,
        }
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.registry
    }

    /// `Register(kind, info) -> scId`.
    pub fn register(&self, caller: &Caller, kind_code: i32, info: &[u8]) -> ScResult<ScId> {
        let kind = ComponentKind::from_code(kind_code).ok_or_else(|| {
            ScError::InvalidArgument(format!("unknown component kind {kind_code}"))
        })?;
        let (component, raw) = self.open(info)?;
        self.registry.register(caller, kind, component, &raw)
    }

    /// `Update(scId, info)`.
    pub fn update(&self, caller: &Caller, sc_id: ScId, info: &[u8]) -> ScResult<()> {
        let (component, raw) = self.open(info)?;
        self.registry.update(caller, sc_id, component, &raw)
    }

    /// `Unregister(scId)`.
    pub fn unregister(&self, caller: &Caller, sc_id: ScId) -> ScResult<()> {
        self.registry.unregister(caller, sc_id)
    }

    /// `ReportClick(scId, info, event, callerToken)`.
    ///
    /// A [`ErrorCode::WaitForConsent`] reply means the consent dialog
    /// anchored at `caller_token` is showing; the caller retries once it
    /// closes.
    pub fn report_click(
        &self,
        caller: &Caller,
        sc_id: ScId,
        info: &[u8],
        event: &ClickEvent,
        caller_token: Option<CallerToken>,
    ) -> ClickReply {
        let result = self.open(info).and_then(|(component, raw)| {
            self.registry
                .report_click(caller, sc_id, component, &raw, event, caller_token)
        });
        ClickReply::from_result(&result)
    }

    /// Wire form of a click reply: `{"code": .., "message": ..}` JSON,
    /// sealed by the enhance module when one is loaded.
    ///
    /// # Errors
    ///
    /// Returns [`ScError::Oracle`] if the reply cannot be encoded or the
    /// enhance module refuses to seal it.
    pub fn seal_reply(&self, reply: &ClickReply) -> ScResult<Vec<u8>> {
        let body = serde_json::json!({
            "code": reply.code.as_str(),
            "message": reply.message,
        });
        let payload = serde_json::to_vec(&body)
            .map_err(|err| OracleError::unavailable("enhance", err.to_string()))?;
        match self.registry.enhance() {
            Some(enhance) => enhance
                .client_serialize(&payload)
                .map_err(|err| OracleError::unavailable("enhance", err.to_string()).into()),
            None => Ok(payload),
        }
    }

    /// `VerifySavePermission(tokenId)`.
    #[must_use]
    pub fn verify_save_permission(&self, token_id: TokenId) -> bool {
        let granted = self.registry.verify_save_permission(token_id);
        debug!(token_id, granted, "save permission queried");
        granted
    }

    /// `PreRegisterProcess()`: announce the caller to the enhance module
    /// before its first registration.
    pub fn pre_register_process(&self, caller: &Caller) -> ScResult<()> {
        self.ensure_running()?;
        let enhance = self.registry.enhance().ok_or(ScError::NoEnhanceModule)?;
        enhance.add_process(caller.pid)?;
        info!(pid = caller.pid, "process pre-registered with enhance module");
        Ok(())
    }

    /// `GetEnhanceObject()`.
    pub fn get_enhance_object(&self) -> ScResult<EnhanceHandle> {
        self.ensure_running()?;
        self.registry
            .enhance()
            .and_then(|enhance| enhance.handle())
            .ok_or(ScError::NoEnhanceModule)
    }

    /// App lifecycle observer callback.
    pub fn on_app_state(&self, pid: Pid, state: AppState) {
        match state {
            AppState::Foreground => {
                self.registry.on_process_foreground(pid);
            },
            AppState::Background => {
                self.registry.on_process_background(pid);
            },
            AppState::Died => self.registry.on_process_died(pid),
        }
    }

    fn ensure_running(&self) -> ScResult<()> {
        if self.registry.is_shutting_down() {
            return Err(ScError::Unavailable("service is exiting".to_string()));
        }
        Ok(())
    }

    /// Opens the envelope and parses the component. Returns the parsed
    /// component and the raw JSON it came from.
    fn open(&self, info: &[u8]) -> ScResult<(SecurityComponent, String)> {
        self.ensure_running()?;
        if info.is_empty() || info.len() > self.max_info_len {
            return Err(ScError::InvalidArgument(format!(
                "component info is {} bytes, limit is {}",
                info.len(),
                self.max_info_len
            )));
        }
        let payload = match self.registry.enhance() {
            Some(enhance) => enhance
                .client_deserialize(info)
                .map_err(|err| ScError::InvalidArgument(err.to_string()))?,
            None => info.to_vec(),
        };
        let raw = String::from_utf8(payload)
            .map_err(|_| ScError::InvalidArgument("component info is not UTF-8".to_string()))?;
        let component = SecurityComponent::from_json(&raw)
            .map_err(|err| ScError::InvalidArgument(format!("malformed component info: {err}")))?;
        Ok((component, raw))
    }
}
