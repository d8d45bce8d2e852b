//! Component registry: the per-process component table and the state
//! machine around it.
//!
//! # Synchronisation
//!
//! Three independent domains:
//!
//! - the component table (and id allocator) behind one `RwLock`
//! - the quarantined-pid set behind its own mutex ([`MaliciousSet`])
//! - the grant map inside [`PermissionGrantManager`]
//!
//! Oracle queries (screen, window stack, permissions, consent, enhance)
//! never run while the table's write lock is held. Admission control holds
//! the write lock across the capacity check, overlap check and insertion.
//!
//! # Posture and idle exit
//!
//! When the table goes from empty to non-empty the enhance module's input
//! posture is enabled and any pending idle exit is cancelled. When it
//! becomes empty again the posture is disabled and the idle-exit timer is
//! armed. If that timer fires with the table still empty, the registry
//! flips to shutting down and rejects every further call.
//!
//! Posture changes are made under a dedicated mutex that re-reads table
//! occupancy, so concurrent register and unregister calls cannot leave the
//! posture out of step with the table. Lock order is posture, then table.
//!
//! A click whose component is unregistered while it is being verified has
//! its grant withdrawn and fails with `NotFound`.

mod malicious;
mod process;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub use malicious::{MaliciousSet, ROOT_UID};
pub use process::{ComponentEntry, ComponentTable, ProcessRegistration};
use scmgr_core::click::{ClickEvent, ClickPolicy, ClickRejection, ClickVerifier};
use scmgr_core::component::{ComponentKind, GrantStyle, ScId, SecurityComponent};
use scmgr_core::config::ServiceConfig;
use scmgr_core::occlusion::{MaskClassifier, WindowClassifier, WindowOcclusionChecker};
use scmgr_core::oracle::{
    CallerToken, EnhancePort, PermissionOracle, Pid, ScreenOracle, TokenId, Uid,
};
use scmgr_core::validator::{ContrastAndGeometryValidator, ValidationContext};
use scmgr_core::{ScError, ScResult};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::consent::FirstUseConsent;
use crate::grant::{GrantDelays, PermissionGrantManager, PERMISSION_ACCESSIBILITY_CLICK};
use crate::metrics::ScMetrics;
use crate::timer::{Clock, TimerEvent, TimerQueue, TimerTarget, SERVICE_EXIT_KEY};

/// Identity of the process making a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Caller {
    pub pid: Pid,
    pub uid: Uid,
    pub token_id: TokenId,
}

impl Caller {
    #[must_use]
    pub const fn new(pid: Pid, uid: Uid, token_id: TokenId) -> Self {
        Self { pid, uid, token_id }
    }
}

/// Collaborators handed to the registry at construction.
pub struct RegistryDeps {
    pub clock: Arc<dyn Clock>,
    pub timers: Arc<TimerQueue>,
    pub screen: Arc<dyn ScreenOracle>,
    pub permissions: Arc<dyn PermissionOracle>,
    pub consent: FirstUseConsent,
    pub enhance: Option<Arc<dyn EnhancePort>>,
    /// Defaults to a [`MaskClassifier`] over `occlusion.ui_extension_mask`.
    pub classifier: Option<Arc<dyn WindowClassifier>>,
    pub metrics: Option<ScMetrics>,
}

/// Owns every registered component and drives grants and timers.
pub struct ComponentRegistry {
    table: RwLock<ComponentTable>,
    malicious: MaliciousSet,
    grants: PermissionGrantManager,
    validator: ContrastAndGeometryValidator,
    clicks: ClickVerifier,
    consent: FirstUseConsent,
    timers: Arc<TimerQueue>,
    clock: Arc<dyn Clock>,
    screen: Arc<dyn ScreenOracle>,
    permissions: Arc<dyn PermissionOracle>,
    enhance: Option<Arc<dyn EnhancePort>>,
    metrics: Option<ScMetrics>,
    max_components_per_process: usize,
    service_exit_delay_ms: u64,
    shutting_down: AtomicBool,
    /// Whether input enhance is currently enabled.
    posture: Mutex<bool>,
    exit_tx: watch::Sender<bool>,
}

/// A grant issued by a click, kept so it can be withdrawn.
#[derive(Debug, Clone, Copy)]
enum IssuedGrant {
    Save { serial: u64 },
    Capability { newly: bool },
}

impl std::fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentRegistry")
            .field("components", &self.component_count())
            .field("quarantined", &self.malicious.len())
            .field("shutting_down", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}

impl ComponentRegistry {
    #[must_use]
    pub fn new(config: &ServiceConfig, deps: RegistryDeps) -> Self {
        let classifier = deps.classifier.unwrap_or_else(|| {
            Arc::new(MaskClassifier::new(config.occlusion.ui_extension_mask))
        });
        let grants = PermissionGrantManager::new(
            GrantDelays {
                save_revoke_ms: config.timing.save_revoke_delay_ms,
                background_revoke_ms: config.timing.background_revoke_delay_ms,
            },
            Arc::clone(&deps.timers),
            Arc::clone(&deps.clock),
            Arc::clone(&deps.permissions),
        );
        let clicks = ClickVerifier::new(
            ClickPolicy::from_config(config),
            WindowOcclusionChecker::new(classifier),
            config.validation.epsilon,
        );
        let (exit_tx, _) = watch::channel(false);
        Self {
            table: RwLock::new(ComponentTable::default()),
            malicious: MaliciousSet::new(),
            grants,
            validator: ContrastAndGeometryValidator::new(config.validation.clone()),
            clicks,
            consent: deps.consent,
            timers: deps.timers,
            clock: deps.clock,
            screen: deps.screen,
            permissions: deps.permissions,
            enhance: deps.enhance,
            metrics: deps.metrics,
            max_components_per_process: config.limits.max_components_per_process,
            service_exit_delay_ms: config.timing.service_exit_delay_ms,
            shutting_down: AtomicBool::new(false),
            posture: Mutex::new(false),
            exit_tx,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, ComponentTable> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ComponentTable> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // Component operations
    // =========================================================================

    /// Validates and stores a new component for `caller`.
    ///
    /// `raw` is the declared info as received, handed to the enhance module
    /// for its integrity check.
    pub fn register(
        &self,
        caller: &Caller,
        kind: ComponentKind,
        component: SecurityComponent,
        raw: &str,
    ) -> ScResult<ScId> {
        let result = self.register_inner(caller, kind, component, raw);
        if let Some(metrics) = &self.metrics {
            metrics.registration(kind.as_str(), status_str(&result));
        }
        if let Err(err) = &result {
            warn!(
                pid = caller.pid,
                kind = %kind,
                code = err.code().as_str(),
                reason = %err,
                "registration rejected"
            );
        }
        result
    }

    fn register_inner(
        &self,
        caller: &Caller,
        kind: ComponentKind,
        mut component: SecurityComponent,
        raw: &str,
    ) -> ScResult<ScId> {
        self.ensure_running()?;
        self.ensure_not_quarantined(caller)?;
        if component.kind() != kind {
            return Err(ScError::InvalidArgument(format!(
                "info declares a {} component, registering {kind}",
                component.kind()
            )));
        }
        component.is_grant = false;
        self.admit(caller, &mut component, raw)?;

        let rect = component.screen_rect();
        let (sc_id, active) = {
            let mut table = self.write();
            // The idle-exit timer may have fired since the first check.
            self.ensure_running()?;
            if let Some(process) = table.processes.get(&caller.pid) {
                if process.len() >= self.max_components_per_process {
                    return Err(ScError::Conflict(format!(
                        "process already owns {} components",
                        process.len()
                    )));
                }
                if let Some(existing) = process.overlapping(&rect, None) {
                    return Err(ScError::Conflict(format!(
                        "rect overlaps security component {existing}"
                    )));
                }
            }
            let sc_id = table.allocate_id().ok_or_else(|| {
                ScError::Conflict("security component ids exhausted".to_string())
            })?;
            table
                .processes
                .entry(caller.pid)
                .or_insert_with(|| ProcessRegistration::new(caller.token_id))
                .components
                .push(ComponentEntry { sc_id, component });
            (sc_id, table.component_count())
        };

        self.sync_posture();
        self.set_active(active);
        info!(pid = caller.pid, sc_id, kind = %kind, "security component registered");
        Ok(sc_id)
    }

    /// Re-validates and replaces the stored info of `sc_id`. The grant flag
    /// is carried over.
    pub fn update(
        &self,
        caller: &Caller,
        sc_id: ScId,
        mut component: SecurityComponent,
        raw: &str,
    ) -> ScResult<()> {
        self.ensure_running()?;
        self.ensure_not_quarantined(caller)?;
        check_sc_id(sc_id)?;
        let stored_kind = self
            .read()
            .lookup(caller.pid, sc_id)
            .map(|entry| entry.component.kind())
            .ok_or(ScError::NotFound {
                sc_id,
                pid: caller.pid,
            })?;
        if component.kind() != stored_kind {
            return Err(ScError::InvalidArgument(format!(
                "component {sc_id} is a {stored_kind} component, kind cannot change"
            )));
        }
        if let Err(err) = self.admit(caller, &mut component, raw) {
            self.mark_invalid(caller.pid, sc_id);
            warn!(pid = caller.pid, sc_id, reason = %err, "update rejected");
            return Err(err);
        }

        let mut table = self.write();
        let entry = table
            .lookup_mut(caller.pid, sc_id)
            .ok_or(ScError::NotFound {
                sc_id,
                pid: caller.pid,
            })?;
        component.is_grant = entry.component.is_grant;
        entry.component = component;
        drop(table);
        debug!(pid = caller.pid, sc_id, "security component updated");
        Ok(())
    }

    /// Removes `sc_id`.
    pub fn unregister(&self, caller: &Caller, sc_id: ScId) -> ScResult<()> {
        self.ensure_running()?;
        check_sc_id(sc_id)?;
        let active = {
            let mut table = self.write();
            let not_found = ScError::NotFound {
                sc_id,
                pid: caller.pid,
            };
            let process = table.processes.get_mut(&caller.pid).ok_or(not_found.clone())?;
            process.remove(sc_id).ok_or(not_found)?;
            if process.is_empty() {
                table.processes.remove(&caller.pid);
            }
            table.component_count()
        };
        self.set_active(active);
        info!(pid = caller.pid, sc_id, "security component unregistered");
        self.sync_posture();
        Ok(())
    }

    /// Verifies a reported click against the freshly declared info and, on
    /// success, grants the kind's permission.
    pub fn report_click(
        &self,
        caller: &Caller,
        sc_id: ScId,
        component: SecurityComponent,
        raw: &str,
        event: &ClickEvent,
        caller_token: Option<CallerToken>,
    ) -> ScResult<()> {
        let kind = component.kind();
        let result = self.report_click_inner(caller, sc_id, component, raw, event, caller_token);
        if let Some(metrics) = &self.metrics {
            metrics.click_report(kind.as_str(), status_str(&result));
        }
        if let Err(err) = &result {
            warn!(
                pid = caller.pid,
                sc_id,
                event = event.kind_str(),
                code = err.code().as_str(),
                reason = %err,
                "click rejected"
            );
        }
        result
    }

    fn report_click_inner(
        &self,
        caller: &Caller,
        sc_id: ScId,
        mut component: SecurityComponent,
        raw: &str,
        event: &ClickEvent,
        caller_token: Option<CallerToken>,
    ) -> ScResult<()> {
        self.ensure_running()?;
        self.ensure_not_quarantined(caller)?;
        check_sc_id(sc_id)?;
        let kind = component.kind();
        let (stored_kind, token_id) = {
            let table = self.read();
            let process = table.processes.get(&caller.pid);
            process
                .and_then(|p| p.get(sc_id).map(|e| (e.component.kind(), p.token_id)))
                .ok_or(ScError::NotFound {
                    sc_id,
                    pid: caller.pid,
                })?
        };
        if kind != stored_kind {
            return Err(ScError::InvalidArgument(format!(
                "component {sc_id} is a {stored_kind} component, click declares {kind}"
            )));
        }
        if let Err(err) = self.admit(caller, &mut component, raw) {
            self.mark_invalid(caller.pid, sc_id);
            return Err(err);
        }

        if matches!(event, ClickEvent::Accessibility(_))
            && !self
                .permissions
                .verify_permission_granted(caller.token_id, PERMISSION_ACCESSIBILITY_CLICK)
        {
            return Err(ClickRejection::UntrustedChannel.into());
        }
        let snapshot = if matches!(event, ClickEvent::Point(_)) {
            self.screen.window_snapshot()?
        } else {
            Vec::new()
        };
        let now = self.clock.now_ms();
        if let Err(rejection) = self.clicks.check_click(&component, event, now, &snapshot) {
            if rejection.is_tampering() {
                self.quarantine(caller, rejection.as_code());
            }
            return Err(rejection.into());
        }

        self.consent.ensure(token_id, kind, caller_token)?;
        let issued = match kind.grant_style() {
            GrantStyle::PerClick => IssuedGrant::Save {
                serial: self.grants.grant_temporary(token_id),
            },
            GrantStyle::Capability => IssuedGrant::Capability {
                newly: self.grants.grant_capability(token_id, kind)?,
            },
        };

        let stored = {
            let mut table = self.write();
            if let Some(entry) = table.lookup_mut(caller.pid, sc_id) {
                component.is_grant = true;
                entry.component = component;
                true
            } else {
                false
            }
        };
        if !stored {
            self.withdraw_grant(token_id, kind, issued);
            debug!(pid = caller.pid, sc_id, "component removed while its click was verified");
            return Err(ScError::NotFound {
                sc_id,
                pid: caller.pid,
            });
        }
        if let Some(metrics) = &self.metrics {
            metrics.granted(kind.as_str());
        }
        info!(
            pid = caller.pid,
            sc_id,
            token_id,
            kind = %kind,
            "click verified, permission granted"
        );
        Ok(())
    }

    fn withdraw_grant(&self, token_id: TokenId, kind: ComponentKind, issued: IssuedGrant) {
        match issued {
            IssuedGrant::Save { serial } => {
                if self.grants.revoke_one_scheduled(token_id, serial) {
                    self.clear_grant_flags(token_id, GrantStyle::PerClick);
                }
            },
            // A capability already held before this click stays.
            IssuedGrant::Capability { newly: true } => {
                self.grants.revoke_capability(token_id, kind);
            },
            IssuedGrant::Capability { newly: false } => {},
        }
    }

    /// Whether `token_id` currently holds a save grant. Does not consume it.
    #[must_use]
    pub fn verify_save_permission(&self, token_id: TokenId) -> bool {
        self.grants.verify_has_grant(token_id)
    }

    // =========================================================================
    // Process lifecycle
    // =========================================================================

    /// Returns `false` if `pid` owns no components.
    pub fn on_process_foreground(&self, pid: Pid) -> bool {
        let Some(token_id) = self.set_foreground(pid, true) else {
            return false;
        };
        self.grants.cancel_deferred_full_revoke(token_id);
        debug!(pid, token_id, "process moved to foreground");
        true
    }

    /// Returns `false` if `pid` owns no components.
    pub fn on_process_background(&self, pid: Pid) -> bool {
        let Some(token_id) = self.set_foreground(pid, false) else {
            return false;
        };
        self.grants.deferred_full_revoke(token_id);
        debug!(pid, token_id, "process moved to background");
        true
    }

    fn set_foreground(&self, pid: Pid, foreground: bool) -> Option<TokenId> {
        let mut table = self.write();
        let process = table.processes.get_mut(&pid)?;
        process.is_foreground = foreground;
        Some(process.token_id)
    }

    /// Purges every trace of `pid`: components, grants, quarantine flag.
    pub fn on_process_died(&self, pid: Pid) {
        let (removed, active) = {
            let mut table = self.write();
            let removed = table.processes.remove(&pid);
            (removed, table.component_count())
        };
        if self.malicious.clear(pid) {
            info!(pid, "quarantine flag cleared on process death");
        }
        if let Some(enhance) = &self.enhance {
            enhance.notify_process_died(pid);
        }
        let Some(registration) = removed else {
            return;
        };
        self.grants.revoke_everything(registration.token_id);
        self.set_active(active);
        info!(
            pid,
            token_id = registration.token_id,
            components = registration.len(),
            "process died, components purged"
        );
        self.sync_posture();
    }

    // =========================================================================
    // Timers and shutdown
    // =========================================================================

    /// Arms the idle-exit timer. Called at startup and whenever the table
    /// becomes empty.
    pub fn arm_idle_exit(&self) {
        let deadline = self
            .clock
            .now_ms()
            .saturating_add(self.service_exit_delay_ms);
        self.timers
            .schedule(SERVICE_EXIT_KEY, deadline, TimerEvent::ServiceExit);
        debug!(deadline_ms = deadline, "idle exit armed");
    }

    /// Brings the input posture and idle exit in line with current table
    /// occupancy.
    fn sync_posture(&self) {
        let mut enabled = self.posture.lock().unwrap_or_else(PoisonError::into_inner);
        let occupied = !self.read().is_empty();
        if occupied {
            if self.timers.cancel(SERVICE_EXIT_KEY) {
                debug!("idle exit cancelled");
            }
            if !*enabled {
                if let Some(enhance) = &self.enhance {
                    enhance.enable_input_enhance();
                }
                *enabled = true;
                debug!("input enhance enabled");
            }
        } else if *enabled {
            if let Some(enhance) = &self.enhance {
                enhance.disable_input_enhance();
            }
            *enabled = false;
            debug!("input enhance disabled");
            self.arm_idle_exit();
        }
    }

    /// Whether the input posture is currently enabled.
    #[must_use]
    pub fn input_enhance_enabled(&self) -> bool {
        *self.posture.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies a fired timer event.
    pub fn handle_timer_event(&self, event: TimerEvent) {
        match event {
            TimerEvent::SaveRevoke { token_id, serial } => {
                if self.grants.revoke_one_scheduled(token_id, serial) {
                    self.clear_grant_flags(token_id, GrantStyle::PerClick);
                }
            },
            TimerEvent::DeferredFullRevoke { token_id } => {
                if !self.grants.revoke_capabilities(token_id).is_empty() {
                    self.clear_grant_flags(token_id, GrantStyle::Capability);
                }
            },
            TimerEvent::ServiceExit => self.begin_shutdown(),
        }
    }

    /// Fires every timer due now. Returns how many fired.
    pub fn run_due_timers(&self) -> usize {
        let due = self.timers.take_due(self.clock.now_ms());
        let fired = due.len();
        for event in due {
            self.handle_timer_event(event);
        }
        fired
    }

    fn clear_grant_flags(&self, token_id: TokenId, style: GrantStyle) {
        let mut table = self.write();
        for process in table
            .processes
            .values_mut()
            .filter(|p| p.token_id == token_id)
        {
            for entry in &mut process.components {
                if entry.component.kind().grant_style() == style {
                    entry.component.is_grant = false;
                }
            }
        }
    }

    fn begin_shutdown(&self) {
        {
            let table = self.write();
            if !table.is_empty() {
                debug!("idle exit fired with live components, ignored");
                return;
            }
            self.shutting_down.store(true, Ordering::SeqCst);
        }
        info!("no components registered, service exiting");
        self.exit_tx.send_replace(true);
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Resolves to `true` once the idle exit has fired.
    #[must_use]
    pub fn subscribe_exit(&self) -> watch::Receiver<bool> {
        self.exit_tx.subscribe()
    }

    // =========================================================================
    // Queries
    // =========================================================================

    #[must_use]
    pub fn component(&self, pid: Pid, sc_id: ScId) -> Option<SecurityComponent> {
        self.read()
            .lookup(pid, sc_id)
            .map(|entry| entry.component.clone())
    }

    #[must_use]
    pub fn component_count(&self) -> usize {
        self.read().component_count()
    }

    #[must_use]
    pub fn process(&self, pid: Pid) -> Option<ProcessRegistration> {
        self.read().processes.get(&pid).cloned()
    }

    #[must_use]
    pub fn is_quarantined(&self, pid: Pid) -> bool {
        self.malicious.contains(pid)
    }

    #[must_use]
    pub const fn grants(&self) -> &PermissionGrantManager {
        &self.grants
    }

    #[must_use]
    pub fn timers(&self) -> &Arc<TimerQueue> {
        &self.timers
    }

    #[must_use]
    pub fn enhance(&self) -> Option<&Arc<dyn EnhancePort>> {
        self.enhance.as_ref()
    }

    #[cfg(test)]
    pub(crate) fn set_next_sc_id(&self, next: ScId) {
        let mut table = self.write();
        let processes = std::mem::take(&mut table.processes);
        *table = ComponentTable::with_next_id(next);
        table.processes = processes;
    }

    // =========================================================================
    // Checks
    // =========================================================================

    fn ensure_running(&self) -> ScResult<()> {
        if self.is_shutting_down() {
            return Err(ScError::Unavailable("service is exiting".to_string()));
        }
        Ok(())
    }

    fn ensure_not_quarantined(&self, caller: &Caller) -> ScResult<()> {
        if self.malicious.contains(caller.pid) {
            return Err(ScError::Quarantined { pid: caller.pid });
        }
        Ok(())
    }

    fn quarantine(&self, caller: &Caller, reason: &str) {
        if self.malicious.mark(caller.pid, caller.uid) {
            warn!(pid = caller.pid, uid = caller.uid, reason, "process quarantined");
            if let Some(metrics) = &self.metrics {
                metrics.quarantined();
            }
        }
    }

    fn validation_context(&self, component: &SecurityComponent) -> ScResult<ValidationContext> {
        let screen = self
            .screen
            .screen_size(component.display_id, component.cross_axis)?;
        let window_scale = self.screen.window_scale(component.window_id)?;
        Ok(ValidationContext {
            screen,
            window_scale,
        })
    }

    /// Validity rules, then the enhance integrity check. An integrity
    /// failure quarantines the caller.
    fn admit(&self, caller: &Caller, component: &mut SecurityComponent, raw: &str) -> ScResult<()> {
        let ctx = self.validation_context(component)?;
        self.validator.validate_and_mark(component, &ctx)?;
        if let Some(enhance) = &self.enhance {
            if let Err(err) = enhance.check_component_info(caller.pid, component, raw) {
                component.is_valid = false;
                self.quarantine(caller, "integrity check failed");
                return Err(err.into());
            }
        }
        Ok(())
    }

    fn mark_invalid(&self, pid: Pid, sc_id: ScId) {
        if let Some(entry) = self.write().lookup_mut(pid, sc_id) {
            entry.component.is_valid = false;
        }
    }

    fn set_active(&self, active: usize) {
        if let Some(metrics) = &self.metrics {
            metrics.set_components_active(active);
        }
    }
}

impl TimerTarget for ComponentRegistry {
    fn timer_queue(&self) -> &TimerQueue {
        &self.timers
    }

    fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    fn fire(&self, event: TimerEvent) {
        self.handle_timer_event(event);
    }
}

fn check_sc_id(sc_id: ScId) -> ScResult<()> {
    if sc_id < 0 {
        return Err(ScError::InvalidArgument(format!(
            "invalid security component id {sc_id}"
        )));
    }
    Ok(())
}

fn status_str<T>(result: &ScResult<T>) -> &'static str {
    match result {
        Ok(_) => "OK",
        Err(err) => err.code().as_str(),
    }
}
