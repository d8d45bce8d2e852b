//! Temporary permission grants.
//!
//! Two grant styles, chosen by component kind:
//!
//! - **Per-click** (save): each verified click adds one reference to the
//!   identity's record and schedules its own auto-revoke. The grant is live
//!   while the count is non-zero.
//! - **Capability** (location, paste): the named permissions are granted
//!   in the identity oracle and stay until the owning process dies or stays
//!   in the background past the deferred-revoke delay.
//!
//! The grant map is guarded by its own mutex. Oracle calls are made outside
//! of it.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use scmgr_core::component::ComponentKind;
use scmgr_core::oracle::{PermissionOracle, TokenId};
use scmgr_core::{ScError, ScResult};
use tracing::{debug, info, warn};

use crate::timer::{full_revoke_key, save_revoke_key, Clock, TimerEvent, TimerQueue};

/// Coarse location permission.
pub const PERMISSION_APPROXIMATE_LOCATION: &str = "scmgr.permission.APPROXIMATELY_LOCATION";
/// Precise location permission.
pub const PERMISSION_LOCATION: &str = "scmgr.permission.LOCATION";
/// One-shot clipboard read.
pub const PERMISSION_SECURE_PASTE: &str = "scmgr.permission.SECURE_PASTE";
/// Held by accessibility services allowed to report clicks.
pub const PERMISSION_ACCESSIBILITY_CLICK: &str = "scmgr.permission.ACCESSIBILITY_CLICK";

/// Oracle permission names granted for a capability kind.
#[must_use]
pub const fn capability_permissions(kind: ComponentKind) -> &'static [&'static str] {
    match kind {
        ComponentKind::Location => &[PERMISSION_APPROXIMATE_LOCATION, PERMISSION_LOCATION],
        ComponentKind::Paste => &[PERMISSION_SECURE_PASTE],
        ComponentKind::Save => &[],
    }
}

/// Per-identity save grant bookkeeping.
#[derive(Debug, Default)]
struct TempGrantRecord {
    count: usize,
    /// Serials of outstanding grants, oldest first.
    pending: VecDeque<u64>,
}

#[derive(Debug, Default)]
struct GrantState {
    temporary: HashMap<TokenId, TempGrantRecord>,
    capabilities: HashMap<TokenId, BTreeSet<ComponentKind>>,
    next_serial: u64,
}

/// Delays used by the grant manager, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrantDelays {
    pub save_revoke_ms: u64,
    pub background_revoke_ms: u64,
}

/// Grants and revokes scoped permissions.
pub struct PermissionGrantManager {
    state: Mutex<GrantState>,
    delays: GrantDelays,
    timers: Arc<TimerQueue>,
    clock: Arc<dyn Clock>,
    oracle: Arc<dyn PermissionOracle>,
}

impl std::fmt::Debug for PermissionGrantManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionGrantManager")
            .field("delays", &self.delays)
            .finish_non_exhaustive()
    }
}

impl PermissionGrantManager {
    #[must_use]
    pub fn new(
        delays: GrantDelays,
        timers: Arc<TimerQueue>,
        clock: Arc<dyn Clock>,
        oracle: Arc<dyn PermissionOracle>,
    ) -> Self {
        Self {
            state: Mutex::new(GrantState::default()),
            delays,
            timers,
            clock,
            oracle,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GrantState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // Per-click grants
    // =========================================================================

    /// Adds one save grant for `token_id` and schedules its auto-revoke.
    /// Returns the grant's serial.
    pub fn grant_temporary(&self, token_id: TokenId) -> u64 {
        let deadline = self
            .clock
            .now_ms()
            .saturating_add(self.delays.save_revoke_ms);
        let mut state = self.lock();
        let serial = state.next_serial;
        state.next_serial = state.next_serial.wrapping_add(1);

        let record = state.temporary.entry(token_id).or_default();
        record.count += 1;
        record.pending.push_back(serial);
        let count = record.count;

        self.timers.schedule(
            save_revoke_key(token_id, serial),
            deadline,
            TimerEvent::SaveRevoke { token_id, serial },
        );
        info!(token_id, serial, count, deadline_ms = deadline, "save grant added");
        serial
    }

    /// Drops the save grant `serial` of `token_id` and cancels its timer if
    /// still pending. Fired by that grant's auto-revoke timer. Returns
    /// `true` if the identity has no save grant left.
    pub fn revoke_one_scheduled(&self, token_id: TokenId, serial: u64) -> bool {
        let mut state = self.lock();
        let Some(record) = state.temporary.get_mut(&token_id) else {
            debug!(token_id, serial, "save revoke for identity without grants");
            return true;
        };
        let Some(index) = record.pending.iter().position(|s| *s == serial) else {
            debug!(token_id, serial, "save grant already revoked");
            return record.count == 0;
        };
        record.pending.remove(index);
        self.timers.cancel(&save_revoke_key(token_id, serial));
        record.count = record.count.saturating_sub(1);
        let remaining = record.count;
        if remaining == 0 {
            state.temporary.remove(&token_id);
            info!(token_id, "last save grant expired");
        } else {
            debug!(token_id, remaining, "save grant expired");
        }
        remaining == 0
    }

    /// Drops every save grant of `token_id` and cancels their timers.
    pub fn revoke_all_now(&self, token_id: TokenId) {
        let Some(record) = self.lock().temporary.remove(&token_id) else {
            return;
        };
        for serial in &record.pending {
            self.timers.cancel(&save_revoke_key(token_id, *serial));
        }
        info!(token_id, revoked = record.count, "save grants revoked");
    }

    /// Returns `true` while `token_id` holds at least one save grant.
    #[must_use]
    pub fn verify_has_grant(&self, token_id: TokenId) -> bool {
        self.lock()
            .temporary
            .get(&token_id)
            .is_some_and(|record| record.count > 0)
    }

    /// Outstanding save grants for `token_id`.
    #[must_use]
    pub fn grant_count(&self, token_id: TokenId) -> usize {
        self.lock()
            .temporary
            .get(&token_id)
            .map_or(0, |record| record.count)
    }

    // =========================================================================
    // Capability grants
    // =========================================================================

    /// Grants the oracle permissions of a capability kind to `token_id`.
    /// Returns `true` if the identity did not hold `kind` before.
    ///
    /// # Errors
    ///
    /// Returns [`ScError::PermissionDenied`] if the oracle refuses a
    /// permission.
    pub fn grant_capability(&self, token_id: TokenId, kind: ComponentKind) -> ScResult<bool> {
        for permission in capability_permissions(kind) {
            self.oracle
                .grant_permission(token_id, permission)
                .map_err(|err| {
                    warn!(token_id, permission, error = %err, "permission grant refused");
                    ScError::PermissionDenied(format!("{permission}: {err}"))
                })?;
        }
        let newly = self
            .lock()
            .capabilities
            .entry(token_id)
            .or_default()
            .insert(kind);
        info!(token_id, kind = %kind, newly, "capability granted");
        Ok(newly)
    }

    /// Revokes one capability kind of `token_id`, leaving the others.
    /// Returns `true` if it was held.
    pub fn revoke_capability(&self, token_id: TokenId, kind: ComponentKind) -> bool {
        let (held, now_empty) = {
            let mut state = self.lock();
            let Some(kinds) = state.capabilities.get_mut(&token_id) else {
                return false;
            };
            let held = kinds.remove(&kind);
            let now_empty = kinds.is_empty();
            if now_empty {
                state.capabilities.remove(&token_id);
            }
            (held, now_empty)
        };
        if !held {
            return false;
        }
        if now_empty {
            self.timers.cancel(&full_revoke_key(token_id));
        }
        for permission in capability_permissions(kind) {
            if let Err(err) = self.oracle.revoke_permission(token_id, permission) {
                warn!(token_id, permission, error = %err, "permission revoke failed");
            }
        }
        info!(token_id, kind = %kind, "capability revoked");
        true
    }

    #[must_use]
    pub fn has_capability(&self, token_id: TokenId, kind: ComponentKind) -> bool {
        self.lock()
            .capabilities
            .get(&token_id)
            .is_some_and(|kinds| kinds.contains(&kind))
    }

    /// Schedules revocation of every capability of `token_id`. Returns
    /// `false` if the identity holds none.
    pub fn deferred_full_revoke(&self, token_id: TokenId) -> bool {
        if !self.lock().capabilities.contains_key(&token_id) {
            return false;
        }
        let deadline = self
            .clock
            .now_ms()
            .saturating_add(self.delays.background_revoke_ms);
        self.timers.schedule(
            full_revoke_key(token_id),
            deadline,
            TimerEvent::DeferredFullRevoke { token_id },
        );
        debug!(token_id, deadline_ms = deadline, "deferred full revoke armed");
        true
    }

    /// Returns `true` if a deferred revoke was pending.
    pub fn cancel_deferred_full_revoke(&self, token_id: TokenId) -> bool {
        let cancelled = self.timers.cancel(&full_revoke_key(token_id));
        if cancelled {
            debug!(token_id, "deferred full revoke cancelled");
        }
        cancelled
    }

    /// Revokes every capability of `token_id` now. Returns the revoked
    /// kinds.
    pub fn revoke_capabilities(&self, token_id: TokenId) -> Vec<ComponentKind> {
        self.timers.cancel(&full_revoke_key(token_id));
        let Some(kinds) = self.lock().capabilities.remove(&token_id) else {
            return Vec::new();
        };
        for kind in &kinds {
            for permission in capability_permissions(*kind) {
                if let Err(err) = self.oracle.revoke_permission(token_id, permission) {
                    warn!(token_id, permission, error = %err, "permission revoke failed");
                }
            }
        }
        info!(token_id, kinds = ?kinds, "capabilities revoked");
        kinds.into_iter().collect()
    }

    /// Save grants and capabilities, both dropped now. Used on process death.
    pub fn revoke_everything(&self, token_id: TokenId) {
        self.revoke_all_now(token_id);
        self.revoke_capabilities(token_id);
    }
}
