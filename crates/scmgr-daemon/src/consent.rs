//! First-use consent.
//!
//! The first grant of a kind to an identity needs the user's consent. Once
//! given, it is recorded as a bit in a per-identity mask and persisted:
//!
//! ```json
//! { "records": { "100": 5 } }
//! ```
//!
//! (identity 100 consented to location and save). A missing file is an
//! empty store; a corrupt one is logged and treated as empty.

use std::collections::{BTreeSet, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use scmgr_core::component::ComponentKind;
use scmgr_core::oracle::{CallerToken, ConsentDecision, ConsentOracle, TokenId};
use scmgr_core::{ScError, ScResult};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors from persisting consent records.
#[derive(Debug, Error)]
pub enum ConsentStoreError {
    #[error("consent store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("consent store encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ConsentFile {
    #[serde(default)]
    records: HashMap<TokenId, u32>,
}

/// Persisted identity to consented-kinds mapping.
#[derive(Debug)]
pub struct ConsentStore {
    path: PathBuf,
    records: Arc<Mutex<HashMap<TokenId, u32>>>,
    /// Held across snapshot and rename, so the last write carries the
    /// newest records.
    write_lock: Arc<Mutex<()>>,
}

impl ConsentStore {
    /// Loads the store at `path`.
    #[must_use]
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let records = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<ConsentFile>(&bytes) {
                Ok(file) => {
                    debug!(
                        path = %path.display(),
                        identities = file.records.len(),
                        "consent records loaded"
                    );
                    file.records
                },
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "corrupt consent file, starting empty"
                    );
                    HashMap::new()
                },
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "cannot read consent file, starting empty"
                );
                HashMap::new()
            },
        };
        Self {
            path,
            records: Arc::new(Mutex::new(records)),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn has_consent(&self, token_id: TokenId, kind: ComponentKind) -> bool {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&token_id)
            .is_some_and(|mask| mask & kind.consent_bit() != 0)
    }

    /// Records consent. Returns `true` if it was not recorded before.
    pub fn record(&self, token_id: TokenId, kind: ComponentKind) -> bool {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let mask = records.entry(token_id).or_insert(0);
        let newly = *mask & kind.consent_bit() == 0;
        *mask |= kind.consent_bit();
        newly
    }

    /// Writes the current records synchronously.
    ///
    /// # Errors
    ///
    /// Returns an error if the temp file cannot be written or renamed.
    pub fn persist(&self) -> Result<(), ConsentStoreError> {
        write_atomic(&self.path, &self.records, &self.write_lock)
    }

    /// Writes the current records on the blocking pool when running inside
    /// a tokio runtime, synchronously otherwise. Failures are logged.
    ///
    /// The records are read when the job runs, not when it is queued.
    pub fn persist_in_background(&self) {
        let path = self.path.clone();
        let records = Arc::clone(&self.records);
        let write_lock = Arc::clone(&self.write_lock);
        let job = move || {
            if let Err(err) = write_atomic(&path, &records, &write_lock) {
                warn!(path = %path.display(), error = %err, "failed to persist consent records");
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(job);
            },
            Err(_) => job(),
        }
    }
}

/// Temp file in the target directory, then rename over the target. The
/// snapshot is taken under `write_lock`.
fn write_atomic(
    path: &Path,
    records: &Mutex<HashMap<TokenId, u32>>,
    write_lock: &Mutex<()>,
) -> Result<(), ConsentStoreError> {
    let _guard = write_lock.lock().unwrap_or_else(PoisonError::into_inner);
    let file = ConsentFile {
        records: records.lock().unwrap_or_else(PoisonError::into_inner).clone(),
    };
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    serde_json::to_writer(&mut tmp, &file)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

/// Consent gate consulted before a grant.
pub struct FirstUseConsent {
    store: Arc<ConsentStore>,
    oracle: Arc<dyn ConsentOracle>,
    required: BTreeSet<ComponentKind>,
}

impl std::fmt::Debug for FirstUseConsent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FirstUseConsent")
            .field("store", &self.store.path())
            .field("required", &self.required)
            .finish_non_exhaustive()
    }
}

impl FirstUseConsent {
    #[must_use]
    pub fn new(
        store: Arc<ConsentStore>,
        oracle: Arc<dyn ConsentOracle>,
        required: impl IntoIterator<Item = ComponentKind>,
    ) -> Self {
        Self {
            store,
            oracle,
            required: required.into_iter().collect(),
        }
    }

    #[must_use]
    pub fn store(&self) -> &ConsentStore {
        &self.store
    }

    /// `Ok(())` once `token_id` may be granted `kind`.
    ///
    /// Returns [`ScError::WaitForConsent`] while a dialog is showing; the
    /// caller retries after it closes.
    pub fn ensure(
        &self,
        token_id: TokenId,
        kind: ComponentKind,
        caller_token: Option<CallerToken>,
    ) -> ScResult<()> {
        if !self.required.contains(&kind) || self.store.has_consent(token_id, kind) {
            return Ok(());
        }
        match self.oracle.request_consent(token_id, kind, caller_token)? {
            ConsentDecision::Granted | ConsentDecision::AlreadyGranted => {
                if self.store.record(token_id, kind) {
                    info!(token_id, kind = %kind, "first-use consent recorded");
                    self.store.persist_in_background();
                }
                Ok(())
            },
            ConsentDecision::Wait => {
                debug!(token_id, kind = %kind, "waiting for first-use consent");
                Err(ScError::WaitForConsent)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use scmgr_core::oracle::OracleError;

    use super::*;

    struct Scripted {
        decision: ConsentDecision,
        calls: AtomicUsize,
    }

    impl ConsentOracle for Scripted {
        fn request_consent(
            &self,
            _: TokenId,
            _: ComponentKind,
            _: Option<CallerToken>,
        ) -> Result<ConsentDecision, OracleError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.decision)
        }
    }

    fn scripted(decision: ConsentDecision) -> Arc<Scripted> {
        Arc::new(Scripted {
            decision,
            calls: AtomicUsize::new(0),
        })
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConsentStore::open(dir.path().join("consent.json"));
        assert!(!store.has_consent(1, ComponentKind::Save));
    }

    #[test]
    fn test_corrupt_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("consent.json");
        std::fs::write(&path, b"{not json").unwrap();
        let store = ConsentStore::open(&path);
        assert!(!store.has_consent(1, ComponentKind::Location));
    }

    #[test]
    fn test_record_persist_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("consent.json");
        let store = ConsentStore::open(&path);
        assert!(store.record(100, ComponentKind::Location));
        assert!(store.record(100, ComponentKind::Save));
        assert!(!store.record(100, ComponentKind::Save));
        store.persist().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["records"]["100"], 5);

        let reloaded = ConsentStore::open(&path);
        assert!(reloaded.has_consent(100, ComponentKind::Location));
        assert!(reloaded.has_consent(100, ComponentKind::Save));
        assert!(!reloaded.has_consent(100, ComponentKind::Paste));
    }

    #[test]
    fn test_ensure_asks_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("consent.json");
        let oracle = scripted(ConsentDecision::Granted);
        let gate = FirstUseConsent::new(
            Arc::new(ConsentStore::open(&path)),
            Arc::clone(&oracle) as Arc<dyn ConsentOracle>,
            ComponentKind::all(),
        );
        gate.ensure(1, ComponentKind::Paste, None).unwrap();
        gate.ensure(1, ComponentKind::Paste, None).unwrap();
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 1);
        // No runtime here, so the write already happened.
        assert!(ConsentStore::open(&path).has_consent(1, ComponentKind::Paste));
    }

    #[test]
    fn test_wait_surfaces_retry() {
        let dir = tempfile::tempdir().unwrap();
        let gate = FirstUseConsent::new(
            Arc::new(ConsentStore::open(dir.path().join("c.json"))),
            scripted(ConsentDecision::Wait),
            ComponentKind::all(),
        );
        assert_eq!(
            gate.ensure(1, ComponentKind::Save, None),
            Err(ScError::WaitForConsent)
        );
        assert!(!gate.store().has_consent(1, ComponentKind::Save));
    }

    #[test]
    fn test_kinds_not_required_skip_dialog() {
        let dir = tempfile::tempdir().unwrap();
        let oracle = scripted(ConsentDecision::Wait);
        let gate = FirstUseConsent::new(
            Arc::new(ConsentStore::open(dir.path().join("c.json"))),
            Arc::clone(&oracle) as Arc<dyn ConsentOracle>,
            [ComponentKind::Location],
        );
        gate.ensure(1, ComponentKind::Save, None).unwrap();
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 0);
        assert!(gate.ensure(1, ComponentKind::Location, None).is_err());
    }

    #[tokio::test]
    async fn test_background_persist_on_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("consent.json");
        let store = ConsentStore::open(&path);
        store.record(7, ComponentKind::Paste);
        store.persist_in_background();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while !path.exists() {
            assert!(std::time::Instant::now() < deadline, "consent file never written");
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        // Rename is atomic, so an existing file is complete.
        assert!(ConsentStore::open(&path).has_consent(7, ComponentKind::Paste));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_background_persists_keep_every_bit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("consent.json");
        let store = ConsentStore::open(&path);
        for token_id in 0..64 {
            for kind in ComponentKind::all() {
                store.record(token_id, kind);
                store.persist_in_background();
            }
        }

        // Once the newest job has run the file must hold every record, no
        // matter the order the queued jobs finished in.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            let reloaded = ConsentStore::open(&path);
            let complete = (0..64).all(|token_id| {
                ComponentKind::all()
                    .into_iter()
                    .all(|kind| reloaded.has_consent(token_id, kind))
            });
            if complete {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "consent bits lost on disk");
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        // A final synchronous write after all queued writes must agree.
        tokio::task::spawn_blocking(move || {
            store.persist().unwrap();
            let reloaded = ConsentStore::open(store.path());
            assert!(reloaded.has_consent(63, ComponentKind::Save));
            assert!(reloaded.has_consent(0, ComponentKind::Location));
        })
        .await
        .unwrap();
    }
}
