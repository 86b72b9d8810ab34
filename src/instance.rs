use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};

use crate::error::{ForgeError, ForgeResult};
use crate::sys::{self, Segment, SharedMemory};
use crate::types::{DEFAULT_NAMESPACE, Token};

/// How many read-only attach/detach rounds precede the exclusive create.
///
/// Clears segments left behind by a holder that died while creating them.
/// Only observed to matter on some platforms.
const PROBE_ROUNDS: usize = 2;

/// Configures and performs single-instance checks for one token.
///
/// ```no_run
/// use instance_forge::SingleInstance;
///
/// let Some(_guard) = SingleInstance::new("main").namespace("MyApp").claim() else {
///     eprintln!("MyApp is already running");
///     std::process::exit(1);
/// };
/// // ... the claim is held until `_guard` is dropped.
/// ```
#[derive(Debug, Clone)]
pub struct SingleInstance {
    pub(crate) namespace: String,
    pub(crate) flag: String,
    pub(crate) lock_dir: PathBuf,
    pub(crate) backend: Arc<dyn SharedMemory>,
}

impl SingleInstance {
    /// Creates a configuration for `flag` under the default namespace.
    ///
    /// # Defaults
    /// - Namespace: [`DEFAULT_NAMESPACE`]
    /// - Lock directory: `std::env::temp_dir()` (Unix probe locks)
    /// - Backend: [`sys::default_backend`]
    pub fn new(flag: &str) -> Self {
        SingleInstance {
            namespace: DEFAULT_NAMESPACE.to_owned(),
            flag: flag.to_owned(),
            lock_dir: std::env::temp_dir(),
            backend: sys::default_backend(),
        }
    }

    /// Creates a configuration from an existing token.
    pub fn for_token(token: &Token) -> Self {
        SingleInstance::new(token.flag()).namespace(token.namespace())
    }

    // --- Public Getters ---

    /// Returns the configured lock directory.
    pub fn lock_dir_path(&self) -> &Path {
        &self.lock_dir
    }

    /// Builds the token without touching the OS.
    pub fn token(&self) -> ForgeResult<Token> {
        Token::new(&self.namespace, &self.flag)
    }

    // --- Builder Methods ---

    /// Sets the application namespace that prefixes the flag.
    pub fn namespace(mut self, namespace: &str) -> Self {
        self.namespace = namespace.to_owned();
        self
    }

    /// Sets the directory holding probe lock files (Unix only).
    pub fn lock_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.lock_dir = path.into();
        self
    }

    /// Replaces the platform backend, e.g. with [`sys::NullSharedMemory`].
    pub fn backend(mut self, backend: Arc<dyn SharedMemory>) -> Self {
        self.backend = backend;
        self
    }

    /// Validates the configuration without probing.
    /// Checks the token and that the lock directory exists.
    pub fn build(self) -> ForgeResult<Self> {
        self.token()?;
        if !self.lock_dir.is_dir() {
            return Err(ForgeError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "Lock directory does not exist",
            )));
        }
        Ok(self)
    }

    // --- Operations ---

    /// Tries to become the sole holder of the token, surfacing OS errors.
    ///
    /// `Ok(None)` means another live process (or guard) holds the token.
    pub fn try_claim(&self) -> ForgeResult<Option<InstanceGuard>> {
        let token = self.token()?;

        if !self.backend.is_supported() {
            debug!("No shared memory on this target; '{}' is not enforced", token);
            return Ok(Some(InstanceGuard {
                token,
                segment: None,
            }));
        }

        let segment = self.probe_and_create(&token)?;
        Ok(segment.map(|segment| InstanceGuard {
            token,
            segment: Some(segment),
        }))
    }

    /// Tries to become the sole holder of the token.
    ///
    /// Any OS error counts as "another instance is present".
    pub fn claim(&self) -> Option<InstanceGuard> {
        match self.try_claim() {
            Ok(Some(guard)) => {
                info!("Claimed instance token '{}'", guard.token);
                Some(guard)
            }
            Ok(None) => {
                info!("Instance token '{}_{}' is held elsewhere", self.namespace, self.flag);
                None
            }
            Err(e) => {
                warn!("Claim of '{}_{}' failed, assuming another instance: {}", self.namespace, self.flag, e);
                None
            }
        }
    }

    /// Boolean form of [`claim`](Self::claim) that holds the claim until the
    /// process exits.
    pub fn claim_flag(&self) -> bool {
        match self.claim() {
            Some(guard) => {
                guard.hold_for_process();
                true
            }
            None => false,
        }
    }

    /// Reports whether another holder currently owns the token, without
    /// taking ownership. Always `false` where the platform cannot tell.
    pub fn exists(&self) -> bool {
        let token = match self.token() {
            Ok(token) => token,
            Err(e) => {
                warn!("Cannot probe invalid token: {}", e);
                return true;
            }
        };

        if !self.backend.is_supported() {
            return false;
        }

        match self.probe_and_create(&token) {
            Ok(Some(segment)) => {
                // Releases the tentative creation before answering.
                drop(segment);
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!("Probe of '{}' failed, assuming another instance: {}", token, e);
                true
            }
        }
    }

    fn probe_and_create(&self, token: &Token) -> ForgeResult<Option<Box<dyn Segment>>> {
        let key = token.segment_key();
        let _lock = self.backend.lock(&key, &self.lock_dir)?;

        for round in 0..PROBE_ROUNDS {
            if self.backend.attach_detach(&key)? {
                debug!("Probe round {} found a segment for '{}'", round + 1, token);
            }
        }

        self.backend.create(&key)
    }
}

/// Exclusive ownership of a token.
///
/// The claim lasts until the guard is dropped. If the process dies, the OS
/// releases it.
pub struct InstanceGuard {
    token: Token,
    segment: Option<Box<dyn Segment>>,
}

impl InstanceGuard {
    /// Claims `token` with the default configuration.
    pub fn claim(token: &Token) -> Option<InstanceGuard> {
        SingleInstance::for_token(token).claim()
    }

    /// Probes `token` with the default configuration.
    pub fn exists(token: &Token) -> bool {
        SingleInstance::for_token(token).exists()
    }

    pub fn token(&self) -> &Token {
        &self.token
    }

    /// `false` when the platform cannot enforce exclusivity and the guard is
    /// only a placeholder.
    pub fn is_enforced(&self) -> bool {
        self.segment.is_some()
    }

    /// Releases the claim now.
    pub fn release(self) {
        debug!("Releasing instance token '{}'", self.token);
    }

    /// Keeps the claim for the rest of the process lifetime.
    pub fn hold_for_process(self) {
        // The OS still reclaims the segment at process exit.
        std::mem::forget(self);
    }
}

impl fmt::Debug for InstanceGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceGuard")
            .field("token", &self.token)
            .field("enforced", &self.is_enforced())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::{NullSharedMemory, ProbeLock};
    use crate::types::SegmentKey;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records calls and fails on demand.
    #[derive(Debug, Default)]
    struct ScriptedMemory {
        attaches: AtomicUsize,
        fail_attach: bool,
        fail_lock: bool,
        held: Mutex<bool>,
    }

    #[derive(Debug)]
    struct ScriptedSegment;
    impl Segment for ScriptedSegment {}

    impl SharedMemory for ScriptedMemory {
        fn lock(&self, _key: &SegmentKey, _lock_dir: &Path) -> ForgeResult<ProbeLock> {
            if self.fail_lock {
                return Err(ForgeError::Io(std::io::Error::from(
                    std::io::ErrorKind::PermissionDenied,
                )));
            }
            Ok(ProbeLock::none())
        }

        fn attach_detach(&self, _key: &SegmentKey) -> ForgeResult<bool> {
            self.attaches.fetch_add(1, Ordering::SeqCst);
            if self.fail_attach {
                return Err(ForgeError::Io(std::io::Error::from(
                    std::io::ErrorKind::PermissionDenied,
                )));
            }
            Ok(*self.held.lock().unwrap())
        }

        fn create(&self, _key: &SegmentKey) -> ForgeResult<Option<Box<dyn Segment>>> {
            let mut held = self.held.lock().unwrap();
            if *held {
                return Ok(None);
            }
            *held = true;
            Ok(Some(Box::new(ScriptedSegment)))
        }
    }

    fn with_backend(backend: Arc<dyn SharedMemory>) -> SingleInstance {
        SingleInstance::new("unit").namespace("ForgeInstanceTest").backend(backend)
    }

    #[test]
    fn probes_twice_before_creating() {
        let memory = Arc::new(ScriptedMemory::default());
        let guard = with_backend(memory.clone()).claim();
        assert!(guard.is_some());
        assert_eq!(memory.attaches.load(Ordering::SeqCst), PROBE_ROUNDS);
    }

    #[test]
    fn second_claim_is_refused() {
        let memory = Arc::new(ScriptedMemory::default());
        let config = with_backend(memory);
        let first = config.claim();
        assert!(first.is_some());
        assert!(config.claim().is_none());
        assert!(config.exists());
    }

    #[test]
    fn claim_flag_holds_for_the_process() {
        let config = with_backend(Arc::new(ScriptedMemory::default()));
        assert!(config.claim_flag());
        assert!(!config.claim_flag());
        assert!(config.exists());
    }

    #[test]
    fn os_errors_are_treated_as_taken() {
        let failing = Arc::new(ScriptedMemory {
            fail_attach: true,
            ..Default::default()
        });
        let config = with_backend(failing);
        assert!(config.claim().is_none());
        assert!(config.exists());
        assert!(config.try_claim().is_err());
    }

    #[test]
    fn lock_errors_are_treated_as_taken() {
        let failing = Arc::new(ScriptedMemory {
            fail_lock: true,
            ..Default::default()
        });
        assert!(with_backend(failing).claim().is_none());
    }

    #[test]
    fn null_backend_is_permissive() {
        let config = with_backend(Arc::new(NullSharedMemory));
        let first = config.claim().expect("unsupported targets never block");
        let second = config.claim().expect("unsupported targets never block");
        assert!(!first.is_enforced());
        assert!(!second.is_enforced());
        assert!(!config.exists());
    }

    #[test]
    fn invalid_token_is_rejected() {
        let config = SingleInstance::new("flag").namespace("");
        assert!(matches!(config.try_claim(), Err(ForgeError::InvalidToken(_))));
        assert!(config.claim().is_none());
        assert!(config.exists());
    }

    #[test]
    fn build_checks_lock_dir() {
        let dir = tempfile::tempdir().unwrap();
        let ok = SingleInstance::new("x").lock_dir(dir.path()).build();
        assert!(ok.is_ok());

        let missing = SingleInstance::new("x").lock_dir(dir.path().join("nope")).build();
        assert!(matches!(missing, Err(ForgeError::Io(_))));
    }

    #[test]
    fn debug_shows_configuration() {
        let config = with_backend(Arc::new(NullSharedMemory));
        let rendered = format!("{:?}", config);
        assert!(rendered.starts_with("SingleInstance"));
        assert!(rendered.contains("ForgeInstanceTest"));
        assert!(rendered.contains("NullSharedMemory"));
    }

    #[test]
    fn for_token_round_trips_configuration() {
        let token = Token::new("MyApp", "editor").unwrap();
        let config = SingleInstance::for_token(&token);
        assert_eq!(config.token().unwrap(), token);
    }
}
