//! Credential resolution.
//!
//! A connect attempt needs a bearer credential. Resolution order:
//! 1. The credential passed to `connect()`
//! 2. The credential remembered from the previous successful resolution
//! 3. The configured [`CredentialStore`]
//! 4. The configured [`CredentialPrompt`] (result is saved to the store)
//!
//! If every source comes up empty, resolution fails with
//! [`ClientError::Authentication`] before any socket is opened.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tether_core::ClientError;
use tracing::{debug, warn};

/// Persistent credential storage.
pub trait CredentialStore: Send + Sync {
    /// Stored credential, if any.
    fn load(&self) -> Option<String>;

    /// Persist a credential obtained from the prompt.
    fn save(&self, credential: &str) -> Result<(), ClientError>;
}

/// Interactive credential acquisition (login dialog, CLI prompt, ...).
#[async_trait]
pub trait CredentialPrompt: Send + Sync {
    /// Ask for a credential.
    async fn prompt(&self) -> Result<String, ClientError>;
}

#[async_trait]
impl<F, Fut> CredentialPrompt for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, ClientError>> + Send + 'static,
{
    async fn prompt(&self) -> Result<String, ClientError> {
        (self)().await
    }
}

/// Where a resolved credential came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CredentialSource {
    /// Passed to `connect()`.
    Explicit,
    /// Remembered from an earlier resolution.
    Remembered,
    /// Loaded from the store.
    Store,
    /// Obtained from the prompt.
    Prompt,
}

/// The configured credential sources.
#[derive(Clone, Default)]
pub struct CredentialSources {
    store: Option<Arc<dyn CredentialStore>>,
    prompt: Option<Arc<dyn CredentialPrompt>>,
}

impl std::fmt::Debug for CredentialSources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialSources")
            .field("store", &self.store.is_some())
            .field("prompt", &self.prompt.is_some())
            .finish()
    }
}

impl CredentialSources {
    /// No store and no prompt.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `store` for persisted credentials.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use `prompt` when nothing else yields a credential.
    #[must_use]
    pub fn with_prompt(mut self, prompt: Arc<dyn CredentialPrompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    /// Resolve a credential.
    pub async fn resolve(
        &self,
        explicit: Option<String>,
        remembered: Option<String>,
    ) -> Result<(String, CredentialSource), ClientError> {
        if let Some(credential) = non_empty(explicit) {
            return Ok((credential, CredentialSource::Explicit));
        }
        if let Some(credential) = non_empty(remembered) {
            return Ok((credential, CredentialSource::Remembered));
        }
        if let Some(credential) = non_empty(self.store.as_ref().and_then(|s| s.load())) {
            debug!("credential loaded from store");
            return Ok((credential, CredentialSource::Store));
        }
        let Some(prompt) = &self.prompt else {
            return Err(ClientError::Authentication(
                "no credential available and no prompt configured".into(),
            ));
        };
        let credential = prompt.prompt().await.map_err(|e| match e {
            ClientError::Authentication(_) => e,
            other => ClientError::Authentication(format!("credential prompt failed: {other}")),
        })?;
        let Some(credential) = non_empty(Some(credential)) else {
            return Err(ClientError::Authentication(
                "credential prompt returned nothing".into(),
            ));
        };
        if let Some(store) = &self.store {
            if let Err(e) = store.save(&credential) {
                warn!(error = %e, "failed to persist prompted credential");
            }
        }
        Ok((credential, CredentialSource::Prompt))
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

// ─────────────────────────────────────────────────────────────────────────────
// Stores
// ─────────────────────────────────────────────────────────────────────────────

/// A fixed credential, e.g. from an environment variable.
#[derive(Clone)]
pub struct StaticCredential(String);

impl StaticCredential {
    /// Wrap `credential`.
    pub fn new(credential: impl Into<String>) -> Self {
        Self(credential.into())
    }
}

impl std::fmt::Debug for StaticCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StaticCredential(..)")
    }
}

impl CredentialStore for StaticCredential {
    fn load(&self) -> Option<String> {
        Some(self.0.clone())
    }

    fn save(&self, _credential: &str) -> Result<(), ClientError> {
        Ok(())
    }
}

const CREDENTIAL_FILE_NAME: &str = "credentials.json";
const CREDENTIAL_FILE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CredentialFile {
    version: u32,
    token: String,
    last_updated: String,
}

/// Credential persisted as JSON with owner-only permissions.
#[derive(Clone, Debug)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    /// Store at an explicit path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at `<data_dir>/credentials.json`.
    pub fn in_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join(CREDENTIAL_FILE_NAME))
    }

    /// File location.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> Option<String> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("failed to read credential file: {e}");
                return None;
            }
        };
        match serde_json::from_str::<CredentialFile>(&data) {
            Ok(file) if file.version == CREDENTIAL_FILE_VERSION => Some(file.token),
            Ok(file) => {
                warn!("unsupported credential file version: {}", file.version);
                None
            }
            Err(e) => {
                warn!("failed to parse credential file: {e}");
                None
            }
        }
    }

    fn save(&self, credential: &str) -> Result<(), ClientError> {
        let io_err = |e: std::io::Error| {
            ClientError::Authentication(format!("failed to write credential file: {e}"))
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let file = CredentialFile {
            version: CREDENTIAL_FILE_VERSION,
            token: credential.to_owned(),
            last_updated: chrono::Utc::now().to_rfc3339(),
        };
        let json = serde_json::to_string_pretty(&file)?;
        std::fs::write(&self.path, json).map_err(io_err)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            let _ = std::fs::set_permissions(&self.path, perms);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn prompt_returning(value: &'static str, calls: &Arc<AtomicUsize>) -> Arc<dyn CredentialPrompt> {
        let calls = Arc::clone(calls);
        Arc::new(move || {
            let _ = calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, ClientError>(value.to_owned()) }
        })
    }

    #[tokio::test]
    async fn explicit_wins() {
        let calls = Arc::new(AtomicUsize::new(0));
        let sources = CredentialSources::new()
            .with_store(Arc::new(StaticCredential::new("stored")))
            .with_prompt(prompt_returning("prompted", &calls));
        let (cred, source) = sources
            .resolve(Some("explicit".into()), Some("remembered".into()))
            .await
            .unwrap();
        assert_eq!(cred, "explicit");
        assert_eq!(source, CredentialSource::Explicit);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn remembered_before_store() {
        let sources =
            CredentialSources::new().with_store(Arc::new(StaticCredential::new("stored")));
        let (cred, source) = sources.resolve(None, Some("remembered".into())).await.unwrap();
        assert_eq!(cred, "remembered");
        assert_eq!(source, CredentialSource::Remembered);
    }

    #[tokio::test]
    async fn store_before_prompt() {
        let calls = Arc::new(AtomicUsize::new(0));
        let sources = CredentialSources::new()
            .with_store(Arc::new(StaticCredential::new("stored")))
            .with_prompt(prompt_returning("prompted", &calls));
        let (cred, source) = sources.resolve(None, None).await.unwrap();
        assert_eq!(cred, "stored");
        assert_eq!(source, CredentialSource::Store);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn prompt_result_is_saved() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileCredentialStore::in_dir(dir.path()));
        let calls = Arc::new(AtomicUsize::new(0));
        let sources = CredentialSources::new()
            .with_store(store.clone())
            .with_prompt(prompt_returning("tok-1", &calls));

        let (cred, source) = sources.resolve(None, None).await.unwrap();
        assert_eq!(cred, "tok-1");
        assert_eq!(source, CredentialSource::Prompt);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.load().as_deref(), Some("tok-1"));
    }

    #[tokio::test]
    async fn nothing_available_is_authentication_error() {
        let err = CredentialSources::new().resolve(None, None).await.unwrap_err();
        assert_matches!(err, ClientError::Authentication(_));
    }

    #[tokio::test]
    async fn blank_values_are_skipped() {
        let err = CredentialSources::new()
            .resolve(Some("  ".into()), Some(String::new()))
            .await
            .unwrap_err();
        assert_matches!(err, ClientError::Authentication(_));
    }

    #[tokio::test]
    async fn failing_prompt_maps_to_authentication() {
        let prompt: Arc<dyn CredentialPrompt> =
            Arc::new(|| async { Err::<String, _>(ClientError::Cancelled("dialog closed".into())) });
        let err = CredentialSources::new()
            .with_prompt(prompt)
            .resolve(None, None)
            .await
            .unwrap_err();
        assert_matches!(err, ClientError::Authentication(msg) if msg.contains("dialog closed"));
    }

    #[test]
    fn file_store_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FileCredentialStore::in_dir(dir.path()).load().is_none());
    }

    #[test]
    fn file_store_rejects_unknown_version() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::in_dir(dir.path());
        std::fs::write(
            store.path(),
            r#"{"version": 2, "token": "t", "lastUpdated": "2026-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert!(store.load().is_none());
    }

    #[test]
    fn file_store_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path().join("nested/deeper/credentials.json"));
        store.save("abc").unwrap();
        assert_eq!(store.load().as_deref(), Some("abc"));
    }

    #[cfg(unix)]
    #[test]
    fn file_store_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::in_dir(dir.path());
        store.save("secret").unwrap();
        let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn static_credential_debug_hides_value() {
        let debug = format!("{:?}", StaticCredential::new("secret"));
        assert!(!debug.contains("secret"));
    }
}
