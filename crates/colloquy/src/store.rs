use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::errors::ClientError;

/// Where the client keeps the session token between connections and restarts.
pub trait TokenStore: Send + Sync + 'static {
    fn load(&self) -> Result<Option<String>, ClientError>;

    fn save(&self, token: &str) -> Result<(), ClientError>;

    fn clear(&self) -> Result<(), ClientError>;
}

#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    token: Mutex<Option<String>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: Mutex::new(Some(token.into())),
        }
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        match self.token.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl TokenStore for MemoryTokenStore {
    fn load(&self) -> Result<Option<String>, ClientError> {
        Ok(self.slot().clone())
    }

    fn save(&self, token: &str) -> Result<(), ClientError> {
        *self.slot() = Some(token.to_owned());
        Ok(())
    }

    fn clear(&self) -> Result<(), ClientError> {
        *self.slot() = None;
        Ok(())
    }
}

/// Single-file store holding the raw token text.
#[derive(Clone, Debug)]
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TokenStore for FileTokenStore {
    /// Missing file and blank content both mean "no token".
    fn load(&self) -> Result<Option<String>, ClientError> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => {
                let token = text.trim();
                Ok((!token.is_empty()).then(|| token.to_owned()))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(ClientError::TokenStore(format!(
                "read {}: {err}",
                self.path.display()
            ))),
        }
    }

    fn save(&self, token: &str) -> Result<(), ClientError> {
        if let Some(parent) = self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|err| {
                ClientError::TokenStore(format!("create {}: {err}", parent.display()))
            })?;
        }
        std::fs::write(&self.path, token)
            .map_err(|err| ClientError::TokenStore(format!("write {}: {err}", self.path.display())))
    }

    fn clear(&self) -> Result<(), ClientError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(ClientError::TokenStore(format!(
                "remove {}: {err}",
                self.path.display()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_round_trips_and_clears() {
        let store = MemoryTokenStore::new();
        assert_eq!(store.load().expect("load"), None);
        store.save("sess-1").expect("save");
        assert_eq!(store.load().expect("load").as_deref(), Some("sess-1"));
        store.clear().expect("clear");
        assert_eq!(store.load().expect("load"), None);
    }

    #[test]
    fn file_store_persists_and_treats_missing_file_as_empty() {
        let root = std::env::temp_dir().join(format!("colloquy_store_{}", std::process::id()));
        let store = FileTokenStore::new(root.join("nested").join("token"));
        assert_eq!(store.load().expect("load missing"), None);

        store.save("sess-42").expect("save");
        let reopened = FileTokenStore::new(store.path());
        assert_eq!(reopened.load().expect("load").as_deref(), Some("sess-42"));

        reopened.clear().expect("clear");
        reopened.clear().expect("clear twice");
        assert_eq!(store.load().expect("load cleared"), None);
        let _ = std::fs::remove_dir_all(root);
    }
}
