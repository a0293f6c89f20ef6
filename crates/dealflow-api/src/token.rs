// Session token storage.
//
// One named slot holding an opaque bearer token. Absence means anonymous.
// The slot is the single source of truth for "is there a session" --
// nothing in this crate caches a derived authenticated flag.

use std::path::PathBuf;
use std::sync::{PoisonError, RwLock};

use secrecy::{ExposeSecret, SecretString};

use crate::error::Error;

/// Default slot name, mirrored by the config crate's file and keyring
/// backends.
pub const TOKEN_SLOT: &str = "access_token";

/// A single-value credential slot shared by every outbound call.
///
/// Implementations are internally synchronized; under concurrent writes
/// the last writer wins, with no ordering imposed. `get` never fails --
/// a slot that cannot be read is indistinguishable from an anonymous
/// session.
pub trait TokenStore: Send + Sync {
    /// The current token, or `None` for an anonymous session.
    fn get(&self) -> Option<SecretString>;

    /// Persist a token, replacing any previous value.
    fn set(&self, token: SecretString) -> Result<(), Error>;

    /// Remove the token. Clearing an empty slot is not an error.
    fn clear(&self) -> Result<(), Error>;
}

// ── In-memory slot ───────────────────────────────────────────────────

/// Process-local token slot. The default for tests and for embedders
/// that manage persistence themselves.
#[derive(Default)]
pub struct MemoryTokenStore {
    slot: RwLock<Option<SecretString>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-loaded with a token.
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            slot: RwLock::new(Some(SecretString::from(token.into()))),
        }
    }
}

impl TokenStore for MemoryTokenStore {
    fn get(&self) -> Option<SecretString> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set(&self, token: SecretString) -> Result<(), Error> {
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = Some(token);
        Ok(())
    }

    fn clear(&self) -> Result<(), Error> {
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}

// ── File-backed slot ─────────────────────────────────────────────────

/// Durable token slot: one file whose entire content is the token.
///
/// A missing file is an anonymous session. Writes go through the
/// filesystem directly; concurrent writers race and the last write wins,
/// matching the trait contract.
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    /// Store the token at `path` (conventionally `<data dir>/access_token`).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl TokenStore for FileTokenStore {
    fn get(&self) -> Option<SecretString> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => {
                let token = contents.trim();
                if token.is_empty() {
                    None
                } else {
                    Some(SecretString::from(token.to_owned()))
                }
            }
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %self.path.display(), error = %e, "failed to read token slot");
                }
                None
            }
        }
    }

    fn set(&self, token: SecretString) -> Result<(), Error> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::TokenStore {
                message: format!("creating {}: {e}", parent.display()),
            })?;
        }
        std::fs::write(&self.path, token.expose_secret()).map_err(|e| Error::TokenStore {
            message: format!("writing {}: {e}", self.path.display()),
        })
    }

    fn clear(&self) -> Result<(), Error> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::TokenStore {
                message: format!("removing {}: {e}", self.path.display()),
            }),
        }
    }
}
