//! Per-user session state: working directory plus conversation history.
//!
//! Sessions are loaded lazily from `<store>/sessions/<key>.json` on first use
//! and kept in memory for the process lifetime. The in-memory copy is
//! authoritative; disk writes that fail are reported and retried on the next
//! persist.

use core::fmt::Write as _;
use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::{
    fs,
    io::AsyncWriteExt as _,
    sync::{Mutex, OwnedMutexGuard, RwLock},
};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One recorded message in a session's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl Turn {
    pub fn user(content: impl Into<String>, timestamp: OffsetDateTime) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            timestamp,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSession {
    pub user_key: String,
    pub working_directory: PathBuf,
    #[serde(default)]
    pub history: Vec<Turn>,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("directory '{}' not found", path.display())]
    InvalidDirectory { path: PathBuf },
}

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("encoding session for {user_key}: {source}")]
    Encode {
        user_key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("writing session file {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("session store path {} exists but is not a directory", path.display())]
    NotADirectory { path: PathBuf },
    #[error("preparing session store at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

type Slot = Arc<Mutex<UserSession>>;

#[derive(Debug)]
pub struct SessionStore {
    dir: PathBuf,
    default_root: PathBuf,
    sessions: RwLock<HashMap<String, Slot>>,
}

impl SessionStore {
    /// Opens (creating if needed) the session directory. This is the only
    /// place a broken store is reported as fatal.
    pub async fn open(
        dir: impl Into<PathBuf>,
        default_root: impl Into<PathBuf>,
    ) -> Result<Self, StoreError> {
        let dir = dir.into();
        match fs::metadata(&dir).await {
            Ok(meta) if !meta.is_dir() => return Err(StoreError::NotADirectory { path: dir }),
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                fs::create_dir_all(&dir)
                    .await
                    .map_err(|source| StoreError::Io {
                        path: dir.clone(),
                        source,
                    })?;
            }
            Err(source) => return Err(StoreError::Io { path: dir, source }),
        }
        let default_root = default_root.into();
        info!(dir = %dir.display(), default_root = %default_root.display(), "Session store ready");
        Ok(Self {
            dir,
            default_root,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn default_root(&self) -> &Path {
        &self.default_root
    }

    /// Exclusive access to one user's session for the duration of a routing
    /// pass. Waiters for the same key are served in arrival order.
    pub async fn acquire(&self, user_key: &str) -> SessionHandle<'_> {
        let slot = self.slot(user_key).await;
        SessionHandle {
            store: self,
            session: slot.lock_owned().await,
        }
    }

    /// Snapshot of a user's session, creating the default one if needed.
    pub async fn get(&self, user_key: &str) -> UserSession {
        self.acquire(user_key).await.snapshot()
    }

    pub async fn set_working_directory(
        &self,
        user_key: &str,
        path: &str,
    ) -> Result<PathBuf, SessionError> {
        self.acquire(user_key).await.set_working_directory(path).await
    }

    pub async fn append_turn(&self, user_key: &str, turn: Turn) {
        self.acquire(user_key).await.append_turn(turn);
    }

    pub async fn persist(&self, user_key: &str) -> Result<(), PersistenceError> {
        self.acquire(user_key).await.persist().await
    }

    /// Disk loads happen outside the map lock; if two first accesses race,
    /// the first insert wins and the other load is discarded.
    async fn slot(&self, user_key: &str) -> Slot {
        if let Some(slot) = self.sessions.read().await.get(user_key) {
            return Arc::clone(slot);
        }
        let loaded = self.load(user_key).await;
        let mut sessions = self.sessions.write().await;
        Arc::clone(
            sessions
                .entry(user_key.to_owned())
                .or_insert_with(|| Arc::new(Mutex::new(loaded))),
        )
    }

    fn fresh(&self, user_key: &str) -> UserSession {
        UserSession {
            user_key: user_key.to_owned(),
            working_directory: self.default_root.clone(),
            history: Vec::new(),
        }
    }

    fn session_path(&self, user_key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(user_key)))
    }

    async fn load(&self, user_key: &str) -> UserSession {
        let path = self.session_path(user_key);
        let data = match fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(user = %user_key, "No stored session; starting fresh");
                return self.fresh(user_key);
            }
            Err(err) => {
                warn!(user = %user_key, path = %path.display(), error = %err, "Failed to read session file; starting fresh");
                return self.fresh(user_key);
            }
        };

        let mut session = match serde_json::from_str::<UserSession>(&data) {
            Ok(session) => session,
            Err(err) => {
                let quarantine = path.with_extension("json.corrupt");
                warn!(user = %user_key, path = %path.display(), error = %err, moved_to = %quarantine.display(), "Malformed session file; starting fresh");
                if let Err(err) = fs::rename(&path, &quarantine).await {
                    warn!(error = %err, "Failed to move malformed session file aside");
                }
                return self.fresh(user_key);
            }
        };
        user_key.clone_into(&mut session.user_key);
        if !is_dir(&session.working_directory).await {
            warn!(
                user = %user_key,
                stale = %session.working_directory.display(),
                "Stored working directory no longer exists; resetting to default root"
            );
            session.working_directory.clone_from(&self.default_root);
        }
        debug!(user = %user_key, turns = session.history.len(), "Loaded session");
        session
    }

    async fn write(&self, session: &UserSession) -> Result<(), PersistenceError> {
        let path = self.session_path(&session.user_key);
        let data = serde_json::to_vec_pretty(session).map_err(|source| PersistenceError::Encode {
            user_key: session.user_key.clone(),
            source,
        })?;
        let tmp = path.with_extension("json.tmp");
        if let Err(source) = write_replace(&tmp, &path, &data).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(PersistenceError::Write { path, source });
        }
        Ok(())
    }
}

/// Exclusive, in-flight view of one session. Dropping it releases the user's
/// serialization point.
#[derive(Debug)]
pub struct SessionHandle<'a> {
    store: &'a SessionStore,
    session: OwnedMutexGuard<UserSession>,
}

impl SessionHandle<'_> {
    #[must_use]
    pub fn working_directory(&self) -> &Path {
        &self.session.working_directory
    }

    #[must_use]
    pub fn history(&self) -> &[Turn] {
        &self.session.history
    }

    #[must_use]
    pub fn snapshot(&self) -> UserSession {
        self.session.clone()
    }

    /// Resolves `target` (tilde-expanded, relative to the current working
    /// directory) and switches to it if it is an existing directory.
    pub async fn set_working_directory(&mut self, target: &str) -> Result<PathBuf, SessionError> {
        let expanded = shellexpand::tilde(target);
        let candidate = Path::new(&*expanded);
        let candidate = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.session.working_directory.join(candidate)
        };
        match fs::canonicalize(&candidate).await {
            Ok(resolved) if is_dir(&resolved).await => {
                resolved.clone_into(&mut self.session.working_directory);
                Ok(resolved)
            }
            Ok(_) | Err(_) => Err(SessionError::InvalidDirectory { path: candidate }),
        }
    }

    pub fn reset_working_directory(&mut self) -> &Path {
        self.session
            .working_directory
            .clone_from(&self.store.default_root);
        &self.session.working_directory
    }

    /// Appends keeping history chronological: a turn stamped earlier than
    /// the last one (e.g. a message queued behind a slow reply) is clamped.
    pub fn append_turn(&mut self, mut turn: Turn) {
        if let Some(last) = self.session.history.last()
            && turn.timestamp < last.timestamp
        {
            turn.timestamp = last.timestamp;
        }
        self.session.history.push(turn);
    }

    pub async fn persist(&self) -> Result<(), PersistenceError> {
        self.store.write(&self.session).await
    }
}

async fn is_dir(path: &Path) -> bool {
    fs::metadata(path).await.is_ok_and(|meta| meta.is_dir())
}

async fn write_replace(tmp: &Path, path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = fs::File::create(tmp).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(tmp, path).await
}

/// Injective mapping from a user key to a safe file name.
fn file_stem(user_key: &str) -> String {
    let mut out = String::with_capacity(user_key.len());
    for byte in user_key.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'@') {
            out.push(char::from(byte));
        } else {
            let _ = write!(out, "%{byte:02X}");
        }
    }
    out
}
