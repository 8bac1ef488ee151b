use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;

use crate::session::{now_utc_iso, HistoryEntry, Page, Session};

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("session '{session_id}' not found")]
    NotFound { session_id: String },
    #[error("failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("session file {} is not valid JSON: {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode session '{session_id}': {source}")]
    Encode {
        session_id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("session store lock poisoned")]
    Poisoned,
}

/// Fields the orchestrator may touch besides appending pages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionFieldsUpdate {
    pub context: Option<String>,
    pub history: Vec<HistoryEntry>,
}

/// Authoritative session persistence owned by the surrounding project system.
pub trait SessionStore: Send + Sync {
    fn load_session(&self, session_id: &str) -> Result<Session, PersistenceError>;
    fn save_session(&self, session: &Session) -> Result<(), PersistenceError>;
    fn append_page(&self, session_id: &str, page: &Page) -> Result<(), PersistenceError>;
    fn update_session_fields(
        &self,
        session_id: &str,
        update: &SessionFieldsUpdate,
    ) -> Result<(), PersistenceError>;
}

/// One pretty-printed JSON file per session under `root`.
#[derive(Debug)]
pub struct FileSessionStore {
    root: PathBuf,
    lock: Mutex<()>,
}

impl FileSessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_path(&self, session_id: &str) -> PathBuf {
        let safe: String = session_id
            .chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                    ch
                } else {
                    '_'
                }
            })
            .collect();
        self.root.join(format!("{safe}.json"))
    }

    fn read(&self, session_id: &str) -> Result<Session, PersistenceError> {
        let path = self.session_path(session_id);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(PersistenceError::NotFound {
                    session_id: session_id.to_string(),
                })
            }
            Err(source) => return Err(PersistenceError::Io { path, source }),
        };
        serde_json::from_str(&raw).map_err(|source| PersistenceError::Decode { path, source })
    }

    fn write(&self, session: &Session) -> Result<(), PersistenceError> {
        let path = self.session_path(&session.id);
        let encoded =
            serde_json::to_string_pretty(session).map_err(|source| PersistenceError::Encode {
                session_id: session.id.clone(),
                source,
            })?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| PersistenceError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(&path, encoded).map_err(|source| PersistenceError::Io { path, source })
    }

    fn modify(
        &self,
        session_id: &str,
        apply: impl FnOnce(&mut Session),
    ) -> Result<(), PersistenceError> {
        let _guard = self.lock.lock().map_err(|_| PersistenceError::Poisoned)?;
        let mut session = self.read(session_id)?;
        apply(&mut session);
        session.updated_at = now_utc_iso();
        self.write(&session)
    }
}

impl SessionStore for FileSessionStore {
    fn load_session(&self, session_id: &str) -> Result<Session, PersistenceError> {
        let _guard = self.lock.lock().map_err(|_| PersistenceError::Poisoned)?;
        self.read(session_id)
    }

    fn save_session(&self, session: &Session) -> Result<(), PersistenceError> {
        let _guard = self.lock.lock().map_err(|_| PersistenceError::Poisoned)?;
        self.write(session)
    }

    fn append_page(&self, session_id: &str, page: &Page) -> Result<(), PersistenceError> {
        self.modify(session_id, |session| {
            if session.page(&page.id).is_none() {
                session.pages.push(page.clone());
            }
        })
    }

    fn update_session_fields(
        &self,
        session_id: &str,
        update: &SessionFieldsUpdate,
    ) -> Result<(), PersistenceError> {
        self.modify(session_id, |session| {
            if let Some(context) = &update.context {
                session.context = context.clone();
            }
            session.history.extend(update.history.iter().cloned());
        })
    }
}
