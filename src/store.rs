//! Durable session persistence
//!
//! One plaintext JSON file holds every session record, keyed by session
//! id, rewritten wholesale on each save. The mutex makes each
//! read-modify-write atomic with respect to concurrent writers in this
//! process; cross-process sharing is out of scope.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::AgentError;
use crate::models::SessionRecord;
use crate::Result;

/// Trait for session persistence.
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, session_id: &str) -> Result<Option<SessionRecord>>;
    async fn save(&self, session_id: &str, record: &SessionRecord) -> Result<()>;
    /// Returns whether the session existed.
    async fn delete(&self, session_id: &str) -> Result<bool>;
}

//
// ================= JSON File Store =================
//

/// File-backed store. The file is read once at construction; a load error
/// degrades to an empty map rather than refusing to start.
pub struct JsonFileStore {
    path: PathBuf,
    sessions: Mutex<HashMap<String, SessionRecord>>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let sessions = load_sessions_file(&path);
        Self {
            path,
            sessions: Mutex::new(sessions),
        }
    }

    async fn write_file(&self, sessions: &HashMap<String, SessionRecord>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    AgentError::Store(format!(
                        "Failed to create session directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let serialized = serde_json::to_string_pretty(sessions)?;
        tokio::fs::write(&self.path, serialized).await.map_err(|e| {
            AgentError::Store(format!(
                "Failed to write session file {}: {}",
                self.path.display(),
                e
            ))
        })?;
        Ok(())
    }
}

fn load_sessions_file(path: &Path) -> HashMap<String, SessionRecord> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return HashMap::new(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read session file");
            return HashMap::new();
        }
    };

    match serde_json::from_str(&raw) {
        Ok(sessions) => sessions,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Corrupt session file, starting empty");
            HashMap::new()
        }
    }
}

#[async_trait::async_trait]
impl SessionStore for JsonFileStore {
    async fn load(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let sessions = self.sessions.lock().await;
        Ok(sessions.get(session_id).cloned())
    }

    async fn save(&self, session_id: &str, record: &SessionRecord) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        sessions.insert(session_id.to_string(), record.clone());

        debug!(
            session = session_id,
            hash = %snapshot_hash(record),
            "Persisting session snapshot"
        );

        self.write_file(&sessions).await
    }

    async fn delete(&self, session_id: &str) -> Result<bool> {
        let mut sessions = self.sessions.lock().await;
        let removed = sessions.remove(session_id).is_some();
        if removed {
            self.write_file(&sessions).await?;
        }
        Ok(removed)
    }
}

//
// ================= In-Memory Store =================
//

/// In-memory store for tests and ephemeral runs.
pub struct InMemoryStore {
    sessions: Mutex<HashMap<String, SessionRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SessionStore for InMemoryStore {
    async fn load(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let sessions = self.sessions.lock().await;
        Ok(sessions.get(session_id).cloned())
    }

    async fn save(&self, session_id: &str, record: &SessionRecord) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        sessions.insert(session_id.to_string(), record.clone());
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<bool> {
        let mut sessions = self.sessions.lock().await;
        Ok(sessions.remove(session_id).is_some())
    }
}

//
// ================= Snapshot Hash =================
//

/// Content hash of a persisted record.
/// Streams JSON directly into the hasher (no intermediate String).
pub fn snapshot_hash(record: &SessionRecord) -> String {
    let mut hasher = Sha256::new();

    if serde_json::to_writer(&mut HashWriter(&mut hasher), record).is_err() {
        return String::new();
    }

    hex::encode(hasher.finalize())
}

/// Adapter to allow writing into Sha256 via std::io::Write.
struct HashWriter<'a, H: Digest>(&'a mut H);

impl<'a, H: Digest> Write for HashWriter<'a, H> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Interaction, ToolInvocation, UserContext};
    use serde_json::json;

    fn temp_store_path() -> PathBuf {
        std::env::temp_dir().join(format!("sessions-{}.json", uuid::Uuid::new_v4()))
    }

    fn sample_record() -> SessionRecord {
        SessionRecord {
            history: vec![Interaction {
                user_message: "pay rent".to_string(),
                assistant_message: "Which account should I use?".to_string(),
                tool_calls: vec![ToolInvocation {
                    function_name: "vaulta_get_all_accounts".to_string(),
                    arguments: json!({}),
                    result: json!({"accounts": [{"id": "acc1"}]}),
                }],
            }],
            user_context: UserContext {
                email: Some("a@b.com".to_string()),
                ..Default::default()
            },
            auth_token: Some("tok1".to_string()),
            authenticated: true,
        }
    }

    #[tokio::test]
    async fn test_round_trip_preserves_everything() {
        let path = temp_store_path();
        let store = JsonFileStore::new(&path);
        let record = sample_record();

        store.save("s1", &record).await.unwrap();
        let loaded = store.load("s1").await.unwrap().unwrap();

        assert_eq!(loaded, record);
        assert_eq!(loaded.auth_token.as_deref(), Some("tok1"));

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_round_trip_with_null_token() {
        let path = temp_store_path();
        let store = JsonFileStore::new(&path);
        let record = SessionRecord::default();

        store.save("s1", &record).await.unwrap();

        // The raw file must carry the null token explicitly.
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"authToken\": null"));

        let loaded = store.load("s1").await.unwrap().unwrap();
        assert_eq!(loaded.auth_token, None);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_double_save_is_byte_stable() {
        let path = temp_store_path();
        let store = JsonFileStore::new(&path);
        let record = sample_record();

        store.save("s1", &record).await.unwrap();
        let first = std::fs::read(&path).unwrap();

        store.save("s1", &record).await.unwrap();
        let second = std::fs::read(&path).unwrap();

        assert_eq!(first, second);
        assert_eq!(snapshot_hash(&record), snapshot_hash(&record));

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_survives_process_restart() {
        let path = temp_store_path();
        let record = sample_record();

        {
            let store = JsonFileStore::new(&path);
            store.save("s1", &record).await.unwrap();
        }

        // A new store over the same file sees the session.
        let store = JsonFileStore::new(&path);
        let loaded = store.load("s1").await.unwrap().unwrap();
        assert_eq!(loaded, record);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_delete_removes_from_disk() {
        let path = temp_store_path();
        let store = JsonFileStore::new(&path);

        store.save("s1", &sample_record()).await.unwrap();
        assert!(store.delete("s1").await.unwrap());
        assert!(!store.delete("s1").await.unwrap());

        let store = JsonFileStore::new(&path);
        assert!(store.load("s1").await.unwrap().is_none());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_corrupt_file_degrades_to_empty() {
        let path = temp_store_path();
        std::fs::write(&path, "{ not valid json").unwrap();

        let store = JsonFileStore::new(&path);
        let loaded = tokio_test::block_on(store.load("s1")).unwrap();
        assert!(loaded.is_none());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_snapshot_hash_tracks_content() {
        let record = sample_record();
        let mut changed = record.clone();
        changed.auth_token = Some("tok2".to_string());

        assert_ne!(snapshot_hash(&record), snapshot_hash(&changed));
        assert_eq!(snapshot_hash(&record).len(), 64);
    }
}
