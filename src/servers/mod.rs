//! Server registry
//!
//! CRUD over server records persisted as a single ordered JSON document.
//! Secret fields go through the [`CredentialVault`] on the way to disk and
//! come back as plaintext on the way out.

pub mod commands;

use crate::error::{AppError, AppResult};
use crate::vault::CredentialVault;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Authentication mode of a server record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthType {
    #[serde(rename = "password")]
    Password,
    #[serde(rename = "privateKey")]
    PrivateKey,
}

/// Stored server record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRecord {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth_type: AuthType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Input for creating a server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInput {
    #[serde(default)]
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    pub auth_type: AuthType,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key_path: Option<String>,
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_port() -> u16 {
    22
}

/// Partial update; omitted fields are preserved
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub auth_type: Option<AuthType>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key_path: Option<String>,
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

const ID_SUFFIX_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Generate an id of the form `<prefix><epoch millis>-<9 random base36 chars>`
pub fn generate_id(prefix: &str) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..9)
        .map(|_| ID_SUFFIX_ALPHABET[rng.gen_range(0..ID_SUFFIX_ALPHABET.len())] as char)
        .collect();
    format!("{}{}-{}", prefix, chrono::Utc::now().timestamp_millis(), suffix)
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// A requested secret counts only when non-blank
fn supplied(value: &Option<String>) -> Option<&String> {
    value.as_ref().filter(|v| !v.trim().is_empty())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn validate(host: &str, port: u16, username: &str) -> AppResult<()> {
    if host.trim().is_empty() {
        return Err(AppError::InvalidInput("Host is required".to_string()));
    }
    if port == 0 {
        return Err(AppError::InvalidInput("Port must be between 1 and 65535".to_string()));
    }
    if username.trim().is_empty() {
        return Err(AppError::InvalidInput("Username is required".to_string()));
    }
    Ok(())
}

/// Server store backed by `servers.json`
pub struct ServerStore {
    path: PathBuf,
    vault: Arc<CredentialVault>,
    // serialises read-modify-write cycles within this process
    write_lock: Mutex<()>,
}

impl ServerStore {
    pub fn new(path: impl Into<PathBuf>, vault: Arc<CredentialVault>) -> Self {
        Self {
            path: path.into(),
            vault,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read records exactly as stored (secrets still enveloped)
    fn read_raw(&self) -> AppResult<Vec<ServerRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    /// Rewrite the whole document, sealing any plaintext secret
    fn write_raw(&self, servers: Vec<ServerRecord>) -> AppResult<()> {
        let sealed = servers
            .into_iter()
            .map(|server| self.seal(server))
            .collect::<AppResult<Vec<_>>>()?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&sealed)?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }

    fn seal(&self, mut server: ServerRecord) -> AppResult<ServerRecord> {
        server.password = non_empty(server.password)
            .map(|p| self.vault.seal(&p))
            .transpose()?;
        server.passphrase = non_empty(server.passphrase)
            .map(|p| self.vault.seal(&p))
            .transpose()?;
        Ok(server)
    }

    /// Encrypt secrets that arrived from the user. These are plaintext even
    /// when they happen to look like an envelope.
    fn encrypt_input(&self, value: Option<String>) -> AppResult<Option<String>> {
        non_empty(value).map(|v| self.vault.encrypt(&v)).transpose()
    }

    fn reveal(&self, mut server: ServerRecord) -> AppResult<ServerRecord> {
        server.password = server
            .password
            .map(|p| self.vault.reveal(&p))
            .transpose()?;
        server.passphrase = server
            .passphrase
            .map(|p| self.vault.reveal(&p))
            .transpose()?;
        Ok(server)
    }

    pub fn list(&self) -> AppResult<Vec<ServerRecord>> {
        self.read_raw()?
            .into_iter()
            .map(|server| self.reveal(server))
            .collect()
    }

    pub fn get(&self, id: &str) -> AppResult<Option<ServerRecord>> {
        self.read_raw()?
            .into_iter()
            .find(|s| s.id == id)
            .map(|server| self.reveal(server))
            .transpose()
    }

    /// Like [`get`](Self::get) but a missing id is an error
    pub fn require(&self, id: &str) -> AppResult<ServerRecord> {
        self.get(id)?
            .ok_or_else(|| AppError::ServerNotFound(id.to_string()))
    }

    pub fn create(&self, input: ServerInput) -> AppResult<ServerRecord> {
        validate(&input.host, input.port, &input.username)?;

        let _guard = self.write_lock.lock();
        let mut servers = self.read_raw()?;

        let now = now_rfc3339();
        let name = if input.name.trim().is_empty() {
            format!("{}@{}", input.username, input.host)
        } else {
            input.name
        };

        let (password, passphrase) = match input.auth_type {
            AuthType::Password => (non_empty(input.password), None),
            AuthType::PrivateKey => (None, non_empty(input.passphrase)),
        };

        let server = ServerRecord {
            id: generate_id(""),
            name,
            host: input.host,
            port: input.port,
            username: input.username,
            auth_type: input.auth_type,
            password,
            private_key_path: non_empty(input.private_key_path),
            passphrase,
            notes: input.notes,
            created_at: now.clone(),
            updated_at: now,
        };

        let stored = ServerRecord {
            password: self.encrypt_input(server.password.clone())?,
            passphrase: self.encrypt_input(server.passphrase.clone())?,
            ..server.clone()
        };
        servers.push(stored);
        self.write_raw(servers)?;

        tracing::info!("Created server {} ({}:{})", server.id, server.host, server.port);
        Ok(server)
    }

    pub fn update(&self, id: &str, mut patch: ServerPatch) -> AppResult<ServerRecord> {
        if supplied(&patch.password).is_some() {
            patch.password = self.encrypt_input(patch.password)?;
        }
        if supplied(&patch.passphrase).is_some() {
            patch.passphrase = self.encrypt_input(patch.passphrase)?;
        }

        let _guard = self.write_lock.lock();
        let mut servers = self.read_raw()?;

        let index = servers
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| AppError::ServerNotFound(id.to_string()))?;

        let merged = merge(&servers[index], patch);
        validate(&merged.host, merged.port, &merged.username)?;

        let merged = self.seal(merged)?;
        servers[index] = merged.clone();
        self.write_raw(servers)?;

        tracing::info!("Updated server {}", id);
        self.reveal(merged)
    }

    pub fn delete(&self, id: &str) -> AppResult<()> {
        let _guard = self.write_lock.lock();
        let servers = self.read_raw()?;
        let before = servers.len();

        let remaining: Vec<_> = servers.into_iter().filter(|s| s.id != id).collect();
        if remaining.len() == before {
            return Err(AppError::ServerNotFound(id.to_string()));
        }

        self.write_raw(remaining)?;
        tracing::info!("Deleted server {}", id);
        Ok(())
    }
}

/// Merge a patch over a raw stored record.
///
/// A blank secret keeps the stored envelope untouched; the secret of the
/// auth mode that is no longer in effect is dropped.
fn merge(existing: &ServerRecord, patch: ServerPatch) -> ServerRecord {
    let auth_type = patch.auth_type.unwrap_or(existing.auth_type);

    let (password, passphrase) = match auth_type {
        AuthType::Password => {
            let password = supplied(&patch.password)
                .cloned()
                .or_else(|| existing.password.clone());
            (password, None)
        }
        AuthType::PrivateKey => {
            let passphrase = supplied(&patch.passphrase)
                .cloned()
                .or_else(|| existing.passphrase.clone());
            (None, passphrase)
        }
    };

    ServerRecord {
        id: existing.id.clone(),
        name: patch.name.unwrap_or_else(|| existing.name.clone()),
        host: patch.host.unwrap_or_else(|| existing.host.clone()),
        port: patch.port.unwrap_or(existing.port),
        username: patch.username.unwrap_or_else(|| existing.username.clone()),
        auth_type,
        password,
        private_key_path: match patch.private_key_path {
            Some(path) => non_empty(Some(path)),
            None => existing.private_key_path.clone(),
        },
        passphrase,
        notes: patch.notes.or_else(|| existing.notes.clone()),
        created_at: existing.created_at.clone(),
        updated_at: now_rfc3339(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::is_envelope;

    fn store() -> (tempfile::TempDir, ServerStore) {
        let dir = tempfile::tempdir().unwrap();
        let vault = Arc::new(CredentialVault::new(dir.path().join("key.dat")));
        let store = ServerStore::new(dir.path().join("servers.json"), vault);
        (dir, store)
    }

    fn password_input(name: &str) -> ServerInput {
        ServerInput {
            name: name.to_string(),
            host: "h".to_string(),
            port: 22,
            username: "u".to_string(),
            auth_type: AuthType::Password,
            password: Some("p".to_string()),
            private_key_path: None,
            passphrase: None,
            notes: None,
        }
    }

    fn raw(store: &ServerStore) -> Vec<ServerRecord> {
        store.read_raw().unwrap()
    }

    #[test]
    fn test_create_list_and_preserve_envelope() {
        let (_dir, store) = store();
        let created = store.create(password_input("web")).unwrap();
        assert_eq!(created.password.as_deref(), Some("p"));

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].password.as_deref(), Some("p"));

        let before = raw(&store)[0].password.clone().unwrap();
        assert!(is_envelope(&before));
        assert_ne!(before, "p");

        let patch = ServerPatch {
            password: Some(String::new()),
            ..Default::default()
        };
        let updated = store.update(&created.id, patch).unwrap();
        assert_eq!(updated.password.as_deref(), Some("p"));

        let after = raw(&store)[0].password.clone().unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_plaintext_never_on_disk() {
        let (dir, store) = store();
        let mut input = password_input("db");
        input.password = Some("super-secret-pw".to_string());
        store.create(input).unwrap();

        let content = std::fs::read_to_string(dir.path().join("servers.json")).unwrap();
        assert!(!content.contains("super-secret-pw"));
    }

    #[test]
    fn test_envelope_shaped_password_is_still_encrypted() {
        let (dir, store) = store();
        let lookalike = format!("{}:{}", "ab".repeat(16), "cd".repeat(16));
        let mut input = password_input("odd");
        input.password = Some(lookalike.clone());
        let created = store.create(input).unwrap();

        let content = std::fs::read_to_string(dir.path().join("servers.json")).unwrap();
        assert!(!content.contains(&lookalike));
        assert_eq!(store.list().unwrap()[0].password.as_deref(), Some(lookalike.as_str()));

        let patch = ServerPatch {
            password: Some(lookalike.clone()),
            ..Default::default()
        };
        store.update(&created.id, patch).unwrap();
        assert_ne!(raw(&store)[0].password.as_deref(), Some(lookalike.as_str()));
        assert_eq!(store.get(&created.id).unwrap().unwrap().password, Some(lookalike));
    }

    #[test]
    fn test_new_secret_is_reencrypted() {
        let (_dir, store) = store();
        let created = store.create(password_input("a")).unwrap();
        let before = raw(&store)[0].password.clone();

        let patch = ServerPatch {
            password: Some("changed".to_string()),
            ..Default::default()
        };
        let updated = store.update(&created.id, patch).unwrap();
        assert_eq!(updated.password.as_deref(), Some("changed"));
        assert_ne!(raw(&store)[0].password, before);
    }

    #[test]
    fn test_switch_to_key_clears_password() {
        let (_dir, store) = store();
        let created = store.create(password_input("a")).unwrap();

        let patch = ServerPatch {
            auth_type: Some(AuthType::PrivateKey),
            private_key_path: Some("/home/u/.ssh/id_ed25519".to_string()),
            passphrase: Some("pp".to_string()),
            ..Default::default()
        };
        let updated = store.update(&created.id, patch).unwrap();
        assert_eq!(updated.password, None);
        assert_eq!(updated.passphrase.as_deref(), Some("pp"));
        assert_eq!(raw(&store)[0].password, None);

        let patch = ServerPatch {
            auth_type: Some(AuthType::Password),
            password: Some("back".to_string()),
            ..Default::default()
        };
        let updated = store.update(&created.id, patch).unwrap();
        assert_eq!(updated.passphrase, None);
        assert_eq!(updated.password.as_deref(), Some("back"));
        assert_eq!(raw(&store)[0].passphrase, None);
    }

    #[test]
    fn test_update_preserves_unsupplied_fields() {
        let (_dir, store) = store();
        let mut input = password_input("a");
        input.notes = Some("prod box".to_string());
        let created = store.create(input).unwrap();

        let patch = ServerPatch {
            port: Some(2222),
            ..Default::default()
        };
        let updated = store.update(&created.id, patch).unwrap();
        assert_eq!(updated.port, 2222);
        assert_eq!(updated.notes.as_deref(), Some("prod box"));
        assert_eq!(updated.name, "a");
        assert_eq!(updated.created_at, created.created_at);
    }

    #[test]
    fn test_delete_keeps_order() {
        let (_dir, store) = store();
        let a = store.create(password_input("a")).unwrap();
        let b = store.create(password_input("b")).unwrap();
        let c = store.create(password_input("c")).unwrap();

        store.delete(&b.id).unwrap();
        let ids: Vec<_> = store.list().unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![a.id, c.id]);

        assert!(matches!(store.delete(&b.id), Err(AppError::ServerNotFound(_))));
        assert!(matches!(store.delete("missing"), Err(AppError::ServerNotFound(_))));
        assert_eq!(store.list().unwrap().len(), 2);
    }

    #[test]
    fn test_update_missing_server() {
        let (_dir, store) = store();
        let result = store.update("nope", ServerPatch::default());
        assert!(matches!(result, Err(AppError::ServerNotFound(_))));
    }

    #[test]
    fn test_legacy_plaintext_is_migrated_on_write() {
        let (dir, store) = store();
        let created = store.create(password_input("a")).unwrap();

        let mut servers = raw(&store);
        servers[0].password = Some("legacy".to_string());
        std::fs::write(
            dir.path().join("servers.json"),
            serde_json::to_string(&servers).unwrap(),
        )
        .unwrap();

        assert_eq!(store.require(&created.id).unwrap().password.as_deref(), Some("legacy"));

        store.update(&created.id, ServerPatch::default()).unwrap();
        let stored = raw(&store)[0].password.clone().unwrap();
        assert!(is_envelope(&stored));
        assert_eq!(store.require(&created.id).unwrap().password.as_deref(), Some("legacy"));
    }

    #[test]
    fn test_validation() {
        let (_dir, store) = store();
        let mut input = password_input("a");
        input.port = 0;
        assert!(matches!(store.create(input), Err(AppError::InvalidInput(_))));

        let mut input = password_input("a");
        input.host = "  ".to_string();
        assert!(matches!(store.create(input), Err(AppError::InvalidInput(_))));
    }

    #[test]
    fn test_ids_are_unique() {
        let a = generate_id("session-");
        let b = generate_id("session-");
        assert!(a.starts_with("session-"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_default_name() {
        let (_dir, store) = store();
        let mut input = password_input("");
        input.username = "root".to_string();
        let created = store.create(input).unwrap();
        assert_eq!(created.name, "root@h");
    }
}
