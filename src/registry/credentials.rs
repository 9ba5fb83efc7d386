//! Docker `config.json` credential store

use crate::error::RegistryError;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

const DOCKER_HUB_ALIASES: &[&str] = &[
    "docker.io",
    "index.docker.io",
    "registry-1.docker.io",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Default, Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct AuthEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

/// Per-registry basic credentials
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    entries: HashMap<String, Credentials>,
}

impl CredentialStore {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Path of the docker config used when none is given explicitly
    pub fn default_path() -> Option<PathBuf> {
        if let Ok(dir) = env::var("DOCKER_CONFIG") {
            return Some(PathBuf::from(dir).join("config.json"));
        }
        env::var("HOME")
            .ok()
            .map(|home| PathBuf::from(home).join(".docker").join("config.json"))
    }

    /// Load `path`, or the default location when `None`. A missing default file yields an
    /// empty store; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, RegistryError> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match Self::default_path() {
                Some(p) => (p, false),
                None => return Ok(Self::empty()),
            },
        };
        if !explicit && !path.exists() {
            return Ok(Self::empty());
        }
        let data = std::fs::read(&path).map_err(|e| {
            RegistryError::Io(format!("unable to read registry config {}: {}", path.display(), e))
        })?;
        Self::from_json(&data)
    }

    pub fn from_json(data: &[u8]) -> Result<Self, RegistryError> {
        let config: DockerConfig = serde_json::from_slice(data)?;
        let mut entries = HashMap::new();
        for (key, entry) in config.auths {
            let Some(credentials) = entry.credentials() else {
                tracing::debug!(registry = %key, "skipping registry config entry without credentials");
                continue;
            };
            entries.insert(normalize_host(&key), credentials);
        }
        Ok(Self { entries })
    }

    pub fn insert(&mut self, registry: &str, username: &str, password: &str) {
        self.entries.insert(
            normalize_host(registry),
            Credentials {
                username: username.to_string(),
                password: password.to_string(),
            },
        );
    }

    /// Credentials for `registry` (a host, optionally with port)
    pub fn basic(&self, registry: &str) -> Option<&Credentials> {
        let host = normalize_host(registry);
        if let Some(c) = self.entries.get(&host) {
            return Some(c);
        }
        if DOCKER_HUB_ALIASES.contains(&host.as_str()) {
            return DOCKER_HUB_ALIASES.iter().find_map(|alias| self.entries.get(*alias));
        }
        None
    }
}

impl AuthEntry {
    fn credentials(&self) -> Option<Credentials> {
        if let Some(auth) = self.auth.as_deref().filter(|a| !a.is_empty()) {
            let decoded = STANDARD.decode(auth).ok()?;
            let decoded = String::from_utf8(decoded).ok()?;
            let (username, password) = decoded.split_once(':')?;
            return Some(Credentials {
                username: username.to_string(),
                password: password.to_string(),
            });
        }
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Some(Credentials {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }
}

/// `https://index.docker.io/v1/` and `index.docker.io` name the same registry
fn normalize_host(key: &str) -> String {
    let key = key
        .strip_prefix("https://")
        .or_else(|| key.strip_prefix("http://"))
        .unwrap_or(key);
    key.split('/').next().unwrap_or(key).to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_auth_field_and_docker_hub_alias() {
        let auth = STANDARD.encode("user:secret:with:colons");
        let json = format!(
            r#"{{"auths":{{"https://index.docker.io/v1/":{{"auth":"{}"}},"quay.io":{{"username":"q","password":"p"}},"empty.example":{{}}}}}}"#,
            auth
        );
        let store = CredentialStore::from_json(json.as_bytes()).unwrap();

        let hub = store.basic("registry-1.docker.io").unwrap();
        assert_eq!(hub.username, "user");
        assert_eq!(hub.password, "secret:with:colons");
        assert_eq!(store.basic("docker.io"), Some(hub));

        assert_eq!(store.basic("quay.io").unwrap().username, "q");
        assert!(store.basic("empty.example").is_none());
        assert!(store.basic("other.example").is_none());
    }

    #[test]
    fn test_load_explicit_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"auths":{{"localhost:5000":{{"username":"a","password":"b"}}}}}}"#).unwrap();
        let store = CredentialStore::load(Some(file.path())).unwrap();
        assert_eq!(store.basic("localhost:5000").unwrap().password, "b");

        assert!(CredentialStore::load(Some(Path::new("/nonexistent/config.json"))).is_err());
    }
}
