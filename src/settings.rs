use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Deployment role. A primary server holds the short inactivity leash;
/// secondaries and standalone deployments use the long one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerRole {
    Standalone,
    Primary,
    Secondary,
}

impl ServerRole {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "standalone" => Some(ServerRole::Standalone),
            "primary" => Some(ServerRole::Primary),
            "secondary" => Some(ServerRole::Secondary),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerRole::Standalone => "standalone",
            ServerRole::Primary => "primary",
            ServerRole::Secondary => "secondary",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserCredential {
    pub user_name: String,
    pub user_id: i32,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BannedApp {
    pub app_name: String,
    pub app_version: i32,
}

/// Per-world policy overrides. Anything absent falls back to the global
/// values in [`ServerSettings`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldSettings {
    pub max_objects: Option<i32>,
    pub approved_avatars: Vec<String>,
    pub default_avatar: Option<String>,
    pub broadcast_password_tokens: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub product_name: String,
    pub product_version: [i32; 2],
    pub protocol_name: String,
    pub protocol_version: [i32; 2],
    pub users: Vec<UserCredential>,
    pub banned_client_idents: Vec<String>,
    pub banned_apps: Vec<BannedApp>,
    pub primary_inactivity_timeout_secs: u64,
    pub secondary_inactivity_timeout_secs: u64,
    pub cipher_seed: u8,
    pub max_objects_created_simultaneously: i32,
    pub max_objects_per_client: usize,
    pub max_objects_per_instance: i32,
    pub transition_expiry_secs: u64,
    pub transition_cache_capacity: usize,
    pub simple_avatar_url_prefix: String,
    pub num_simple_avatars: u32,
    pub god_user_id: i32,
    pub slave_user_id: i32,
    pub worlds: HashMap<String, WorldSettings>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            product_name: "Atrium Presence Server".to_string(),
            product_version: [0, 1],
            protocol_name: "Atrium Presence Protocol".to_string(),
            protocol_version: [0, 5],
            users: vec![
                UserCredential {
                    user_name: "__SLAVE__".to_string(),
                    user_id: 1,
                    password: "changeme-slave".to_string(),
                },
                UserCredential {
                    user_name: "god".to_string(),
                    user_id: 2,
                    password: "changeme-god".to_string(),
                },
                UserCredential {
                    user_name: "guest".to_string(),
                    user_id: 100,
                    password: "guest".to_string(),
                },
            ],
            banned_client_idents: Vec::new(),
            banned_apps: Vec::new(),
            primary_inactivity_timeout_secs: 3600,
            secondary_inactivity_timeout_secs: 7200,
            cipher_seed: crate::net::cipher::DEFAULT_CIPHER_SEED,
            max_objects_created_simultaneously: 10,
            max_objects_per_client: 100,
            max_objects_per_instance: 26,
            transition_expiry_secs: 60,
            transition_cache_capacity: 64,
            simple_avatar_url_prefix: "http://avatars.example.net/simple/default".to_string(),
            num_simple_avatars: 20,
            god_user_id: 2,
            slave_user_id: 1,
            worlds: HashMap::new(),
        }
    }
}

impl ServerSettings {
    /// Loads settings from a YAML file. A missing file is not an error;
    /// the caller falls back to the defaults.
    pub fn load(path: &Path) -> Result<Option<Self>, String> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(format!(
                    "failed to read settings file {}: {}",
                    path.display(),
                    err
                ))
            }
        };
        let settings: ServerSettings = serde_yaml::from_str(&raw).map_err(|err| {
            format!("failed to parse settings file {}: {}", path.display(), err)
        })?;
        Ok(Some(settings))
    }

    pub fn protocol_version_int(&self) -> i32 {
        self.protocol_version[0] * 100 + self.protocol_version[1]
    }

    pub fn product_version_int(&self) -> i32 {
        self.product_version[0] * 100 + self.product_version[1]
    }

    pub fn find_user(&self, user_name: &str, user_id: i32, password: &str) -> Option<&UserCredential> {
        self.users.iter().find(|user| {
            let id_match = user_id != 0 && user_id == user.user_id;
            let name_match = !user_name.is_empty() && user_name == user.user_name;
            (id_match || name_match) && password == user.password
        })
    }

    pub fn is_banned_ident(&self, client_ident: &str) -> bool {
        self.banned_client_idents
            .iter()
            .any(|ident| ident == client_ident)
    }

    pub fn is_banned_app(&self, app_name: &str, app_version: i32) -> bool {
        self.banned_apps
            .iter()
            .any(|app| app.app_name == app_name && app.app_version == app_version)
    }

    /// God and slave identities are exempt from the inactivity timeout and
    /// from ownership restrictions.
    pub fn is_privileged_user_id(&self, user_id: i32) -> bool {
        user_id != 0 && (user_id == self.god_user_id || user_id == self.slave_user_id)
    }

    pub fn inactivity_timeout(&self, role: ServerRole) -> Duration {
        match role {
            ServerRole::Primary => Duration::from_secs(self.primary_inactivity_timeout_secs),
            ServerRole::Standalone | ServerRole::Secondary => {
                Duration::from_secs(self.secondary_inactivity_timeout_secs)
            }
        }
    }

    pub fn transition_expiry(&self) -> Duration {
        Duration::from_secs(self.transition_expiry_secs)
    }

    pub fn world_settings(&self, world_name: &str) -> Option<&WorldSettings> {
        self.worlds.get(world_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_carry_the_builtin_accounts() {
        let settings = ServerSettings::default();
        assert_eq!(settings.users.len(), 3);
        assert!(settings.find_user("guest", 0, "guest").is_some());
        assert!(settings.find_user("", 2, "changeme-god").is_some());
        assert!(settings.is_privileged_user_id(1));
        assert!(settings.is_privileged_user_id(2));
        assert!(!settings.is_privileged_user_id(100));
        assert_eq!(settings.protocol_version_int(), 5);
    }

    #[test]
    fn user_lookup_requires_matching_password() {
        let settings = ServerSettings::default();
        assert!(settings.find_user("guest", 0, "wrong").is_none());
        assert!(settings.find_user("", 100, "guest").is_some());
        assert!(settings.find_user("", 0, "guest").is_none());
        assert!(settings.find_user("nobody", 0, "guest").is_none());
    }

    #[test]
    fn yaml_overrides_defaults() {
        let raw = r#"
product_name: "Test Server"
cipher_seed: 9
max_objects_per_instance: 4
banned_client_idents:
  - "bad-ident"
banned_apps:
  - app_name: "Old Door"
    app_version: 2
worlds:
  plaza:
    max_objects: 8
    approved_avatars:
      - "http://example.net/a.model"
    broadcast_password_tokens:
      - "dG9rZW4="
"#;
        let settings: ServerSettings = serde_yaml::from_str(raw).expect("parse");
        assert_eq!(settings.product_name, "Test Server");
        assert_eq!(settings.cipher_seed, 9);
        assert_eq!(settings.max_objects_per_instance, 4);
        assert!(settings.is_banned_ident("bad-ident"));
        assert!(settings.is_banned_app("Old Door", 2));
        assert!(!settings.is_banned_app("Old Door", 3));
        let plaza = settings.world_settings("plaza").expect("world");
        assert_eq!(plaza.max_objects, Some(8));
        assert_eq!(plaza.approved_avatars.len(), 1);
        // Untouched fields keep their defaults.
        assert_eq!(settings.num_simple_avatars, 20);
        assert_eq!(settings.users.len(), 3);
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let loaded = ServerSettings::load(Path::new("/nonexistent/atrium-settings.yaml"));
        assert!(matches!(loaded, Ok(None)));
    }

    #[test]
    fn timeout_tracks_role() {
        let settings = ServerSettings::default();
        assert_eq!(
            settings.inactivity_timeout(ServerRole::Primary),
            Duration::from_secs(3600)
        );
        assert_eq!(
            settings.inactivity_timeout(ServerRole::Secondary),
            Duration::from_secs(7200)
        );
        assert_eq!(
            settings.inactivity_timeout(ServerRole::Standalone),
            Duration::from_secs(7200)
        );
    }

    #[test]
    fn role_names_parse_case_insensitively() {
        assert_eq!(ServerRole::parse("Primary"), Some(ServerRole::Primary));
        assert_eq!(ServerRole::parse(" secondary "), Some(ServerRole::Secondary));
        assert_eq!(ServerRole::parse("standalone"), Some(ServerRole::Standalone));
        assert_eq!(ServerRole::parse("master"), None);
    }
}
