use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub login: LoginConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Alias seed entries applied when the objects manager starts, e.g.
    ///
    /// ```toml
    /// [service.aliases]
    /// session = "session"
    /// ```
    ///
    /// The reserved `"default"` alias needs no entry; it always falls back
    /// to the login collection.
    #[serde(default)]
    pub aliases: HashMap<String, String>,
    /// Description of the slot designated for secret storage.  Informational
    /// only; slot selection is the token module's responsibility.
    #[serde(default = "default_storage_slot_description")]
    pub storage_slot_description: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            aliases: HashMap::new(),
            storage_slot_description: default_storage_slot_description(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginConfig {
    /// User-visible label stamped onto the login collection when the unlock
    /// flow creates it.
    #[serde(default = "default_login_label")]
    pub label: String,
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            label: default_login_label(),
        }
    }
}

fn default_storage_slot_description() -> String {
    "Secret Store".to_string()
}

fn default_login_label() -> String {
    "Login".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_gives_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert!(cfg.service.aliases.is_empty());
        assert_eq!(cfg.service.storage_slot_description, "Secret Store");
        assert_eq!(cfg.login.label, "Login");
    }

    #[test]
    fn alias_seed_entries_parse() {
        let toml_str = r#"
            [service.aliases]
            session = "session"
            work = "corp"
        "#;
        let cfg: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.service.aliases.len(), 2);
        assert_eq!(cfg.service.aliases["work"], "corp");
    }

    #[test]
    fn login_label_override() {
        let toml_str = r#"
            [login]
            label = "Anmeldung"
        "#;
        let cfg: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.login.label, "Anmeldung");
    }

    #[test]
    fn config_round_trips_through_toml() {
        let mut cfg = Config::default();
        cfg.service
            .aliases
            .insert("session".to_string(), "session".to_string());
        let serialized = toml::to_string(&cfg).unwrap();
        let deserialized: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(deserialized.service.aliases, cfg.service.aliases);
        assert_eq!(deserialized.login.label, cfg.login.label);
    }
}
