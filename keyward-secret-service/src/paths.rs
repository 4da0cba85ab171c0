//! Object path grammar and alias resolution.
//!
//! Pure string and table logic; nothing in this module touches the token.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::state::ServiceError;

// Path scheme
pub const SERVICE_PATH: &str = "/org/freedesktop/secrets";
pub const COLLECTION_PREFIX: &str = "/org/freedesktop/secrets/collection/";
pub const ALIAS_PREFIX: &str = "/org/freedesktop/secrets/aliases/";
pub const SESSION_PREFIX: &str = "/org/freedesktop/secrets/session/";

/// Placeholder returned where the protocol expects a prompt path but no
/// prompt is needed.
pub const NO_PROMPT: &str = "/";

/// Reserved identifier of the login keyring.
pub const LOGIN_COLLECTION: &str = "login";

/// Reserved alias that always resolves to the login keyring.
pub const DEFAULT_ALIAS: &str = "default";

/// Process-wide alias map, owned by the objects manager for its lifetime.
#[derive(Debug, Default)]
pub struct AliasTable {
    entries: Mutex<HashMap<String, String>>,
}

impl AliasTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: HashMap<String, String>) -> Self {
        Self {
            entries: Mutex::new(entries),
        }
    }

    /// Resolve an alias to a collection identifier.
    ///
    /// An explicit table entry wins; the reserved `"default"` alias falls
    /// back to the login collection even when the table has no entry for it.
    /// Any other unmapped alias yields `None` — never a literal identifier.
    pub fn resolve(&self, alias: &str) -> Option<String> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(id) = entries.get(alias) {
            return Some(id.clone());
        }
        if alias == DEFAULT_ALIAS {
            return Some(LOGIN_COLLECTION.to_string());
        }
        None
    }

    pub fn set(&self, alias: &str, collection_id: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(alias.to_string(), collection_id.to_string());
    }

    pub fn remove(&self, alias: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(alias);
    }
}

/// A parsed object path: the concrete collection identifier plus the item
/// identifier when the path addressed an item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    pub collection: String,
    pub item: Option<String>,
}

/// Parse `path` into a token object identity, substituting aliases.
///
/// Accepts `/org/freedesktop/secrets/collection/<id>[/<item>]` and the
/// alias-prefixed `/org/freedesktop/secrets/aliases/<alias>[/<item>]`.
/// Anything else — including an unmapped alias — is `NoSuchObject`.
pub fn resolve_path(aliases: &AliasTable, path: &str) -> Result<ResolvedPath, ServiceError> {
    if let Some(rest) = path.strip_prefix(COLLECTION_PREFIX) {
        let (collection, item) = split_segments(rest)?;
        return Ok(ResolvedPath {
            collection: collection.to_string(),
            item: item.map(str::to_string),
        });
    }
    if let Some(rest) = path.strip_prefix(ALIAS_PREFIX) {
        let (alias, item) = split_segments(rest)?;
        let collection = aliases.resolve(alias).ok_or(ServiceError::NoSuchObject)?;
        return Ok(ResolvedPath {
            collection,
            item: item.map(str::to_string),
        });
    }
    Err(ServiceError::NoSuchObject)
}

fn split_segments(rest: &str) -> Result<(&str, Option<&str>), ServiceError> {
    let mut segments = rest.split('/');
    let first = segments.next().unwrap_or("");
    let second = segments.next();
    if segments.next().is_some() {
        return Err(ServiceError::NoSuchObject);
    }
    if !valid_component(first) {
        return Err(ServiceError::NoSuchObject);
    }
    match second {
        None => Ok((first, None)),
        Some(item) if valid_component(item) => Ok((first, Some(item))),
        Some(_) => Err(ServiceError::NoSuchObject),
    }
}

fn valid_component(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

pub fn collection_path(collection_id: &str) -> String {
    format!("{COLLECTION_PREFIX}{collection_id}")
}

pub fn item_path(collection_id: &str, item_id: &str) -> String {
    format!("{COLLECTION_PREFIX}{collection_id}/{item_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_collection_path_resolves() {
        let aliases = AliasTable::new();
        let resolved = resolve_path(&aliases, "/org/freedesktop/secrets/collection/work")
            .expect("should resolve");
        assert_eq!(resolved.collection, "work");
        assert!(resolved.item.is_none());
    }

    #[test]
    fn item_path_resolves() {
        let aliases = AliasTable::new();
        let resolved = resolve_path(&aliases, "/org/freedesktop/secrets/collection/work/7")
            .expect("should resolve");
        assert_eq!(resolved.collection, "work");
        assert_eq!(resolved.item.as_deref(), Some("7"));
    }

    #[test]
    fn default_alias_falls_back_to_login() {
        // No explicit entry for "default" — the fallback must still apply.
        let aliases = AliasTable::new();
        let resolved = resolve_path(&aliases, "/org/freedesktop/secrets/aliases/default")
            .expect("should resolve");
        assert_eq!(resolved.collection, LOGIN_COLLECTION);
    }

    #[test]
    fn explicit_default_entry_wins_over_fallback() {
        let aliases = AliasTable::new();
        aliases.set(DEFAULT_ALIAS, "other");
        let resolved = resolve_path(&aliases, "/org/freedesktop/secrets/aliases/default")
            .expect("should resolve");
        assert_eq!(resolved.collection, "other");
    }

    #[test]
    fn unknown_alias_is_hard_failure() {
        let aliases = AliasTable::new();
        let err = resolve_path(&aliases, "/org/freedesktop/secrets/aliases/nonexistent")
            .expect_err("must not fall back to a literal id");
        assert!(matches!(err, ServiceError::NoSuchObject));
    }

    #[test]
    fn alias_item_path_resolves() {
        let aliases = AliasTable::new();
        aliases.set("mail", "imap");
        let resolved = resolve_path(&aliases, "/org/freedesktop/secrets/aliases/mail/3")
            .expect("should resolve");
        assert_eq!(resolved.collection, "imap");
        assert_eq!(resolved.item.as_deref(), Some("3"));
    }

    #[test]
    fn removed_alias_no_longer_resolves() {
        let aliases = AliasTable::new();
        aliases.set("mail", "imap");
        aliases.remove("mail");
        assert!(resolve_path(&aliases, "/org/freedesktop/secrets/aliases/mail").is_err());
    }

    #[test]
    fn foreign_prefix_is_no_such_object() {
        let aliases = AliasTable::new();
        for path in [
            "/org/example/other/collection/work",
            "/org/freedesktop/secrets",
            "/org/freedesktop/secrets/collection/",
            "/org/freedesktop/secrets/collection/a/b/c",
            "/org/freedesktop/secrets/collection/sp ace",
        ] {
            assert!(
                resolve_path(&aliases, path).is_err(),
                "path {path:?} must not resolve"
            );
        }
    }

    #[test]
    fn path_builders_round_trip() {
        let aliases = AliasTable::new();
        let path = item_path("work", "12");
        let resolved = resolve_path(&aliases, &path).expect("should resolve");
        assert_eq!(resolved.collection, "work");
        assert_eq!(resolved.item.as_deref(), Some("12"));

        let cpath = collection_path("work");
        let resolved = resolve_path(&aliases, &cpath).expect("should resolve");
        assert!(resolved.item.is_none());
    }
}
