//! The objects manager: path-addressed dispatch plus the service-level
//! operations that span collections.

use std::collections::HashMap;
use std::sync::Arc;

use keyward_core::{AttrValue, AttributeType, Attributes, ObjectHandle, SecretBytes, TokenSession};
use tracing::debug;
use zvariant::Value;

use crate::collection;
use crate::item;
use crate::lock::lock_collection;
use crate::paths::{NO_PROMPT, collection_path, item_path, resolve_path};
use crate::properties::parse_collection_properties;
use crate::search::{search, split_locked};
use crate::session::WireSecret;
use crate::state::{ServiceError, ServiceState, map_token_error};

/// A path-addressed request.  Which variants apply depends on whether the
/// path names an item or a collection.
#[derive(Debug)]
pub enum Request {
    GetProperty {
        interface: String,
        name: String,
    },
    SetProperty {
        interface: String,
        name: String,
        value: Value<'static>,
    },
    GetAllProperties {
        interface: String,
    },
    Delete,
    /// Item only: retrieve the secret through a negotiated session.
    GetSecret {
        session: String,
    },
    /// Item only: overwrite the secret arriving through a negotiated session.
    SetSecret {
        secret: WireSecret,
    },
    /// Collection only: field-equality search scoped to this collection.
    SearchItems {
        fields: Attributes,
    },
    /// Collection only: create an item, or replace a field-matched one.
    CreateItem {
        properties: HashMap<String, Value<'static>>,
        secret: WireSecret,
        replace: bool,
    },
}

#[derive(Debug)]
pub enum Reply {
    Property(Value<'static>),
    Properties(HashMap<String, Value<'static>>),
    /// Operation finished; the prompt placeholder is `"/"` (no prompt needed
    /// in the in-process flow).
    Completed {
        prompt: String,
    },
    Secret(WireSecret),
    SearchResults {
        unlocked: Vec<String>,
        locked: Vec<String>,
    },
    Created {
        item: String,
        prompt: String,
    },
    Done,
}

pub struct SecretService {
    state: Arc<ServiceState>,
}

impl SecretService {
    pub fn new(state: Arc<ServiceState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &Arc<ServiceState> {
        &self.state
    }

    /// Resolve `path` and route `request` to the item or collection handler.
    pub fn dispatch(
        &self,
        caller: &str,
        path: &str,
        request: Request,
    ) -> Result<Reply, ServiceError> {
        debug!(caller, path, "dispatch");
        let resolved = resolve_path(&self.state.aliases, path)?;
        let session = self.state.session_for(caller)?;
        match resolved.item {
            Some(item_id) => {
                let handle = self
                    .state
                    .find_item(&*session, &resolved.collection, &item_id)?;
                item::handle_request(&self.state, &*session, handle, request)
            }
            None => {
                let handle = self.state.find_collection(&*session, &resolved.collection)?;
                collection::handle_request(
                    &self.state,
                    &*session,
                    handle,
                    &resolved.collection,
                    request,
                )
            }
        }
    }

    /// Cross-collection field search, split into unlocked and locked item
    /// paths.
    pub fn search_items(
        &self,
        caller: &str,
        fields: &Attributes,
    ) -> Result<(Vec<String>, Vec<String>), ServiceError> {
        let session = self.state.session_for(caller)?;
        let matches = search(&*session, fields, None)?;
        let (unlocked, locked) = split_locked(&*session, matches);
        Ok((
            addressable_paths(&*session, unlocked),
            addressable_paths(&*session, locked),
        ))
    }

    /// Bulk secret retrieval.  Locked, vanished, or otherwise unretrievable
    /// items are silently omitted rather than failing the whole batch.
    pub fn get_secrets(
        &self,
        caller: &str,
        item_paths: &[String],
        transport_session: &str,
    ) -> Result<HashMap<String, WireSecret>, ServiceError> {
        self.state
            .transport
            .validate(transport_session)
            .map_err(crate::session::map_transport_error)?;
        let session = self.state.session_for(caller)?;

        let mut secrets = HashMap::new();
        for path in item_paths {
            let Ok(resolved) = resolve_path(&self.state.aliases, path) else {
                continue;
            };
            let Some(item_id) = resolved.item else {
                continue;
            };
            let Ok(handle) = self
                .state
                .find_item(&*session, &resolved.collection, &item_id)
            else {
                continue;
            };
            match session.get_attribute(handle, AttributeType::Locked) {
                Ok(AttrValue::Bool(false)) => {}
                _ => continue,
            }
            let Ok(value) = session.get_attribute(handle, AttributeType::Value) else {
                continue;
            };
            let Some(bytes) = value.secret_slice() else {
                continue;
            };
            let Ok(sealed) = self
                .state
                .transport
                .seal(transport_session, SecretBytes::new(bytes.to_vec()))
            else {
                continue;
            };
            secrets.insert(path.clone(), sealed);
        }
        Ok(secrets)
    }

    /// Re-lock the collection at `path` by destroying its credentials.
    pub fn lock(&self, caller: &str, path: &str) -> Result<String, ServiceError> {
        let resolved = resolve_path(&self.state.aliases, path)?;
        if resolved.item.is_some() {
            return Err(ServiceError::Failed(
                "only collections can be locked".to_string(),
            ));
        }
        let session = self.state.session_for(caller)?;
        let handle = self.state.find_collection(&*session, &resolved.collection)?;
        lock_collection(&*session, handle)?;
        Ok(NO_PROMPT.to_string())
    }

    /// Resolve an alias to its collection path, `"/"` when unmapped.
    pub fn read_alias(&self, name: &str) -> String {
        match self.state.aliases.resolve(name) {
            Some(collection_id) => collection_path(&collection_id),
            None => NO_PROMPT.to_string(),
        }
    }

    /// Bind an alias to the collection at `path`, or remove the alias when
    /// `path` is `"/"`.  The target collection must exist.
    pub fn set_alias(&self, caller: &str, name: &str, path: &str) -> Result<(), ServiceError> {
        if path == NO_PROMPT {
            self.state.aliases.remove(name);
            return Ok(());
        }
        let resolved = resolve_path(&self.state.aliases, path)?;
        if resolved.item.is_some() {
            return Err(ServiceError::InvalidArgs(
                "an alias must name a collection".to_string(),
            ));
        }
        let session = self.state.session_for(caller)?;
        self.state.find_collection(&*session, &resolved.collection)?;
        self.state.aliases.set(name, &resolved.collection);
        Ok(())
    }

    /// Create a collection with the given properties, optionally binding an
    /// alias to it.  The new collection has no credential yet, so it reads
    /// as locked until someone unlocks it.
    pub fn create_collection(
        &self,
        caller: &str,
        properties: &HashMap<String, Value<'static>>,
        alias: &str,
    ) -> Result<(String, String), ServiceError> {
        let label = parse_collection_properties(properties)?;
        let session = self.state.session_for(caller)?;
        let template = keyward_core::Template::new()
            .with(
                AttributeType::Class,
                AttrValue::Class(keyward_core::ObjectClass::Collection),
            )
            .with(AttributeType::Label, AttrValue::Text(label))
            .with(AttributeType::TokenStored, AttrValue::Bool(true));
        let handle = session.create_object(&template).map_err(map_token_error)?;
        let id = session
            .get_attribute(handle, AttributeType::Id)
            .map_err(map_token_error)?;
        let id = id
            .as_text()
            .ok_or_else(|| ServiceError::Failed("collection has no identifier".to_string()))?;
        if !alias.is_empty() {
            self.state.aliases.set(alias, id);
        }
        Ok((collection_path(id), NO_PROMPT.to_string()))
    }
}

/// Build full item paths for handles from a cross-collection result set,
/// dropping handles whose objects vanished.
fn addressable_paths(session: &dyn TokenSession, handles: Vec<ObjectHandle>) -> Vec<String> {
    let mut result = Vec::with_capacity(handles.len());
    for handle in handles {
        let collection = match session.get_attribute(handle, AttributeType::CollectionId) {
            Ok(AttrValue::Text(id)) => id,
            _ => continue,
        };
        let id = match session.get_attribute(handle, AttributeType::Id) {
            Ok(AttrValue::Text(id)) => id,
            _ => continue,
        };
        result.push(item_path(&collection, &id));
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::properties::{COLLECTION_PROP_LABEL, ITEM_INTERFACE, ITEM_PROP_LABEL};
    use crate::testing::{TestService, wire_secret};

    #[test]
    fn round_trip_create_then_get_secret() {
        let svc = TestService::new();
        svc.token.seed_unlocked_collection("work", "Work");
        let session = svc.transport.open_session();
        let mut properties = HashMap::new();
        properties.insert(
            ITEM_PROP_LABEL.to_string(),
            Value::from("Mail".to_string()),
        );

        let reply = svc
            .dispatch(
                &collection_path("work"),
                Request::CreateItem {
                    properties,
                    secret: wire_secret(&session, b"abc123"),
                    replace: false,
                },
            )
            .expect("create");
        let path = match reply {
            Reply::Created { item, .. } => item,
            other => panic!("expected creation, got {other:?}"),
        };

        let reply = svc
            .dispatch(&path, Request::GetSecret { session })
            .expect("get secret");
        match reply {
            Reply::Secret(secret) => assert_eq!(secret.value, b"abc123"),
            other => panic!("expected a secret, got {other:?}"),
        }
    }

    #[test]
    fn dispatch_unknown_collection_is_no_such_object() {
        let svc = TestService::new();
        let reply = svc.dispatch(
            &collection_path("nonexistent"),
            Request::GetProperty {
                interface: ITEM_INTERFACE.to_string(),
                name: "Label".to_string(),
            },
        );
        assert!(matches!(reply, Err(ServiceError::NoSuchObject)));
    }

    #[test]
    fn dispatch_through_default_alias_reaches_login() {
        let svc = TestService::new();
        svc.token.seed_unlocked_collection("login", "Login");
        let reply = svc
            .dispatch(
                "/org/freedesktop/secrets/aliases/default",
                Request::GetProperty {
                    interface: crate::properties::COLLECTION_INTERFACE.to_string(),
                    name: "Label".to_string(),
                },
            )
            .expect("get label");
        match reply {
            Reply::Property(value) => {
                let label: String = value.downcast_ref().expect("string");
                assert_eq!(label, "Login");
            }
            other => panic!("expected a property, got {other:?}"),
        }
    }

    #[test]
    fn cross_collection_search_splits_lock_state() {
        let svc = TestService::new();
        svc.seed_item("work", "Mail", b"a");
        svc.seed_item("vault", "Backup", b"b");
        svc.token.lock_collection("vault");

        let (unlocked, locked) = svc
            .service
            .search_items("test", &Attributes::new())
            .expect("search");
        assert_eq!(unlocked.len(), 1);
        assert_eq!(locked.len(), 1);
        assert!(unlocked[0].contains("/collection/work/"));
        assert!(locked[0].contains("/collection/vault/"));
    }

    #[test]
    fn get_secrets_omits_locked_and_unknown_items() {
        let svc = TestService::new();
        let good = svc.seed_item("work", "Mail", b"pw");
        let hidden = svc.seed_item("vault", "Backup", b"x");
        svc.token.lock_collection("vault");
        let session = svc.transport.open_session();

        let paths = vec![
            good.clone(),
            hidden,
            item_path("work", "nonexistent"),
            "/not/a/path".to_string(),
        ];
        let secrets = svc
            .service
            .get_secrets("test", &paths, &session)
            .expect("get secrets");
        assert_eq!(secrets.len(), 1);
        assert_eq!(secrets[&good].value, b"pw");
    }

    #[test]
    fn get_secrets_without_session_is_no_session() {
        let svc = TestService::new();
        let result = svc.service.get_secrets("test", &[], "/");
        assert!(matches!(result, Err(ServiceError::NoSession)));
    }

    #[test]
    fn lock_via_service_relocks_collection() {
        let svc = TestService::new();
        let item = svc.seed_item("work", "Mail", b"pw");
        let prompt = svc
            .service
            .lock("test", &collection_path("work"))
            .expect("lock");
        assert_eq!(prompt, NO_PROMPT);
        assert_eq!(svc.token.credentials_bound_to("work"), 0);

        let session = svc.transport.open_session();
        let reply = svc.dispatch(&item, Request::GetSecret { session });
        assert!(matches!(reply, Err(ServiceError::IsLocked)));
    }

    #[test]
    fn read_alias_unmapped_is_root() {
        let svc = TestService::new();
        assert_eq!(svc.service.read_alias("nonexistent"), "/");
        assert_eq!(
            svc.service.read_alias("default"),
            collection_path(crate::paths::LOGIN_COLLECTION)
        );
    }

    #[test]
    fn set_alias_requires_existing_collection() {
        let svc = TestService::new();
        let err = svc
            .service
            .set_alias("test", "mail", &collection_path("nonexistent"))
            .expect_err("alias to a missing collection");
        assert!(matches!(err, ServiceError::NoSuchObject));

        svc.token.seed_unlocked_collection("imap", "Mail");
        svc.service
            .set_alias("test", "mail", &collection_path("imap"))
            .expect("set alias");
        assert_eq!(svc.service.read_alias("mail"), collection_path("imap"));

        svc.service
            .set_alias("test", "mail", "/")
            .expect("remove alias");
        assert_eq!(svc.service.read_alias("mail"), "/");
    }

    #[test]
    fn create_collection_starts_locked() {
        let svc = TestService::new();
        let mut properties = HashMap::new();
        properties.insert(
            COLLECTION_PROP_LABEL.to_string(),
            Value::from("Scratch".to_string()),
        );
        let (path, prompt) = svc
            .service
            .create_collection("test", &properties, "scratch")
            .expect("create collection");
        assert_eq!(prompt, NO_PROMPT);
        assert_eq!(svc.service.read_alias("scratch"), path);

        let reply = svc
            .dispatch(
                &path,
                Request::GetProperty {
                    interface: crate::properties::COLLECTION_INTERFACE.to_string(),
                    name: "Locked".to_string(),
                },
            )
            .expect("locked property");
        match reply {
            Reply::Property(value) => {
                let locked: bool = value.downcast_ref().expect("bool");
                assert!(locked);
            }
            other => panic!("expected a property, got {other:?}"),
        }
    }
}
