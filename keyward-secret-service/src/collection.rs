//! Request handling for a path that resolved to a collection.

use std::collections::HashMap;

use keyward_core::{AttrValue, AttributeType, ObjectClass, ObjectHandle, Template, TokenSession};
use tracing::{info, warn};
use zvariant::Value;

use crate::paths::{NO_PROMPT, item_path};
use crate::properties::{self, ObjectKind, parse_item_properties};
use crate::search::{find_matching_item, search, split_locked};
use crate::service::{Reply, Request};
use crate::session::{WireSecret, map_transport_error};
use crate::state::{ServiceError, ServiceState, map_token_error};

pub(crate) fn handle_request(
    state: &ServiceState,
    session: &dyn TokenSession,
    handle: ObjectHandle,
    collection_id: &str,
    request: Request,
) -> Result<Reply, ServiceError> {
    match request {
        Request::GetProperty { interface, name } => {
            let value =
                properties::get(session, ObjectKind::Collection, handle, &interface, &name)?;
            Ok(Reply::Property(value))
        }
        Request::SetProperty {
            interface,
            name,
            value,
        } => {
            properties::set(
                session,
                ObjectKind::Collection,
                handle,
                &interface,
                &name,
                &value,
            )?;
            Ok(Reply::Done)
        }
        Request::GetAllProperties { interface } => {
            let values = properties::get_all(session, ObjectKind::Collection, handle, &interface)?;
            Ok(Reply::Properties(values))
        }
        Request::Delete => {
            session.destroy_object(handle).map_err(map_token_error)?;
            Ok(Reply::Completed {
                prompt: NO_PROMPT.to_string(),
            })
        }
        Request::SearchItems { fields } => {
            let matches = search(session, &fields, Some(collection_id))?;
            let (unlocked, locked) = split_locked(session, matches);
            Ok(Reply::SearchResults {
                unlocked: paths_for(session, collection_id, unlocked),
                locked: paths_for(session, collection_id, locked),
            })
        }
        Request::CreateItem {
            properties,
            secret,
            replace,
        } => create_item(
            state,
            session,
            collection_id,
            &properties,
            &secret,
            replace,
        ),
        other => Err(ServiceError::Failed(format!(
            "request {other:?} is not supported on a collection"
        ))),
    }
}

fn paths_for(
    session: &dyn TokenSession,
    collection_id: &str,
    handles: Vec<ObjectHandle>,
) -> Vec<String> {
    let mut paths = Vec::with_capacity(handles.len());
    for handle in handles {
        // Concurrently deleted items simply fall out of the result.
        if let Ok(AttrValue::Text(id)) = session.get_attribute(handle, AttributeType::Id) {
            paths.push(item_path(collection_id, &id));
        }
    }
    paths
}

/// Create an item, or update one in place when `replace` finds a match on
/// the supplied lookup fields.
fn create_item(
    state: &ServiceState,
    session: &dyn TokenSession,
    collection_id: &str,
    properties: &HashMap<String, Value<'static>>,
    secret: &WireSecret,
    replace: bool,
) -> Result<Reply, ServiceError> {
    let (template, fields) = parse_item_properties(properties)?;

    let existing = match (replace, &fields) {
        (true, Some(fields)) => find_matching_item(session, collection_id, fields)?,
        _ => None,
    };

    let (handle, created) = match existing {
        Some(handle) => {
            if !template.is_empty() {
                session
                    .set_attributes(handle, &template)
                    .map_err(map_token_error)?;
            }
            (handle, false)
        }
        None => {
            let template = template
                .with(AttributeType::Class, AttrValue::Class(ObjectClass::Item))
                .with(
                    AttributeType::CollectionId,
                    AttrValue::Text(collection_id.to_string()),
                )
                .with(AttributeType::TokenStored, AttrValue::Bool(true));
            let handle = session.create_object(&template).map_err(map_token_error)?;
            (handle, true)
        }
    };

    // The secret travels through the negotiated session.  A brand-new item
    // whose secret never arrived must not survive; a replaced item keeps its
    // prior secret on failure.
    if let Err(err) = write_secret(state, session, handle, secret) {
        if created {
            if let Err(destroy_err) = session.destroy_object(handle) {
                warn!(handle, error = %destroy_err, "failed to destroy orphaned item");
            }
        }
        return Err(err);
    }

    let id = session
        .get_attribute(handle, AttributeType::Id)
        .map_err(map_token_error)?;
    let id = id
        .as_text()
        .ok_or_else(|| ServiceError::Failed("item has no identifier".to_string()))?;

    info!(collection = collection_id, item = id, created, "stored item");
    Ok(Reply::Created {
        item: item_path(collection_id, id),
        prompt: NO_PROMPT.to_string(),
    })
}

fn write_secret(
    state: &ServiceState,
    session: &dyn TokenSession,
    handle: ObjectHandle,
    secret: &WireSecret,
) -> Result<(), ServiceError> {
    let plaintext = state.transport.open(secret).map_err(map_transport_error)?;
    let template = Template::new().with(AttributeType::Value, AttrValue::Secret(plaintext));
    session
        .set_attributes(handle, &template)
        .map_err(map_token_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::collection_path;
    use crate::properties::{COLLECTION_INTERFACE, ITEM_PROP_ATTRIBUTES, ITEM_PROP_LABEL};
    use crate::testing::{TestService, wire_secret};
    use keyward_core::Attributes;

    fn item_properties(label: &str, fields: &Attributes) -> HashMap<String, Value<'static>> {
        let mut properties = HashMap::new();
        properties.insert(ITEM_PROP_LABEL.to_string(), Value::from(label.to_string()));
        properties.insert(ITEM_PROP_ATTRIBUTES.to_string(), Value::from(fields.clone()));
        properties
    }

    #[test]
    fn create_item_returns_addressable_path() {
        let svc = TestService::new();
        svc.token.seed_unlocked_collection("work", "Work");
        let session = svc.transport.open_session();
        let mut fields = Attributes::new();
        fields.insert("service".to_string(), "mail".to_string());

        let reply = svc
            .dispatch(
                &collection_path("work"),
                Request::CreateItem {
                    properties: item_properties("Mail", &fields),
                    secret: wire_secret(&session, b"pw"),
                    replace: false,
                },
            )
            .expect("create");
        match reply {
            Reply::Created { item, prompt } => {
                assert!(item.starts_with("/org/freedesktop/secrets/collection/work/"));
                assert_eq!(prompt, NO_PROMPT);
            }
            other => panic!("expected creation, got {other:?}"),
        }
    }

    #[test]
    fn replace_updates_in_place() {
        let svc = TestService::new();
        svc.token.seed_unlocked_collection("work", "Work");
        let session = svc.transport.open_session();
        let mut fields = Attributes::new();
        fields.insert("service".to_string(), "mail".to_string());

        let first = svc
            .dispatch(
                &collection_path("work"),
                Request::CreateItem {
                    properties: item_properties("Mail", &fields),
                    secret: wire_secret(&session, b"one"),
                    replace: true,
                },
            )
            .expect("create");
        let second = svc
            .dispatch(
                &collection_path("work"),
                Request::CreateItem {
                    properties: item_properties("Mail again", &fields),
                    secret: wire_secret(&session, b"two"),
                    replace: true,
                },
            )
            .expect("replace");

        let (first_path, second_path) = match (first, second) {
            (Reply::Created { item: a, .. }, Reply::Created { item: b, .. }) => (a, b),
            other => panic!("expected two creations, got {other:?}"),
        };
        assert_eq!(first_path, second_path);
        assert_eq!(svc.token.items_in_collection("work"), 1);

        let reply = svc
            .dispatch(&first_path, Request::GetSecret { session })
            .expect("get secret");
        match reply {
            Reply::Secret(secret) => assert_eq!(secret.value, b"two"),
            other => panic!("expected a secret, got {other:?}"),
        }
    }

    #[test]
    fn failed_secret_write_destroys_new_item() {
        let svc = TestService::new();
        svc.token.seed_unlocked_collection("work", "Work");
        let session = svc.transport.open_session();
        let before = svc.token.items_in_collection("work");

        svc.token.fail_value_writes(true);
        let result = svc.dispatch(
            &collection_path("work"),
            Request::CreateItem {
                properties: item_properties("Mail", &Attributes::new()),
                secret: wire_secret(&session, b"pw"),
                replace: false,
            },
        );
        svc.token.fail_value_writes(false);

        assert!(result.is_err());
        assert_eq!(svc.token.items_in_collection("work"), before);
    }

    #[test]
    fn failed_secret_write_keeps_replaced_item_intact() {
        let svc = TestService::new();
        svc.token.seed_unlocked_collection("work", "Work");
        let session = svc.transport.open_session();
        let mut fields = Attributes::new();
        fields.insert("service".to_string(), "mail".to_string());

        let first = svc
            .dispatch(
                &collection_path("work"),
                Request::CreateItem {
                    properties: item_properties("Mail", &fields),
                    secret: wire_secret(&session, b"keep"),
                    replace: true,
                },
            )
            .expect("create");
        let path = match first {
            Reply::Created { item, .. } => item,
            other => panic!("expected creation, got {other:?}"),
        };

        svc.token.fail_value_writes(true);
        let result = svc.dispatch(
            &collection_path("work"),
            Request::CreateItem {
                properties: item_properties("Mail", &fields),
                secret: wire_secret(&session, b"lost"),
                replace: true,
            },
        );
        svc.token.fail_value_writes(false);
        assert!(result.is_err());

        let reply = svc
            .dispatch(&path, Request::GetSecret { session })
            .expect("get secret");
        match reply {
            Reply::Secret(secret) => assert_eq!(secret.value, b"keep"),
            other => panic!("expected a secret, got {other:?}"),
        }
    }

    #[test]
    fn create_item_with_unknown_property_is_invalid_args() {
        let svc = TestService::new();
        svc.token.seed_unlocked_collection("work", "Work");
        let session = svc.transport.open_session();
        let mut properties = HashMap::new();
        properties.insert("bogus".to_string(), Value::from("x".to_string()));

        let result = svc.dispatch(
            &collection_path("work"),
            Request::CreateItem {
                properties,
                secret: wire_secret(&session, b"pw"),
                replace: false,
            },
        );
        assert!(matches!(result, Err(ServiceError::InvalidArgs(_))));
    }

    #[test]
    fn search_items_splits_locked_and_unlocked() {
        let svc = TestService::new();
        svc.seed_item("work", "Mail", b"pw");
        svc.seed_item("vault", "Backup", b"pw2");
        svc.token.lock_collection("vault");

        let reply = svc
            .dispatch(
                &collection_path("vault"),
                Request::SearchItems {
                    fields: Attributes::new(),
                },
            )
            .expect("search");
        match reply {
            Reply::SearchResults { unlocked, locked } => {
                assert!(unlocked.is_empty());
                assert_eq!(locked.len(), 1);
            }
            other => panic!("expected search results, got {other:?}"),
        }
    }

    #[test]
    fn delete_collection_completes_without_prompt() {
        let svc = TestService::new();
        svc.token.seed_unlocked_collection("scratch", "Scratch");
        let reply = svc
            .dispatch(&collection_path("scratch"), Request::Delete)
            .expect("delete");
        match reply {
            Reply::Completed { prompt } => assert_eq!(prompt, NO_PROMPT),
            other => panic!("expected completion, got {other:?}"),
        }
        let miss = svc.dispatch(
            &collection_path("scratch"),
            Request::GetProperty {
                interface: COLLECTION_INTERFACE.to_string(),
                name: "Label".to_string(),
            },
        );
        assert!(matches!(miss, Err(ServiceError::NoSuchObject)));
    }
}
