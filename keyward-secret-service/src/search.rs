//! Attribute-template search built on transient token search objects.
//!
//! A search object exists only long enough to read its match list; every
//! code path through here destroys it, including the paths where reading
//! the matches failed.

use keyward_core::{
    AttrValue, AttributeType, Attributes, ObjectClass, ObjectHandle, Template, TokenError,
    TokenSession, fields_from_attributes,
};
use tracing::{debug, warn};

use crate::state::{ServiceError, map_token_error};

/// Evaluate a field template, optionally scoped to one collection, and
/// return the matched handles.
pub fn search(
    session: &dyn TokenSession,
    fields: &Attributes,
    collection_scope: Option<&str>,
) -> Result<Vec<ObjectHandle>, ServiceError> {
    let mut template = Template::new()
        .with(AttributeType::Class, AttrValue::Class(ObjectClass::Search))
        .with(AttributeType::TokenStored, AttrValue::Bool(false))
        .with(AttributeType::Transient, AttrValue::Bool(true))
        .with(
            AttributeType::Fields,
            AttrValue::Fields(fields_from_attributes(fields)),
        );
    if let Some(collection_id) = collection_scope {
        template.push(
            AttributeType::CollectionId,
            AttrValue::Text(collection_id.to_string()),
        );
    }

    // Nothing was created on failure, so nothing needs cleanup here.
    let search = session.create_object(&template).map_err(map_token_error)?;

    let matched = session.get_attribute(search, AttributeType::Matched);
    if let Err(err) = session.destroy_object(search) {
        warn!(handle = search, error = %err, "failed to destroy search object");
    }
    let matched = matched.map_err(map_token_error)?;

    match matched {
        AttrValue::Handles(handles) => Ok(handles),
        _ => Err(ServiceError::Failed(
            "search object returned no match list".to_string(),
        )),
    }
}

/// First item in `collection_id` whose fields match, if any.  Used by the
/// create-or-replace path.
pub fn find_matching_item(
    session: &dyn TokenSession,
    collection_id: &str,
    fields: &Attributes,
) -> Result<Option<ObjectHandle>, ServiceError> {
    let matches = search(session, fields, Some(collection_id))?;
    Ok(matches.into_iter().next())
}

/// Split matches into unlocked and locked subsets by probing each handle's
/// lock state.  A handle that vanished mid-query is dropped silently —
/// objects may be concurrently deleted.
pub fn split_locked(
    session: &dyn TokenSession,
    handles: Vec<ObjectHandle>,
) -> (Vec<ObjectHandle>, Vec<ObjectHandle>) {
    let mut unlocked = Vec::new();
    let mut locked = Vec::new();
    for handle in handles {
        match session.get_attribute(handle, AttributeType::Locked) {
            Ok(AttrValue::Bool(true)) => locked.push(handle),
            Ok(AttrValue::Bool(false)) => unlocked.push(handle),
            Ok(_) => debug!(handle, "lock probe returned a non-boolean; dropping"),
            Err(TokenError::NotFound) => {
                debug!(handle, "object vanished during lock probe");
            }
            Err(err) => {
                debug!(handle, error = %err, "lock probe failed; dropping handle");
            }
        }
    }
    (unlocked, locked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryToken;
    use keyward_core::{SecretBytes, TokenBackend};

    fn seeded_token() -> MemoryToken {
        let token = MemoryToken::new();
        token.seed_unlocked_collection("work", "Work");
        token.seed_unlocked_collection("personal", "Personal");
        let mut mail = Attributes::new();
        mail.insert("service".to_string(), "mail".to_string());
        let mut irc = Attributes::new();
        irc.insert("service".to_string(), "irc".to_string());
        token.seed_item(
            "work",
            "Mail",
            "org.example.Password",
            &mail,
            SecretBytes::new(b"m".to_vec()),
        );
        token.seed_item(
            "personal",
            "Mail",
            "org.example.Password",
            &mail,
            SecretBytes::new(b"p".to_vec()),
        );
        token.seed_item(
            "personal",
            "Irc",
            "org.example.Password",
            &irc,
            SecretBytes::new(b"i".to_vec()),
        );
        token
    }

    #[test]
    fn cross_collection_search_matches_fields() {
        let token = seeded_token();
        let session = token.open_session(0).expect("session");
        let mut fields = Attributes::new();
        fields.insert("service".to_string(), "mail".to_string());
        let matches = search(&*session, &fields, None).expect("search");
        assert_eq!(matches.len(), 2);
        assert_eq!(token.live_search_objects(), 0);
    }

    #[test]
    fn scoped_search_stays_inside_collection() {
        let token = seeded_token();
        let session = token.open_session(0).expect("session");
        let mut fields = Attributes::new();
        fields.insert("service".to_string(), "mail".to_string());
        let matches = search(&*session, &fields, Some("work")).expect("search");
        assert_eq!(matches.len(), 1);
    }

    #[test]
    fn empty_template_matches_everything_in_scope() {
        let token = seeded_token();
        let session = token.open_session(0).expect("session");
        let matches = search(&*session, &Attributes::new(), Some("personal")).expect("search");
        assert_eq!(matches.len(), 2);
    }

    #[test]
    fn search_object_destroyed_after_success() {
        let token = seeded_token();
        let session = token.open_session(0).expect("session");
        search(&*session, &Attributes::new(), None).expect("search");
        assert_eq!(token.live_search_objects(), 0);
    }

    #[test]
    fn search_object_destroyed_when_match_read_fails() {
        let token = seeded_token();
        let session = token.open_session(0).expect("session");
        token.fail_matched_reads(true);
        let result = search(&*session, &Attributes::new(), None);
        assert!(result.is_err());
        assert_eq!(token.live_search_objects(), 0);
    }

    #[test]
    fn find_matching_item_returns_first_hit() {
        let token = seeded_token();
        let session = token.open_session(0).expect("session");
        let mut fields = Attributes::new();
        fields.insert("service".to_string(), "irc".to_string());
        let hit = find_matching_item(&*session, "personal", &fields).expect("search");
        assert!(hit.is_some());
        let miss = find_matching_item(&*session, "work", &fields).expect("search");
        assert!(miss.is_none());
    }

    #[test]
    fn split_locked_partitions_and_drops_vanished() {
        let token = seeded_token();
        token.lock_collection("personal");
        let session = token.open_session(0).expect("session");
        let mut matches = search(&*session, &Attributes::new(), None).expect("search");
        // Fabricate a handle that no longer exists.
        matches.push(0xdead);
        let (unlocked, locked) = split_locked(&*session, matches);
        assert_eq!(unlocked.len(), 1);
        assert_eq!(locked.len(), 2);
    }
}
