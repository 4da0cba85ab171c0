//! Re-locking a collection by destroying its credential objects.

use keyward_core::{AttrValue, AttributeType, ObjectClass, ObjectHandle, Template, TokenSession};
use tracing::{info, warn};

use crate::state::{ServiceError, map_token_error};

/// Destroy every credential bound to `collection`.
///
/// A credential's existence is the sole unlock evidence, so the collection
/// reads as locked once they are gone.  A per-credential destroy failure is
/// logged and skipped; the operation reports success as long as the search
/// itself succeeded.  A stale credential that refused to die is surfaced in
/// the log, not to the caller.
pub fn lock_collection(
    session: &dyn TokenSession,
    collection: ObjectHandle,
) -> Result<(), ServiceError> {
    let template = Template::new()
        .with(
            AttributeType::Class,
            AttrValue::Class(ObjectClass::Credential),
        )
        .with(AttributeType::TargetObject, AttrValue::Handle(collection));
    let credentials = session.find_objects(&template).map_err(map_token_error)?;

    let mut destroyed = 0usize;
    for credential in &credentials {
        match session.destroy_object(*credential) {
            Ok(()) => destroyed += 1,
            Err(err) => {
                warn!(credential = *credential, error = %err, "failed to destroy credential during lock");
            }
        }
    }
    info!(collection, destroyed, total = credentials.len(), "collection locked");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::Request;
    use crate::state::ServiceError;
    use crate::testing::TestService;

    #[test]
    fn lock_destroys_all_bound_credentials() {
        let svc = TestService::new();
        svc.seed_item("work", "Mail", b"pw");
        assert!(svc.token.credentials_bound_to("work") > 0);

        let session = svc.token_session();
        let collection = svc.token.collection_handle("work").expect("collection");
        lock_collection(&*session, collection).expect("lock");

        assert_eq!(svc.token.credentials_bound_to("work"), 0);
    }

    #[test]
    fn items_read_as_locked_after_lock() {
        let svc = TestService::new();
        let item = svc.seed_item("work", "Mail", b"pw");

        let session = svc.token_session();
        let collection = svc.token.collection_handle("work").expect("collection");
        lock_collection(&*session, collection).expect("lock");

        let transport = svc.transport.open_session();
        let reply = svc.dispatch(
            &item,
            Request::GetSecret {
                session: transport,
            },
        );
        assert!(matches!(reply, Err(ServiceError::IsLocked)));
    }

    #[test]
    fn lock_without_credentials_is_a_no_op() {
        let svc = TestService::new();
        svc.token.seed_locked_collection("vault", "Vault", b"master");
        let session = svc.token_session();
        let collection = svc.token.collection_handle("vault").expect("collection");
        lock_collection(&*session, collection).expect("lock");
        assert_eq!(svc.token.credentials_bound_to("vault"), 0);
    }
}
