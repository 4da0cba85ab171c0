use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use keyward_core::config::Config;
use keyward_core::{
    AttrValue, AttributeType, ObjectClass, ObjectHandle, SlotId, Template, TokenBackend,
    TokenError, TokenSession,
};
use tracing::warn;

use crate::paths::AliasTable;
use crate::session::SecretTransport;

/// The error taxonomy crossing the RPC boundary.  Raw token error codes are
/// re-classified here and never leak to callers.
#[derive(thiserror::Error, Debug)]
pub enum ServiceError {
    /// Path, alias, or lookup miss.
    #[error("no such object")]
    NoSuchObject,
    /// Operation blocked pending unlock; callers may retry after unlocking.
    #[error("object is locked")]
    IsLocked,
    /// The caller has no negotiated secret-transport session.
    #[error("no session")]
    NoSession,
    /// Malformed property or template payload.
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
    /// Catch-all with a human-readable reason.
    #[error("{0}")]
    Failed(String),
}

pub(crate) fn map_token_error(err: TokenError) -> ServiceError {
    match err {
        TokenError::NotFound => ServiceError::NoSuchObject,
        TokenError::Locked => ServiceError::IsLocked,
        TokenError::PinIncorrect => ServiceError::Failed("incorrect secret".to_string()),
        TokenError::NotSupported => ServiceError::Failed("not supported".to_string()),
        TokenError::Sensitive => ServiceError::Failed("attribute is not readable".to_string()),
        TokenError::Template(reason) => ServiceError::InvalidArgs(reason),
        // Internal errors: log the full chain here, return an opaque reason
        // so token-module detail (object handles, slot labels, file paths)
        // never reaches callers.
        TokenError::Other(err) => {
            warn!(error = %err, "internal token error");
            ServiceError::Failed("token failure".to_string())
        }
    }
}

/// External registry handing out the caller's token session, keyed by caller
/// identity.  Concurrent callers are isolated by getting distinct sessions;
/// this layer performs no cross-caller locking of its own.
pub trait CallerSessions: Send + Sync {
    fn session_for(&self, caller: &str) -> Result<Arc<dyn TokenSession>, TokenError>;
}

/// Default registry: one logged-in session against the storage slot per
/// caller, opened lazily and cached for the caller's lifetime.
pub struct CallerSessionRegistry {
    backend: Arc<dyn TokenBackend>,
    slot: SlotId,
    sessions: Mutex<HashMap<String, Arc<dyn TokenSession>>>,
}

impl CallerSessionRegistry {
    pub fn new(backend: Arc<dyn TokenBackend>) -> Result<Self, TokenError> {
        let slot = backend.storage_slot()?;
        Ok(Self {
            backend,
            slot,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Drop a caller's cached session (e.g. when the caller disconnects).
    /// Session-scoped objects on the token vanish with it.
    pub fn evict(&self, caller: &str) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.remove(caller);
    }
}

impl CallerSessions for CallerSessionRegistry {
    fn session_for(&self, caller: &str) -> Result<Arc<dyn TokenSession>, TokenError> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(session) = sessions.get(caller) {
            return Ok(Arc::clone(session));
        }
        let session = self.backend.open_session(self.slot)?;
        sessions.insert(caller.to_string(), Arc::clone(&session));
        Ok(session)
    }
}

/// Shared state of the objects manager.
///
/// Owns the alias table for the manager's lifetime; holds the token backend
/// and the two external registries (caller token sessions, secret-transport
/// sessions) behind their trait boundaries.
pub struct ServiceState {
    pub aliases: AliasTable,
    pub backend: Arc<dyn TokenBackend>,
    pub callers: Arc<dyn CallerSessions>,
    pub transport: Arc<dyn SecretTransport>,
}

impl ServiceState {
    pub fn new(
        backend: Arc<dyn TokenBackend>,
        callers: Arc<dyn CallerSessions>,
        transport: Arc<dyn SecretTransport>,
        config: &Config,
    ) -> Self {
        Self {
            aliases: AliasTable::with_entries(config.service.aliases.clone()),
            backend,
            callers,
            transport,
        }
    }

    pub(crate) fn session_for(&self, caller: &str) -> Result<Arc<dyn TokenSession>, ServiceError> {
        self.callers.session_for(caller).map_err(map_token_error)
    }

    /// Find the collection object with the given identifier.  Zero matches
    /// is `NoSuchObject`; more than one is a warning condition and the first
    /// match wins.
    pub(crate) fn find_collection(
        &self,
        session: &dyn TokenSession,
        collection_id: &str,
    ) -> Result<ObjectHandle, ServiceError> {
        let template = Template::new()
            .with(AttributeType::Class, AttrValue::Class(ObjectClass::Collection))
            .with(AttributeType::Id, AttrValue::Text(collection_id.to_string()));
        let matches = session.find_objects(&template).map_err(map_token_error)?;
        if matches.len() > 1 {
            warn!(
                collection = collection_id,
                count = matches.len(),
                "multiple collections share one identifier"
            );
        }
        matches.first().copied().ok_or(ServiceError::NoSuchObject)
    }

    /// Find the item object with the given identifier inside a collection.
    pub(crate) fn find_item(
        &self,
        session: &dyn TokenSession,
        collection_id: &str,
        item_id: &str,
    ) -> Result<ObjectHandle, ServiceError> {
        let template = Template::new()
            .with(AttributeType::Class, AttrValue::Class(ObjectClass::Item))
            .with(
                AttributeType::CollectionId,
                AttrValue::Text(collection_id.to_string()),
            )
            .with(AttributeType::Id, AttrValue::Text(item_id.to_string()));
        let matches = session.find_objects(&template).map_err(map_token_error)?;
        matches.first().copied().ok_or(ServiceError::NoSuchObject)
    }
}
