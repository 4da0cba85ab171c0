//! Login keyring bootstrap, unlock, and master-password change.
//!
//! Bridges the OS login password to the secret store: proving knowledge of
//! the master secret materializes a credential object for the `"login"`
//! collection, and first-time unlock creates the collection itself.  The
//! same flows fan out to token slots, initializing or re-keying slot PINs
//! best-effort.

use std::sync::Arc;

use keyward_core::config::LoginConfig;
use keyward_core::{
    AttrValue, AttributeType, ObjectClass, ObjectHandle, SecretBytes, Template, TokenBackend,
    TokenError, TokenSession,
};
use tracing::{info, warn};

use crate::paths::LOGIN_COLLECTION;

/// A cheaply-cloneable, send-safe UI hint callback.
pub type HintFn = Arc<dyn Fn() + Send + Sync + 'static>;

/// Fire-and-forget UI hints.  Both fields are `Option` — callers register
/// only the hints they care about.
#[derive(Clone, Default)]
pub struct LoginCallbacks {
    /// Fired after the login collection was unlocked (or bootstrapped).
    pub on_unlock_succeeded: Option<HintFn>,
    /// Fired when the presented master secret was wrong.
    pub on_unlock_failed: Option<HintFn>,
}

impl std::fmt::Debug for LoginCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginCallbacks")
            .field("on_unlock_succeeded", &self.on_unlock_succeeded.is_some())
            .field("on_unlock_failed", &self.on_unlock_failed.is_some())
            .finish()
    }
}

pub struct LoginFlow {
    backend: Arc<dyn TokenBackend>,
    label: String,
    callbacks: LoginCallbacks,
}

impl LoginFlow {
    pub fn new(backend: Arc<dyn TokenBackend>, config: &LoginConfig) -> Self {
        Self {
            backend,
            label: config.label.clone(),
            callbacks: LoginCallbacks::default(),
        }
    }

    /// Register UI hint callbacks.  Called once before the first unlock.
    pub fn set_callbacks(&mut self, callbacks: LoginCallbacks) {
        self.callbacks = callbacks;
    }

    /// Unlock (or bootstrap) the login keyring with the master secret.
    ///
    /// Whatever the outcome, every slot whose PIN is still uninitialized is
    /// then given `master` as its initial PIN, each slot independently.
    pub fn unlock(&self, master: &SecretBytes) -> bool {
        let unlocked = self.unlock_keyring(master);
        self.init_uninitialized_slots(master);
        unlocked
    }

    /// Change the master password from `original` to `replacement` across
    /// the login keyring and every initialized token slot.
    pub fn change_master(&self, original: &SecretBytes, replacement: &SecretBytes) -> bool {
        let changed = self.change_keyring(original, replacement);
        self.rekey_initialized_slots(original, replacement);
        changed
    }

    fn unlock_keyring(&self, master: &SecretBytes) -> bool {
        let session = match self.open_storage_session() {
            Ok(session) => session,
            Err(err) => {
                warn!(error = %err, "cannot open secret-storage session");
                return false;
            }
        };

        let collection = match find_login_collection(&*session) {
            Ok(collection) => collection,
            Err(err) => {
                warn!(error = %err, "cannot look up login collection");
                return false;
            }
        };

        let credential = match create_credential(&*session, master, collection) {
            Ok(handle) => handle,
            Err(TokenError::PinIncorrect) if collection.is_some() => {
                // Wrong password: a normal outcome, the collection's existing
                // credential binding stays untouched.
                info!("login keyring unlock failed: incorrect secret");
                self.fire(&self.callbacks.on_unlock_failed);
                return false;
            }
            Err(err) => {
                warn!(error = %err, "could not create login credential");
                return false;
            }
        };

        if collection.is_none() {
            let template = Template::new()
                .with(
                    AttributeType::Class,
                    AttrValue::Class(ObjectClass::Collection),
                )
                .with(
                    AttributeType::Id,
                    AttrValue::Text(LOGIN_COLLECTION.to_string()),
                )
                .with(AttributeType::Label, AttrValue::Text(self.label.clone()))
                .with(AttributeType::Credential, AttrValue::Handle(credential))
                .with(AttributeType::TokenStored, AttrValue::Bool(true));
            if let Err(err) = session.create_object(&template) {
                warn!(error = %err, "could not create login collection");
                discard_credential(&*session, credential);
                return false;
            }
            info!("login keyring created");
        }

        self.fire(&self.callbacks.on_unlock_succeeded);
        info!("login keyring unlocked");
        true
    }

    fn change_keyring(&self, original: &SecretBytes, replacement: &SecretBytes) -> bool {
        let session = match self.open_storage_session() {
            Ok(session) => session,
            Err(err) => {
                warn!(error = %err, "cannot open secret-storage session");
                return false;
            }
        };

        let collection = match find_login_collection(&*session) {
            Ok(collection) => collection,
            Err(err) => {
                warn!(error = %err, "cannot look up login collection");
                return false;
            }
        };

        // The candidate replacement: carries the new secret, bound to nothing
        // until the change is proven.
        let candidate = match create_credential(&*session, replacement, None) {
            Ok(handle) => handle,
            Err(err) => {
                warn!(error = %err, "could not create replacement credential");
                return false;
            }
        };

        let Some(collection) = collection else {
            // No login keyring yet: the change doubles as first-time creation
            // bound to the new secret.
            let template = Template::new()
                .with(
                    AttributeType::Class,
                    AttrValue::Class(ObjectClass::Collection),
                )
                .with(
                    AttributeType::Id,
                    AttrValue::Text(LOGIN_COLLECTION.to_string()),
                )
                .with(AttributeType::Label, AttrValue::Text(self.label.clone()))
                .with(AttributeType::Credential, AttrValue::Handle(candidate))
                .with(AttributeType::TokenStored, AttrValue::Bool(true));
            if let Err(err) = session.create_object(&template) {
                warn!(error = %err, "could not create login collection");
                discard_credential(&*session, candidate);
                return false;
            }
            info!("login keyring created during master-password change");
            return true;
        };

        // Prove knowledge of the current password before touching anything.
        let proof = match create_credential(&*session, original, Some(collection)) {
            Ok(handle) => handle,
            Err(TokenError::PinIncorrect) => {
                info!("master-password change failed: incorrect original secret");
                self.fire(&self.callbacks.on_unlock_failed);
                discard_credential(&*session, candidate);
                return false;
            }
            Err(err) => {
                warn!(error = %err, "could not verify original secret");
                discard_credential(&*session, candidate);
                return false;
            }
        };

        let rebind = Template::new().with(AttributeType::Credential, AttrValue::Handle(candidate));
        if let Err(err) = session.set_attributes(collection, &rebind) {
            warn!(error = %err, "could not rebind login collection credential");
            discard_credential(&*session, candidate);
            discard_credential(&*session, proof);
            return false;
        }
        discard_credential(&*session, proof);
        info!("login keyring master password changed");
        true
    }

    fn open_storage_session(&self) -> Result<Arc<dyn TokenSession>, TokenError> {
        let slot = self.backend.storage_slot()?;
        self.backend.open_session(slot)
    }

    /// Give every PIN-less slot the master secret as its initial PIN.  Each
    /// slot's failure is independent; slots that do not support
    /// initialization are expected and skipped without noise.
    fn init_uninitialized_slots(&self, pin: &SecretBytes) {
        let slots = match self.backend.slots() {
            Ok(slots) => slots,
            Err(err) => {
                warn!(error = %err, "cannot enumerate token slots");
                return;
            }
        };
        for slot in slots.iter().filter(|slot| !slot.pin_initialized) {
            match self.backend.init_pin(slot.id, pin) {
                Ok(()) => info!(slot = slot.id, "token slot PIN initialized"),
                Err(TokenError::NotSupported) => {}
                Err(err) => {
                    warn!(slot = slot.id, error = %err, "could not initialize token slot PIN");
                }
            }
        }
    }

    /// Re-key every initialized slot from `original` to `replacement`.  A
    /// slot that rejects the original PIN, or does not support the change,
    /// is skipped silently.
    fn rekey_initialized_slots(&self, original: &SecretBytes, replacement: &SecretBytes) {
        let slots = match self.backend.slots() {
            Ok(slots) => slots,
            Err(err) => {
                warn!(error = %err, "cannot enumerate token slots");
                return;
            }
        };
        for slot in slots.iter().filter(|slot| slot.pin_initialized) {
            match self.backend.set_pin(slot.id, original, replacement) {
                Ok(()) => info!(slot = slot.id, "token slot PIN changed"),
                Err(TokenError::PinIncorrect) | Err(TokenError::NotSupported) => {}
                Err(err) => {
                    warn!(slot = slot.id, error = %err, "could not change token slot PIN");
                }
            }
        }
    }

    fn fire(&self, hint: &Option<HintFn>) {
        if let Some(callback) = hint {
            callback();
        }
    }
}

/// Look up the collection with the reserved `"login"` identifier.  More
/// than one match is a warning condition; the first wins.
fn find_login_collection(
    session: &dyn TokenSession,
) -> Result<Option<ObjectHandle>, TokenError> {
    let template = Template::new()
        .with(
            AttributeType::Class,
            AttrValue::Class(ObjectClass::Collection),
        )
        .with(
            AttributeType::Id,
            AttrValue::Text(LOGIN_COLLECTION.to_string()),
        );
    let matches = session.find_objects(&template)?;
    if matches.len() > 1 {
        warn!(count = matches.len(), "multiple login collections found");
    }
    Ok(matches.first().copied())
}

/// Create a transient credential carrying `secret`, bound to `target` when
/// given (a bare credential otherwise).
fn create_credential(
    session: &dyn TokenSession,
    secret: &SecretBytes,
    target: Option<ObjectHandle>,
) -> Result<ObjectHandle, TokenError> {
    let mut template = Template::new()
        .with(
            AttributeType::Class,
            AttrValue::Class(ObjectClass::Credential),
        )
        .with(AttributeType::Value, AttrValue::Secret(secret.clone()))
        .with(AttributeType::Transient, AttrValue::Bool(true))
        .with(AttributeType::TokenStored, AttrValue::Bool(false));
    if let Some(target) = target {
        template.push(AttributeType::TargetObject, AttrValue::Handle(target));
    }
    session.create_object(&template)
}

fn discard_credential(session: &dyn TokenSession, credential: ObjectHandle) {
    if let Err(err) = session.destroy_object(credential) {
        warn!(credential, error = %err, "could not destroy credential");
    }
}
