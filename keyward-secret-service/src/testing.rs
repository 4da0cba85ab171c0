//! Shared in-memory token backend and service harness for tests.
//!
//! `MemoryToken` models just enough PKCS#11 object semantics for this layer:
//! classed objects with typed attributes, derived lock state (a collection
//! is unlocked exactly while a live credential is bound to it), search
//! objects that evaluate their template at creation time, and slots with
//! PIN init/change.  Failure knobs let tests force the error paths the
//! real token would produce.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use keyward_core::config::Config;
use keyward_core::{
    AttrValue, AttributeType, Attributes, Fields, ObjectClass, ObjectHandle, SecretBytes,
    SlotId, SlotInfo, Template, TokenBackend, TokenError, TokenSession, fields_from_attributes,
};
use zvariant::Value;

use crate::paths::item_path;
use crate::service::{Reply, Request, SecretService};
use crate::session::{PlainSessions, WireSecret};
use crate::state::{CallerSessionRegistry, ServiceError, ServiceState};

#[derive(Debug, Clone)]
struct Object {
    class: ObjectClass,
    id: String,
    label: String,
    schema: String,
    fields: Fields,
    collection: String,
    secret: Option<SecretBytes>,
    target: Option<ObjectHandle>,
    credential: Option<ObjectHandle>,
    matched: Vec<ObjectHandle>,
    token_stored: bool,
    transient: bool,
    created: u64,
    modified: u64,
}

impl Object {
    fn blank(class: ObjectClass) -> Self {
        let now = unix_now();
        Self {
            class,
            id: String::new(),
            label: String::new(),
            schema: String::new(),
            fields: Fields::new(),
            collection: String::new(),
            secret: None,
            target: None,
            credential: None,
            matched: Vec::new(),
            token_stored: false,
            transient: false,
            created: now,
            modified: now,
        }
    }
}

#[derive(Debug, Default)]
struct Store {
    next_handle: ObjectHandle,
    next_id: u64,
    objects: HashMap<ObjectHandle, Object>,
    fail_matched: bool,
    fail_value_writes: bool,
}

impl Store {
    fn allocate(&mut self) -> ObjectHandle {
        self.next_handle += 1;
        self.next_handle
    }

    fn fresh_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}{}", self.next_id)
    }

    fn collection_by_id(&self, id: &str) -> Option<ObjectHandle> {
        self.objects
            .iter()
            .find(|(_, o)| o.class == ObjectClass::Collection && o.id == id)
            .map(|(h, _)| *h)
    }

    fn collection_locked(&self, handle: ObjectHandle) -> bool {
        let Some(collection) = self.objects.get(&handle) else {
            return true;
        };
        !self.objects.iter().any(|(h, o)| {
            o.class == ObjectClass::Credential
                && (o.target == Some(handle) || collection.credential == Some(*h))
        })
    }

    fn item_locked(&self, item: &Object) -> bool {
        match self.collection_by_id(&item.collection) {
            Some(handle) => self.collection_locked(handle),
            None => true,
        }
    }

    fn object_locked(&self, handle: ObjectHandle, object: &Object) -> bool {
        match object.class {
            ObjectClass::Collection => self.collection_locked(handle),
            ObjectClass::Item => self.item_locked(object),
            _ => false,
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Debug)]
struct SlotState {
    id: SlotId,
    description: String,
    pin: Option<SecretBytes>,
    supports_init: bool,
}

pub(crate) struct MemoryToken {
    store: Arc<Mutex<Store>>,
    slots: Mutex<Vec<SlotState>>,
}

impl MemoryToken {
    pub fn new() -> Self {
        Self {
            store: Arc::new(Mutex::new(Store::default())),
            slots: Mutex::new(vec![SlotState {
                id: 0,
                description: "Secret Store".to_string(),
                pin: None,
                supports_init: false,
            }]),
        }
    }

    // -- seeding ----------------------------------------------------------

    /// Create a collection together with a live credential, so it reads as
    /// unlocked.
    pub fn seed_unlocked_collection(&self, id: &str, label: &str) {
        let mut store = self.store.lock().expect("store lock");
        let collection = store.allocate();
        let mut object = Object::blank(ObjectClass::Collection);
        object.id = id.to_string();
        object.label = label.to_string();
        object.secret = Some(SecretBytes::new(b"seed-master".to_vec()));
        object.token_stored = true;
        store.objects.insert(collection, object);

        let credential = store.allocate();
        let mut object = Object::blank(ObjectClass::Credential);
        object.secret = Some(SecretBytes::new(b"seed-master".to_vec()));
        object.target = Some(collection);
        object.transient = true;
        store.objects.insert(credential, object);
    }

    /// Create a collection protected by `master` with no credential, so it
    /// reads as locked until someone proves knowledge of `master`.
    pub fn seed_locked_collection(&self, id: &str, label: &str, master: &[u8]) {
        let mut store = self.store.lock().expect("store lock");
        let collection = store.allocate();
        let mut object = Object::blank(ObjectClass::Collection);
        object.id = id.to_string();
        object.label = label.to_string();
        object.secret = Some(SecretBytes::new(master.to_vec()));
        object.token_stored = true;
        store.objects.insert(collection, object);
    }

    pub fn seed_item(
        &self,
        collection_id: &str,
        label: &str,
        schema: &str,
        attributes: &Attributes,
        secret: SecretBytes,
    ) -> ObjectHandle {
        let mut store = self.store.lock().expect("store lock");
        let handle = store.allocate();
        let id = store.fresh_id("i");
        let mut object = Object::blank(ObjectClass::Item);
        object.id = id;
        object.label = label.to_string();
        object.schema = schema.to_string();
        object.fields = fields_from_attributes(attributes);
        object.collection = collection_id.to_string();
        object.secret = Some(secret);
        object.token_stored = true;
        store.objects.insert(handle, object);
        handle
    }

    pub fn add_slot(&self, description: &str, pin_initialized: bool, supports_init: bool) {
        let mut slots = self.slots.lock().expect("slots lock");
        let id = slots.len() as SlotId;
        slots.push(SlotState {
            id,
            description: description.to_string(),
            pin: pin_initialized.then(|| SecretBytes::new(Vec::new())),
            supports_init,
        });
    }

    pub fn set_slot_pin(&self, description: &str, pin: &[u8]) {
        let mut slots = self.slots.lock().expect("slots lock");
        if let Some(slot) = slots.iter_mut().find(|s| s.description == description) {
            slot.pin = Some(SecretBytes::new(pin.to_vec()));
        }
    }

    // -- failure knobs ----------------------------------------------------

    pub fn fail_matched_reads(&self, fail: bool) {
        self.store.lock().expect("store lock").fail_matched = fail;
    }

    pub fn fail_value_writes(&self, fail: bool) {
        self.store.lock().expect("store lock").fail_value_writes = fail;
    }

    // -- introspection ----------------------------------------------------

    pub fn collection_handle(&self, id: &str) -> Option<ObjectHandle> {
        self.store.lock().expect("store lock").collection_by_id(id)
    }

    pub fn collection_secret(&self, id: &str) -> Option<SecretBytes> {
        let store = self.store.lock().expect("store lock");
        let handle = store.collection_by_id(id)?;
        store.objects.get(&handle).and_then(|o| o.secret.clone())
    }

    pub fn credentials_bound_to(&self, collection_id: &str) -> usize {
        let store = self.store.lock().expect("store lock");
        let Some(handle) = store.collection_by_id(collection_id) else {
            return 0;
        };
        let Some(collection) = store.objects.get(&handle) else {
            return 0;
        };
        store
            .objects
            .iter()
            .filter(|(h, o)| {
                o.class == ObjectClass::Credential
                    && (o.target == Some(handle) || collection.credential == Some(**h))
            })
            .count()
    }

    pub fn live_credentials(&self) -> usize {
        let store = self.store.lock().expect("store lock");
        store
            .objects
            .values()
            .filter(|o| o.class == ObjectClass::Credential)
            .count()
    }

    pub fn live_search_objects(&self) -> usize {
        let store = self.store.lock().expect("store lock");
        store
            .objects
            .values()
            .filter(|o| o.class == ObjectClass::Search)
            .count()
    }

    pub fn items_in_collection(&self, collection_id: &str) -> usize {
        let store = self.store.lock().expect("store lock");
        store
            .objects
            .values()
            .filter(|o| o.class == ObjectClass::Item && o.collection == collection_id)
            .count()
    }

    pub fn item_id(&self, handle: ObjectHandle) -> Option<String> {
        let store = self.store.lock().expect("store lock");
        store.objects.get(&handle).map(|o| o.id.clone())
    }

    pub fn slot_pin(&self, description: &str) -> Option<SecretBytes> {
        let slots = self.slots.lock().expect("slots lock");
        slots
            .iter()
            .find(|s| s.description == description)
            .and_then(|s| s.pin.clone())
    }

    /// Drop every credential bound to a collection, re-locking it.
    pub fn lock_collection(&self, collection_id: &str) {
        let mut store = self.store.lock().expect("store lock");
        let Some(handle) = store.collection_by_id(collection_id) else {
            return;
        };
        let binding = store
            .objects
            .get(&handle)
            .and_then(|o| o.credential);
        store.objects.retain(|h, o| {
            !(o.class == ObjectClass::Credential
                && (o.target == Some(handle) || binding == Some(*h)))
        });
    }
}

impl TokenBackend for MemoryToken {
    fn slots(&self) -> Result<Vec<SlotInfo>, TokenError> {
        let slots = self.slots.lock().expect("slots lock");
        Ok(slots
            .iter()
            .map(|s| SlotInfo {
                id: s.id,
                description: s.description.clone(),
                pin_initialized: s.pin.is_some(),
            })
            .collect())
    }

    fn storage_slot(&self) -> Result<SlotId, TokenError> {
        Ok(0)
    }

    fn open_session(&self, slot: SlotId) -> Result<Arc<dyn TokenSession>, TokenError> {
        let slots = self.slots.lock().expect("slots lock");
        if !slots.iter().any(|s| s.id == slot) {
            return Err(TokenError::NotFound);
        }
        Ok(Arc::new(MemorySession {
            store: Arc::clone(&self.store),
        }))
    }

    fn init_pin(&self, slot: SlotId, pin: &SecretBytes) -> Result<(), TokenError> {
        let mut slots = self.slots.lock().expect("slots lock");
        let slot = slots
            .iter_mut()
            .find(|s| s.id == slot)
            .ok_or(TokenError::NotFound)?;
        if !slot.supports_init {
            return Err(TokenError::NotSupported);
        }
        slot.pin = Some(pin.clone());
        Ok(())
    }

    fn set_pin(
        &self,
        slot: SlotId,
        old: &SecretBytes,
        new: &SecretBytes,
    ) -> Result<(), TokenError> {
        let mut slots = self.slots.lock().expect("slots lock");
        let slot = slots
            .iter_mut()
            .find(|s| s.id == slot)
            .ok_or(TokenError::NotFound)?;
        match &slot.pin {
            Some(current) if current == old => {}
            Some(_) => return Err(TokenError::PinIncorrect),
            None => return Err(TokenError::NotSupported),
        }
        slot.pin = Some(new.clone());
        Ok(())
    }
}

struct MemorySession {
    store: Arc<Mutex<Store>>,
}

impl TokenSession for MemorySession {
    fn create_object(&self, template: &Template) -> Result<ObjectHandle, TokenError> {
        let mut store = self.store.lock().expect("store lock");
        let class = template
            .class()
            .ok_or_else(|| TokenError::Template("missing object class".to_string()))?;
        let mut object = Object::blank(class);

        if let Some(label) = template.text(AttributeType::Label) {
            object.label = label.to_string();
        }
        if let Some(schema) = template.text(AttributeType::Schema) {
            object.schema = schema.to_string();
        }
        if let Some(AttrValue::Fields(fields)) = template.get(AttributeType::Fields) {
            object.fields = fields.clone();
        }
        if let Some(AttrValue::Bool(stored)) = template.get(AttributeType::TokenStored) {
            object.token_stored = *stored;
        }
        if let Some(AttrValue::Bool(transient)) = template.get(AttributeType::Transient) {
            object.transient = *transient;
        }

        match class {
            ObjectClass::Collection => {
                object.id = match template.text(AttributeType::Id) {
                    Some(id) => id.to_string(),
                    None => store.fresh_id("c"),
                };
                if let Some(value) = template.get(AttributeType::Credential) {
                    let credential = value
                        .as_handle()
                        .ok_or_else(|| TokenError::Template("credential must be a handle".to_string()))?;
                    let secret = store
                        .objects
                        .get(&credential)
                        .filter(|o| o.class == ObjectClass::Credential)
                        .and_then(|o| o.secret.clone())
                        .ok_or(TokenError::NotFound)?;
                    object.credential = Some(credential);
                    object.secret = Some(secret);
                }
            }
            ObjectClass::Item => {
                let collection_id = template
                    .text(AttributeType::CollectionId)
                    .ok_or_else(|| {
                        TokenError::Template("item requires a collection".to_string())
                    })?
                    .to_string();
                let collection = store
                    .collection_by_id(&collection_id)
                    .ok_or(TokenError::NotFound)?;
                if store.collection_locked(collection) {
                    return Err(TokenError::Locked);
                }
                object.collection = collection_id;
                object.id = match template.text(AttributeType::Id) {
                    Some(id) => id.to_string(),
                    None => store.fresh_id("i"),
                };
                if let Some(value) = template.get(AttributeType::Value) {
                    let bytes = value.secret_slice().ok_or_else(|| {
                        TokenError::Template("value must be bytes".to_string())
                    })?;
                    object.secret = Some(SecretBytes::new(bytes.to_vec()));
                }
            }
            ObjectClass::Credential => {
                let value = template
                    .get(AttributeType::Value)
                    .and_then(AttrValue::secret_slice)
                    .ok_or_else(|| {
                        TokenError::Template("credential requires a value".to_string())
                    })?;
                let value = SecretBytes::new(value.to_vec());
                if let Some(target) = template.get(AttributeType::TargetObject) {
                    let target = target.as_handle().ok_or_else(|| {
                        TokenError::Template("target must be a handle".to_string())
                    })?;
                    let target_object =
                        store.objects.get_mut(&target).ok_or(TokenError::NotFound)?;
                    if target_object.class == ObjectClass::Collection {
                        match &target_object.secret {
                            Some(master) if *master != value => {
                                return Err(TokenError::PinIncorrect);
                            }
                            Some(_) => {}
                            None => target_object.secret = Some(value.clone()),
                        }
                    }
                    object.target = Some(target);
                }
                object.secret = Some(value);
            }
            ObjectClass::Search => {
                let scope = template
                    .text(AttributeType::CollectionId)
                    .map(str::to_string);
                let wanted = match template.get(AttributeType::Fields) {
                    Some(AttrValue::Fields(fields)) => fields.clone(),
                    _ => Fields::new(),
                };
                object.matched = store
                    .objects
                    .iter()
                    .filter(|(_, o)| o.class == ObjectClass::Item)
                    .filter(|(_, o)| match &scope {
                        Some(id) => o.collection == *id,
                        None => true,
                    })
                    .filter(|(_, o)| wanted.iter().all(|pair| o.fields.contains(pair)))
                    .map(|(h, _)| *h)
                    .collect();
            }
        }

        let handle = store.allocate();
        store.objects.insert(handle, object);
        Ok(handle)
    }

    fn find_objects(&self, template: &Template) -> Result<Vec<ObjectHandle>, TokenError> {
        let store = self.store.lock().expect("store lock");
        let mut matches: Vec<ObjectHandle> = store
            .objects
            .iter()
            .filter(|(_, o)| match template.class() {
                Some(class) => o.class == class,
                None => true,
            })
            .filter(|(_, o)| match template.text(AttributeType::Id) {
                Some(id) => o.id == id,
                None => true,
            })
            .filter(|(_, o)| match template.text(AttributeType::CollectionId) {
                Some(id) => o.collection == id,
                None => true,
            })
            .filter(|(_, o)| match template.text(AttributeType::Label) {
                Some(label) => o.label == label,
                None => true,
            })
            .filter(|(_, o)| {
                match template
                    .get(AttributeType::TargetObject)
                    .and_then(AttrValue::as_handle)
                {
                    Some(target) => o.target == Some(target),
                    None => true,
                }
            })
            .map(|(h, _)| *h)
            .collect();
        matches.sort();
        Ok(matches)
    }

    fn destroy_object(&self, handle: ObjectHandle) -> Result<(), TokenError> {
        let mut store = self.store.lock().expect("store lock");
        store
            .objects
            .remove(&handle)
            .map(|_| ())
            .ok_or(TokenError::NotFound)
    }

    fn get_attribute(
        &self,
        handle: ObjectHandle,
        ty: AttributeType,
    ) -> Result<AttrValue, TokenError> {
        let store = self.store.lock().expect("store lock");
        let object = store.objects.get(&handle).ok_or(TokenError::NotFound)?;
        match ty {
            AttributeType::Class => Ok(AttrValue::Class(object.class)),
            AttributeType::Id => Ok(AttrValue::Text(object.id.clone())),
            AttributeType::Label => Ok(AttrValue::Text(object.label.clone())),
            AttributeType::Schema => Ok(AttrValue::Text(object.schema.clone())),
            AttributeType::Fields => Ok(AttrValue::Fields(object.fields.clone())),
            AttributeType::CollectionId => Ok(AttrValue::Text(object.collection.clone())),
            AttributeType::Locked => Ok(AttrValue::Bool(store.object_locked(handle, object))),
            AttributeType::Created => Ok(AttrValue::Time(object.created)),
            AttributeType::Modified => Ok(AttrValue::Time(object.modified)),
            AttributeType::TokenStored => Ok(AttrValue::Bool(object.token_stored)),
            AttributeType::Transient => Ok(AttrValue::Bool(object.transient)),
            AttributeType::Value => match object.class {
                ObjectClass::Item => {
                    if store.item_locked(object) {
                        return Err(TokenError::Locked);
                    }
                    let secret = object
                        .secret
                        .clone()
                        .unwrap_or_else(|| SecretBytes::new(Vec::new()));
                    Ok(AttrValue::Secret(secret))
                }
                // Credential and collection secrets are write-only.
                _ => Err(TokenError::Sensitive),
            },
            AttributeType::TargetObject => {
                object.target.map(AttrValue::Handle).ok_or(TokenError::NotFound)
            }
            AttributeType::Credential => object
                .credential
                .map(AttrValue::Handle)
                .ok_or(TokenError::NotFound),
            AttributeType::Matched => {
                if object.class != ObjectClass::Search {
                    return Err(TokenError::NotFound);
                }
                if store.fail_matched {
                    return Err(TokenError::Other(anyhow::anyhow!(
                        "simulated match-list read failure"
                    )));
                }
                Ok(AttrValue::Handles(object.matched.clone()))
            }
        }
    }

    fn set_attributes(
        &self,
        handle: ObjectHandle,
        template: &Template,
    ) -> Result<(), TokenError> {
        let mut store = self.store.lock().expect("store lock");
        let object = store.objects.get(&handle).ok_or(TokenError::NotFound)?;
        if store.object_locked(handle, object) {
            return Err(TokenError::Locked);
        }

        // Validate a credential rebind before mutating anything.
        let mut rebind: Option<(ObjectHandle, SecretBytes)> = None;
        for (ty, value) in template.iter() {
            match ty {
                AttributeType::Label | AttributeType::Schema | AttributeType::Fields => {}
                AttributeType::Value => {
                    if store.fail_value_writes {
                        return Err(TokenError::Other(anyhow::anyhow!(
                            "simulated secret write failure"
                        )));
                    }
                }
                AttributeType::Credential => {
                    let credential = value.as_handle().ok_or_else(|| {
                        TokenError::Template("credential must be a handle".to_string())
                    })?;
                    let secret = store
                        .objects
                        .get(&credential)
                        .filter(|o| o.class == ObjectClass::Credential)
                        .and_then(|o| o.secret.clone())
                        .ok_or(TokenError::NotFound)?;
                    rebind = Some((credential, secret));
                }
                _ => {
                    return Err(TokenError::Template(format!(
                        "attribute {ty:?} is immutable"
                    )));
                }
            }
        }

        let object = store.objects.get_mut(&handle).ok_or(TokenError::NotFound)?;
        for (ty, value) in template.iter() {
            match ty {
                AttributeType::Label => {
                    object.label = value
                        .as_text()
                        .ok_or_else(|| TokenError::Template("label must be text".to_string()))?
                        .to_string();
                }
                AttributeType::Schema => {
                    object.schema = value
                        .as_text()
                        .ok_or_else(|| TokenError::Template("schema must be text".to_string()))?
                        .to_string();
                }
                AttributeType::Fields => {
                    object.fields = value
                        .as_fields()
                        .ok_or_else(|| TokenError::Template("fields must be a map".to_string()))?
                        .clone();
                }
                AttributeType::Value => {
                    let bytes = value.secret_slice().ok_or_else(|| {
                        TokenError::Template("value must be bytes".to_string())
                    })?;
                    object.secret = Some(SecretBytes::new(bytes.to_vec()));
                }
                AttributeType::Credential => {
                    if let Some((credential, secret)) = rebind.take() {
                        object.credential = Some(credential);
                        object.secret = Some(secret);
                    }
                }
                _ => {}
            }
        }
        object.modified = unix_now();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Service harness
// ---------------------------------------------------------------------------

pub(crate) struct TestService {
    pub token: Arc<MemoryToken>,
    pub transport: Arc<PlainSessions>,
    pub service: SecretService,
}

impl TestService {
    pub fn new() -> Self {
        let token = Arc::new(MemoryToken::new());
        let transport = Arc::new(PlainSessions::new());
        let callers = Arc::new(
            CallerSessionRegistry::new(Arc::clone(&token) as Arc<dyn TokenBackend>)
                .expect("session registry"),
        );
        let state = Arc::new(ServiceState::new(
            Arc::clone(&token) as Arc<dyn TokenBackend>,
            callers,
            Arc::clone(&transport) as Arc<dyn crate::session::SecretTransport>,
            &Config::default(),
        ));
        Self {
            token,
            transport,
            service: SecretService::new(state),
        }
    }

    pub fn dispatch(&self, path: &str, request: Request) -> Result<Reply, ServiceError> {
        self.service.dispatch("test", path, request)
    }

    /// Seed an unlocked collection (unless present) holding one item, and
    /// return the item's addressable path.
    pub fn seed_item(&self, collection_id: &str, label: &str, secret: &[u8]) -> String {
        if self.token.collection_handle(collection_id).is_none() {
            self.token.seed_unlocked_collection(collection_id, collection_id);
        }
        let handle = self.token.seed_item(
            collection_id,
            label,
            "org.example.Password",
            &Attributes::new(),
            SecretBytes::new(secret.to_vec()),
        );
        let id = self.token.item_id(handle).expect("seeded item id");
        item_path(collection_id, &id)
    }

    pub fn token_session(&self) -> Arc<dyn TokenSession> {
        self.token.open_session(0).expect("token session")
    }
}

pub(crate) fn wire_secret(session: &str, value: &[u8]) -> WireSecret {
    WireSecret {
        session: session.to_string(),
        parameters: Vec::new(),
        value: value.to_vec(),
        content_type: "text/plain".to_string(),
    }
}

pub(crate) fn string_array(value: &Value<'_>) -> Vec<String> {
    let array = value
        .downcast_ref::<zvariant::Array>()
        .expect("expected an array value");
    array
        .iter()
        .map(|v| v.downcast_ref::<String>().expect("expected a string element"))
        .collect()
}
