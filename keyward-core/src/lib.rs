use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

pub mod config;

/// RPC-level lookup attributes for an item: unordered string key/value pairs
/// as callers present them.
pub type Attributes = HashMap<String, String>;

/// Token-level match fields: the same key/value pairs, held as an ordered set
/// (sorted by key) so attribute templates are deterministic.
pub type Fields = Vec<(String, String)>;

/// Convert caller-supplied attributes into the ordered field form stored on
/// token objects.
pub fn fields_from_attributes(attrs: &Attributes) -> Fields {
    let mut fields: Fields = attrs
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    fields.sort();
    fields
}

/// Convert stored fields back into the map form used on the RPC surface.
pub fn attributes_from_fields(fields: &Fields) -> Attributes {
    fields.iter().cloned().collect()
}

/// A secret byte buffer that zeroizes on drop and never leaks through
/// `Debug` or serde.
pub struct SecretBytes(Zeroizing<Vec<u8>>);

impl SecretBytes {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Create from an already-zeroizing buffer (avoids a plain copy).
    pub fn from_zeroizing(bytes: Zeroizing<Vec<u8>>) -> Self {
        Self(bytes)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretBytes([redacted])")
    }
}

impl Clone for SecretBytes {
    fn clone(&self) -> Self {
        Self(Zeroizing::new(self.0.to_vec()))
    }
}

impl PartialEq for SecretBytes {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for SecretBytes {}

impl Serialize for SecretBytes {
    fn serialize<S>(&self, _serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        Err(serde::ser::Error::custom(
            "SecretBytes cannot be serialized",
        ))
    }
}

impl<'de> Deserialize<'de> for SecretBytes {
    fn deserialize<D>(_deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Err(serde::de::Error::custom(
            "SecretBytes cannot be deserialized",
        ))
    }
}

// ---------------------------------------------------------------------------
// Attribute model
// ---------------------------------------------------------------------------

/// Request-scoped handle to a token object.  Handles are owned by the token;
/// holders must be prepared for a handle to vanish between calls.
pub type ObjectHandle = u64;

/// Identifier of a token slot, the unit at which a PIN is initialized or
/// changed.
pub type SlotId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectClass {
    /// A named, persistent container of items (a keyring).
    Collection,
    /// A single secret record with lookup fields.
    Item,
    /// Ephemeral proof-of-knowledge object; its existence unlocks its target.
    Credential,
    /// Transient query object; exists only long enough to read its matches.
    Search,
}

/// The typed attributes a token object can carry.  Each maps to exactly one
/// slot in the token's storage model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeType {
    Class,
    /// Opaque short identifier, token-unique per class scope.
    Id,
    Label,
    /// Item schema string tag (e.g. `"org.freedesktop.Secret.Generic"`).
    Schema,
    /// Ordered key/value lookup fields, stored unencrypted.
    Fields,
    /// Back-reference from an item (or scope constraint on a search) to the
    /// identifier of the owning collection.
    CollectionId,
    /// Derived lock state; never stored directly.
    Locked,
    Created,
    Modified,
    /// Secret payload.  Write-only on credentials; readable on items only
    /// while their collection is unlocked.
    Value,
    /// The object a credential unlocks (absent for slot-level credentials).
    TargetObject,
    /// The credential a collection is bound to.
    Credential,
    /// `false` for session-scoped objects that vanish when the session ends.
    TokenStored,
    /// Marks credential and search objects that must never persist.
    Transient,
    /// Result handles of a search object.
    Matched,
}

#[derive(Debug, Clone)]
pub enum AttrValue {
    Text(String),
    Bytes(Vec<u8>),
    Secret(SecretBytes),
    Bool(bool),
    /// Seconds since the Unix epoch.
    Time(u64),
    Class(ObjectClass),
    Handle(ObjectHandle),
    Handles(Vec<ObjectHandle>),
    Fields(Fields),
}

impl AttrValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_time(&self) -> Option<u64> {
        match self {
            Self::Time(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_class(&self) -> Option<ObjectClass> {
        match self {
            Self::Class(c) => Some(*c),
            _ => None,
        }
    }

    pub fn as_handle(&self) -> Option<ObjectHandle> {
        match self {
            Self::Handle(h) => Some(*h),
            _ => None,
        }
    }

    pub fn as_handles(&self) -> Option<&[ObjectHandle]> {
        match self {
            Self::Handles(h) => Some(h),
            _ => None,
        }
    }

    pub fn as_fields(&self) -> Option<&Fields> {
        match self {
            Self::Fields(f) => Some(f),
            _ => None,
        }
    }

    /// Secret payload bytes, regardless of whether the caller supplied them
    /// as a zeroizing buffer or plain bytes.
    pub fn secret_slice(&self) -> Option<&[u8]> {
        match self {
            Self::Secret(s) => Some(s.as_slice()),
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

/// An ordered attribute list used for object creation, search constraints,
/// and attribute updates.
#[derive(Debug, Clone, Default)]
pub struct Template {
    attrs: Vec<(AttributeType, AttrValue)>,
}

impl Template {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, ty: AttributeType, value: AttrValue) -> Self {
        self.push(ty, value);
        self
    }

    /// Append an attribute; a later entry for the same type shadows an
    /// earlier one.
    pub fn push(&mut self, ty: AttributeType, value: AttrValue) {
        self.attrs.push((ty, value));
    }

    pub fn get(&self, ty: AttributeType) -> Option<&AttrValue> {
        self.attrs
            .iter()
            .rev()
            .find(|(t, _)| *t == ty)
            .map(|(_, v)| v)
    }

    pub fn class(&self) -> Option<ObjectClass> {
        self.get(AttributeType::Class).and_then(AttrValue::as_class)
    }

    pub fn text(&self, ty: AttributeType) -> Option<&str> {
        self.get(ty).and_then(AttrValue::as_text)
    }

    pub fn iter(&self) -> impl Iterator<Item = (AttributeType, &AttrValue)> {
        self.attrs.iter().map(|(t, v)| (*t, v))
    }

    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Token boundary
// ---------------------------------------------------------------------------

#[derive(thiserror::Error, Debug)]
pub enum TokenError {
    #[error("object not found")]
    NotFound,
    #[error("object is locked")]
    Locked,
    #[error("incorrect secret")]
    PinIncorrect,
    #[error("not supported")]
    NotSupported,
    #[error("attribute is not readable")]
    Sensitive,
    #[error("invalid template: {0}")]
    Template(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A token slot as reported by the module.
#[derive(Debug, Clone)]
pub struct SlotInfo {
    pub id: SlotId,
    pub description: String,
    /// Whether a user PIN has been set on this slot's token.
    pub pin_initialized: bool,
}

/// A logged-in session against one slot.
///
/// Sessions are opened already authenticated to the token; per-object
/// protection is expressed through credential objects, not through a
/// session-level PIN.  All calls are synchronous and run to completion on
/// the calling thread.
pub trait TokenSession: Send + Sync {
    fn create_object(&self, template: &Template) -> Result<ObjectHandle, TokenError>;

    /// Return the handles of every object matching all attributes in
    /// `template`.  An empty result is not an error.
    fn find_objects(&self, template: &Template) -> Result<Vec<ObjectHandle>, TokenError>;

    fn destroy_object(&self, handle: ObjectHandle) -> Result<(), TokenError>;

    fn get_attribute(
        &self,
        handle: ObjectHandle,
        ty: AttributeType,
    ) -> Result<AttrValue, TokenError>;

    fn set_attributes(&self, handle: ObjectHandle, template: &Template)
    -> Result<(), TokenError>;
}

/// The PKCS#11 module boundary: slots, sessions, and PIN management.
///
/// The token owns every object lifetime; callers hold request-scoped handles
/// only.  Implementations serialize concurrent access to the same underlying
/// object themselves.
pub trait TokenBackend: Send + Sync {
    fn slots(&self) -> Result<Vec<SlotInfo>, TokenError>;

    /// The slot designated for secret storage (where collections and items
    /// live).
    fn storage_slot(&self) -> Result<SlotId, TokenError>;

    fn open_session(&self, slot: SlotId) -> Result<Arc<dyn TokenSession>, TokenError>;

    /// First-time PIN initialization for a slot.
    fn init_pin(&self, slot: SlotId, pin: &SecretBytes) -> Result<(), TokenError>;

    /// Change the PIN on an already-initialized slot.  Fails with
    /// [`TokenError::PinIncorrect`] when `old` does not match.
    fn set_pin(
        &self,
        slot: SlotId,
        old: &SecretBytes,
        new: &SecretBytes,
    ) -> Result<(), TokenError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_bytes_debug_redacts() {
        let sb = SecretBytes::new(b"hunter2".to_vec());
        let debug = format!("{sb:?}");
        assert_eq!(debug, "SecretBytes([redacted])");
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn secret_bytes_clone_preserves_data() {
        let sb = SecretBytes::new(b"hello".to_vec());
        let cloned = sb.clone();
        assert_eq!(cloned.as_slice(), b"hello");
    }

    #[test]
    fn secret_bytes_serialize_fails() {
        let sb = SecretBytes::new(b"secret".to_vec());
        let result = serde_json::to_string(&sb);
        assert!(result.is_err());
    }

    #[test]
    fn secret_bytes_deserialize_fails() {
        let result: Result<SecretBytes, _> = serde_json::from_str("\"data\"");
        assert!(result.is_err());
    }

    #[test]
    fn attr_value_secret_debug_redacts() {
        let v = AttrValue::Secret(SecretBytes::new(b"opaque".to_vec()));
        let debug = format!("{v:?}");
        assert!(!debug.contains("opaque"));
    }

    #[test]
    fn fields_are_sorted_by_key() {
        let mut attrs = Attributes::new();
        attrs.insert("zeta".to_string(), "1".to_string());
        attrs.insert("alpha".to_string(), "2".to_string());
        let fields = fields_from_attributes(&attrs);
        assert_eq!(fields[0].0, "alpha");
        assert_eq!(fields[1].0, "zeta");

        let back = attributes_from_fields(&fields);
        assert_eq!(back, attrs);
    }

    #[test]
    fn template_later_entry_shadows_earlier() {
        let template = Template::new()
            .with(AttributeType::Label, AttrValue::Text("one".to_string()))
            .with(AttributeType::Label, AttrValue::Text("two".to_string()));
        assert_eq!(template.text(AttributeType::Label), Some("two"));
        assert_eq!(template.len(), 2);
    }

    #[test]
    fn template_class_accessor() {
        let template =
            Template::new().with(AttributeType::Class, AttrValue::Class(ObjectClass::Item));
        assert_eq!(template.class(), Some(ObjectClass::Item));
        assert!(template.get(AttributeType::Label).is_none());
    }

    #[test]
    fn secret_slice_accepts_both_forms() {
        let s = AttrValue::Secret(SecretBytes::new(b"a".to_vec()));
        let b = AttrValue::Bytes(b"b".to_vec());
        let t = AttrValue::Text("c".to_string());
        assert_eq!(s.secret_slice(), Some(b"a".as_slice()));
        assert_eq!(b.secret_slice(), Some(b"b".as_slice()));
        assert!(t.secret_slice().is_none());
    }
}
