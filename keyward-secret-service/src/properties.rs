//! Generic property protocol bridged onto typed token attributes.
//!
//! Every property name maps through a fixed table to exactly one attribute;
//! the one exception is the collection `Items` property, which is computed
//! by a scoped query on every read rather than stored.

use std::collections::HashMap;

use keyward_core::{
    AttrValue, AttributeType, Attributes, Fields, ObjectClass, ObjectHandle, Template,
    TokenSession, attributes_from_fields,
};
use zvariant::Value;

use crate::paths::item_path;
use crate::state::{ServiceError, map_token_error};

pub const ITEM_INTERFACE: &str = "org.freedesktop.Secret.Item";
pub const COLLECTION_INTERFACE: &str = "org.freedesktop.Secret.Collection";

// Fully-qualified keys used in CreateItem / CreateCollection property dicts.
pub const ITEM_PROP_LABEL: &str = "org.freedesktop.Secret.Item.Label";
pub const ITEM_PROP_TYPE: &str = "org.freedesktop.Secret.Item.Type";
pub const ITEM_PROP_ATTRIBUTES: &str = "org.freedesktop.Secret.Item.Attributes";
pub const COLLECTION_PROP_LABEL: &str = "org.freedesktop.Secret.Collection.Label";

/// Which flavor of object a path resolved to; decides the interface the
/// property protocol accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Item,
    Collection,
}

impl ObjectKind {
    pub fn interface(&self) -> &'static str {
        match self {
            Self::Item => ITEM_INTERFACE,
            Self::Collection => COLLECTION_INTERFACE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueKind {
    Text,
    Bool,
    Time,
    Fields,
    Paths,
}

struct PropertySlot {
    interface: &'static str,
    name: &'static str,
    /// `None` marks the synthetic `Items` property, computed per read.
    attr: Option<AttributeType>,
    kind: ValueKind,
    writable: bool,
}

const PROPERTY_TABLE: &[PropertySlot] = &[
    PropertySlot {
        interface: ITEM_INTERFACE,
        name: "Label",
        attr: Some(AttributeType::Label),
        kind: ValueKind::Text,
        writable: true,
    },
    PropertySlot {
        interface: ITEM_INTERFACE,
        name: "Type",
        attr: Some(AttributeType::Schema),
        kind: ValueKind::Text,
        writable: true,
    },
    PropertySlot {
        interface: ITEM_INTERFACE,
        name: "Attributes",
        attr: Some(AttributeType::Fields),
        kind: ValueKind::Fields,
        writable: true,
    },
    PropertySlot {
        interface: ITEM_INTERFACE,
        name: "Locked",
        attr: Some(AttributeType::Locked),
        kind: ValueKind::Bool,
        writable: false,
    },
    PropertySlot {
        interface: ITEM_INTERFACE,
        name: "Created",
        attr: Some(AttributeType::Created),
        kind: ValueKind::Time,
        writable: false,
    },
    PropertySlot {
        interface: ITEM_INTERFACE,
        name: "Modified",
        attr: Some(AttributeType::Modified),
        kind: ValueKind::Time,
        writable: false,
    },
    PropertySlot {
        interface: COLLECTION_INTERFACE,
        name: "Label",
        attr: Some(AttributeType::Label),
        kind: ValueKind::Text,
        writable: true,
    },
    PropertySlot {
        interface: COLLECTION_INTERFACE,
        name: "Locked",
        attr: Some(AttributeType::Locked),
        kind: ValueKind::Bool,
        writable: false,
    },
    PropertySlot {
        interface: COLLECTION_INTERFACE,
        name: "Created",
        attr: Some(AttributeType::Created),
        kind: ValueKind::Time,
        writable: false,
    },
    PropertySlot {
        interface: COLLECTION_INTERFACE,
        name: "Modified",
        attr: Some(AttributeType::Modified),
        kind: ValueKind::Time,
        writable: false,
    },
    PropertySlot {
        interface: COLLECTION_INTERFACE,
        name: "Items",
        attr: None,
        kind: ValueKind::Paths,
        writable: false,
    },
];

fn lookup(
    kind: ObjectKind,
    interface: &str,
    name: &str,
) -> Result<&'static PropertySlot, ServiceError> {
    if interface != kind.interface() {
        return Err(ServiceError::Failed(format!(
            "interface '{interface}' does not match this object (expected '{}')",
            kind.interface()
        )));
    }
    PROPERTY_TABLE
        .iter()
        .find(|slot| slot.interface == interface && slot.name == name)
        .ok_or_else(|| ServiceError::Failed(format!("unknown property '{interface}.{name}'")))
}

pub fn get(
    session: &dyn TokenSession,
    kind: ObjectKind,
    handle: ObjectHandle,
    interface: &str,
    name: &str,
) -> Result<Value<'static>, ServiceError> {
    let slot = lookup(kind, interface, name)?;
    match slot.attr {
        Some(attr) => {
            let value = session.get_attribute(handle, attr).map_err(map_token_error)?;
            encode(slot.kind, &value)
        }
        None => collection_items(session, handle),
    }
}

pub fn set(
    session: &dyn TokenSession,
    kind: ObjectKind,
    handle: ObjectHandle,
    interface: &str,
    name: &str,
    value: &Value<'_>,
) -> Result<(), ServiceError> {
    let slot = lookup(kind, interface, name)?;
    let attr = match (slot.writable, slot.attr) {
        (true, Some(attr)) => attr,
        _ => {
            return Err(ServiceError::Failed(format!(
                "property '{interface}.{name}' is read-only"
            )));
        }
    };
    let decoded = decode(slot.kind, value)?;
    let template = Template::new().with(attr, decoded);
    session
        .set_attributes(handle, &template)
        .map_err(map_token_error)
}

pub fn get_all(
    session: &dyn TokenSession,
    kind: ObjectKind,
    handle: ObjectHandle,
    interface: &str,
) -> Result<HashMap<String, Value<'static>>, ServiceError> {
    if interface != kind.interface() {
        return Err(ServiceError::Failed(format!(
            "interface '{interface}' does not match this object (expected '{}')",
            kind.interface()
        )));
    }
    let mut out = HashMap::new();
    for slot in PROPERTY_TABLE.iter().filter(|s| s.interface == interface) {
        let value = get(session, kind, handle, interface, slot.name)?;
        out.insert(slot.name.to_string(), value);
    }
    Ok(out)
}

/// The synthetic `Items` property: a scoped query converted to addressable
/// item paths, re-issued on every read.
fn collection_items(
    session: &dyn TokenSession,
    handle: ObjectHandle,
) -> Result<Value<'static>, ServiceError> {
    let collection_id = session
        .get_attribute(handle, AttributeType::Id)
        .map_err(map_token_error)?;
    let collection_id = collection_id
        .as_text()
        .ok_or_else(|| ServiceError::Failed("collection has no identifier".to_string()))?;

    let template = Template::new()
        .with(AttributeType::Class, AttrValue::Class(ObjectClass::Item))
        .with(
            AttributeType::CollectionId,
            AttrValue::Text(collection_id.to_string()),
        );
    let matches = session.find_objects(&template).map_err(map_token_error)?;

    let mut paths = Vec::with_capacity(matches.len());
    for item in matches {
        let id = session
            .get_attribute(item, AttributeType::Id)
            .map_err(map_token_error)?;
        let id = id
            .as_text()
            .ok_or_else(|| ServiceError::Failed("item has no identifier".to_string()))?;
        paths.push(item_path(collection_id, id));
    }
    Ok(Value::from(paths))
}

fn encode(kind: ValueKind, value: &AttrValue) -> Result<Value<'static>, ServiceError> {
    match (kind, value) {
        (ValueKind::Text, AttrValue::Text(s)) => Ok(Value::from(s.clone())),
        (ValueKind::Bool, AttrValue::Bool(b)) => Ok(Value::from(*b)),
        (ValueKind::Time, AttrValue::Time(t)) => Ok(Value::from(*t)),
        (ValueKind::Fields, AttrValue::Fields(fields)) => {
            Ok(Value::from(attributes_from_fields(fields)))
        }
        _ => Err(ServiceError::Failed(
            "attribute value has an unexpected type".to_string(),
        )),
    }
}

fn decode(kind: ValueKind, value: &Value<'_>) -> Result<AttrValue, ServiceError> {
    match kind {
        ValueKind::Text => value
            .downcast_ref::<String>()
            .map(AttrValue::Text)
            .map_err(|_| ServiceError::InvalidArgs("expected a string value".to_string())),
        ValueKind::Fields => extract_attributes_dict(value)
            .map(|attrs| AttrValue::Fields(sorted_fields(&attrs)))
            .ok_or_else(|| {
                ServiceError::InvalidArgs("expected a string-to-string dictionary".to_string())
            }),
        ValueKind::Bool | ValueKind::Time | ValueKind::Paths => Err(ServiceError::InvalidArgs(
            "property cannot be written".to_string(),
        )),
    }
}

fn sorted_fields(attrs: &Attributes) -> Fields {
    keyward_core::fields_from_attributes(attrs)
}

pub(crate) fn extract_attributes_dict(value: &Value<'_>) -> Option<Attributes> {
    let dict = value.downcast_ref::<zvariant::Dict>().ok()?;
    let mut result = Attributes::new();
    for (k, v) in dict.iter() {
        if let (Ok(ks), Ok(vs)) = (k.downcast_ref::<String>(), v.downcast_ref::<String>()) {
            result.insert(ks, vs);
        }
    }
    Some(result)
}

/// Parse a CreateItem property dict into an attribute template plus the raw
/// lookup-attribute map (used for replace matching).
///
/// Unknown keys and wrongly-typed values are `InvalidArgs` — the caller sent
/// a malformed payload, not one we can partially honor.
pub fn parse_item_properties(
    properties: &HashMap<String, Value<'_>>,
) -> Result<(Template, Option<Attributes>), ServiceError> {
    let mut template = Template::new();
    let mut fields = None;
    for (key, value) in properties {
        match key.as_str() {
            ITEM_PROP_LABEL => {
                let label = value.downcast_ref::<String>().map_err(|_| {
                    ServiceError::InvalidArgs("item label must be a string".to_string())
                })?;
                template.push(AttributeType::Label, AttrValue::Text(label));
            }
            ITEM_PROP_TYPE => {
                let schema = value.downcast_ref::<String>().map_err(|_| {
                    ServiceError::InvalidArgs("item type must be a string".to_string())
                })?;
                template.push(AttributeType::Schema, AttrValue::Text(schema));
            }
            ITEM_PROP_ATTRIBUTES => {
                let attrs = extract_attributes_dict(value).ok_or_else(|| {
                    ServiceError::InvalidArgs(
                        "item attributes must be a string-to-string dictionary".to_string(),
                    )
                })?;
                template.push(AttributeType::Fields, AttrValue::Fields(sorted_fields(&attrs)));
                fields = Some(attrs);
            }
            other => {
                return Err(ServiceError::InvalidArgs(format!(
                    "unknown item property '{other}'"
                )));
            }
        }
    }
    Ok((template, fields))
}

/// Parse a CreateCollection property dict; only the label is meaningful.
pub fn parse_collection_properties(
    properties: &HashMap<String, Value<'_>>,
) -> Result<String, ServiceError> {
    let mut label = String::new();
    for (key, value) in properties {
        match key.as_str() {
            COLLECTION_PROP_LABEL => {
                label = value.downcast_ref::<String>().map_err(|_| {
                    ServiceError::InvalidArgs("collection label must be a string".to_string())
                })?;
            }
            other => {
                return Err(ServiceError::InvalidArgs(format!(
                    "unknown collection property '{other}'"
                )));
            }
        }
    }
    Ok(label)
}
