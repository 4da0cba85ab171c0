//! Request handling for a path that resolved to an item.

use keyward_core::{AttrValue, AttributeType, ObjectHandle, SecretBytes, Template, TokenSession};

use crate::paths::NO_PROMPT;
use crate::properties::{self, ObjectKind};
use crate::service::{Reply, Request};
use crate::session::{WireSecret, map_transport_error};
use crate::state::{ServiceError, ServiceState, map_token_error};

pub(crate) fn handle_request(
    state: &ServiceState,
    session: &dyn TokenSession,
    handle: ObjectHandle,
    request: Request,
) -> Result<Reply, ServiceError> {
    match request {
        Request::GetProperty { interface, name } => {
            let value = properties::get(session, ObjectKind::Item, handle, &interface, &name)?;
            Ok(Reply::Property(value))
        }
        Request::SetProperty {
            interface,
            name,
            value,
        } => {
            properties::set(session, ObjectKind::Item, handle, &interface, &name, &value)?;
            Ok(Reply::Done)
        }
        Request::GetAllProperties { interface } => {
            let values = properties::get_all(session, ObjectKind::Item, handle, &interface)?;
            Ok(Reply::Properties(values))
        }
        Request::Delete => {
            session.destroy_object(handle).map_err(map_token_error)?;
            Ok(Reply::Completed {
                prompt: NO_PROMPT.to_string(),
            })
        }
        Request::GetSecret { session: transport } => {
            let secret = get_secret(state, session, handle, &transport)?;
            Ok(Reply::Secret(secret))
        }
        Request::SetSecret { secret } => {
            set_secret(state, session, handle, &secret)?;
            Ok(Reply::Done)
        }
        other => Err(ServiceError::Failed(format!(
            "request {other:?} is not supported on an item"
        ))),
    }
}

fn get_secret(
    state: &ServiceState,
    session: &dyn TokenSession,
    handle: ObjectHandle,
    transport_session: &str,
) -> Result<WireSecret, ServiceError> {
    state
        .transport
        .validate(transport_session)
        .map_err(map_transport_error)?;

    let locked = session
        .get_attribute(handle, AttributeType::Locked)
        .map_err(map_token_error)?;
    if locked.as_bool().unwrap_or(true) {
        return Err(ServiceError::IsLocked);
    }

    let value = session
        .get_attribute(handle, AttributeType::Value)
        .map_err(map_token_error)?;
    let plaintext = value
        .secret_slice()
        .map(|bytes| SecretBytes::new(bytes.to_vec()))
        .ok_or_else(|| ServiceError::Failed("item has no secret value".to_string()))?;

    state
        .transport
        .seal(transport_session, plaintext)
        .map_err(map_transport_error)
}

fn set_secret(
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
