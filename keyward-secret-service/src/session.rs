//! Secret-transport session boundary.
//!
//! Secret payloads cross the RPC surface only inside a [`WireSecret`] tied
//! to a negotiated session.  The negotiation itself (and any encryption it
//! agrees on) lives outside this subsystem; [`PlainSessions`] is the
//! in-process reference implementation used where no encryption is
//! negotiated.

use std::collections::HashSet;
use std::sync::Mutex;

use keyward_core::SecretBytes;
use uuid::Uuid;
use zvariant::Value;

use crate::paths::SESSION_PREFIX;
use crate::state::ServiceError;

/// A secret as it appears on the wire:
/// `(ObjectPath session, Array<Byte> parameters, Array<Byte> value, String content_type)`.
///
/// For plain sessions `parameters` is empty and `value` is plaintext; an
/// encrypting transport fills `parameters` with whatever its algorithm
/// negotiated (e.g. an IV).
#[derive(Clone, PartialEq, Eq)]
pub struct WireSecret {
    pub session: String,
    pub parameters: Vec<u8>,
    pub value: Vec<u8>,
    pub content_type: String,
}

impl std::fmt::Debug for WireSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // `value` may be plaintext on a plain session; never echo it.
        f.debug_struct("WireSecret")
            .field("session", &self.session)
            .field("parameters", &self.parameters.len())
            .field("value", &"[redacted]")
            .field("content_type", &self.content_type)
            .finish()
    }
}

impl WireSecret {
    /// Encode as the typed wire value.
    pub fn to_value(&self) -> Result<Value<'static>, ServiceError> {
        let session = zvariant::OwnedObjectPath::try_from(self.session.clone())
            .map_err(|_| ServiceError::InvalidArgs("invalid session path".to_string()))?;
        let tuple: (zvariant::OwnedObjectPath, Vec<u8>, Vec<u8>, String) = (
            session,
            self.parameters.clone(),
            self.value.clone(),
            self.content_type.clone(),
        );
        Ok(Value::from(tuple))
    }

    /// Decode from the typed wire value.
    pub fn from_value(secret: &Value<'_>) -> Result<Self, ServiceError> {
        let structure = secret
            .downcast_ref::<zvariant::Structure>()
            .map_err(|_| ServiceError::InvalidArgs("secret is not a structure".to_string()))?;

        let fields = structure.fields();
        if fields.len() != 4 {
            return Err(ServiceError::InvalidArgs(format!(
                "secret struct has {} fields, expected 4",
                fields.len()
            )));
        }

        let session = fields[0]
            .downcast_ref::<zvariant::ObjectPath>()
            .map(|p| p.as_str().to_string())
            .or_else(|_| fields[0].downcast_ref::<String>())
            .map_err(|_| {
                ServiceError::InvalidArgs("session is not an object path".to_string())
            })?;

        let parameters = byte_array(&fields[1])
            .ok_or_else(|| ServiceError::InvalidArgs("parameters is not a byte array".to_string()))?;
        let value = byte_array(&fields[2])
            .ok_or_else(|| ServiceError::InvalidArgs("value is not a byte array".to_string()))?;

        let content_type = fields[3]
            .downcast_ref::<String>()
            .map_err(|_| ServiceError::InvalidArgs("content type is not a string".to_string()))?;

        Ok(Self {
            session,
            parameters,
            value,
            content_type,
        })
    }
}

fn byte_array(value: &Value<'_>) -> Option<Vec<u8>> {
    let array = value.downcast_ref::<zvariant::Array>().ok()?;
    array
        .iter()
        .map(|v| v.downcast_ref::<u8>().ok())
        .collect()
}

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    /// Missing, closed, or never-negotiated session.
    #[error("no negotiated session")]
    NoSession,
    #[error("{0}")]
    Crypto(String),
}

pub(crate) fn map_transport_error(err: TransportError) -> ServiceError {
    match err {
        TransportError::NoSession => ServiceError::NoSession,
        TransportError::Crypto(reason) => ServiceError::Failed(reason),
    }
}

/// Negotiated secret-transport sessions, keyed by session path.
pub trait SecretTransport: Send + Sync {
    fn validate(&self, session: &str) -> Result<(), TransportError>;

    /// Wrap a plaintext secret for the given session.
    fn seal(&self, session: &str, plaintext: SecretBytes) -> Result<WireSecret, TransportError>;

    /// Unwrap a wire secret using the session named inside it.
    fn open(&self, secret: &WireSecret) -> Result<SecretBytes, TransportError>;
}

/// Plain (unencrypted) transport sessions.
#[derive(Debug, Default)]
pub struct PlainSessions {
    sessions: Mutex<HashSet<String>>,
}

impl PlainSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_session(&self) -> String {
        let id = Uuid::new_v4().simple().to_string();
        let path = format!("{SESSION_PREFIX}s{id}");
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.insert(path.clone());
        path
    }

    pub fn close_session(&self, path: &str) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.remove(path);
    }

    pub fn count(&self) -> usize {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.len()
    }
}

impl SecretTransport for PlainSessions {
    fn validate(&self, session: &str) -> Result<(), TransportError> {
        if session.is_empty() || session == "/" {
            return Err(TransportError::NoSession);
        }
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if sessions.contains(session) {
            Ok(())
        } else {
            Err(TransportError::NoSession)
        }
    }

    fn seal(&self, session: &str, plaintext: SecretBytes) -> Result<WireSecret, TransportError> {
        self.validate(session)?;
        Ok(WireSecret {
            session: session.to_string(),
            parameters: Vec::new(),
            value: plaintext.as_slice().to_vec(),
            content_type: "text/plain".to_string(),
        })
    }

    fn open(&self, secret: &WireSecret) -> Result<SecretBytes, TransportError> {
        self.validate(&secret.session)?;
        Ok(SecretBytes::new(secret.value.clone()))
    }
}
