//! Decode targets for dynamically typed fields.
//!
//! A field declared as [`serde_json::Value`] and marked
//! [`crate::RecordMeta::dynamic`] carries no static type to decode into.
//! The registry maps such field names to a concrete type; decoding through
//! that type validates and normalizes the stored document. Unregistered
//! fields, or payloads the registered type rejects, fall back to a generic
//! map and then a generic list before decoding fails.
//!
//! The registry is built once at startup and shared read-only with every
//! schema loaded from it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::MappingError;

type DecodeFn = dyn Fn(&[u8]) -> Result<serde_json::Value, serde_json::Error> + Send + Sync;

/// Field-name keyed decode targets for dynamic fields.
#[derive(Clone, Default)]
pub struct TypeRegistry {
    decoders: HashMap<String, Arc<DecodeFn>>,
}

impl TypeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode payloads of dynamic field `field` through `T`.
    #[must_use]
    pub fn register<T>(mut self, field: impl Into<String>) -> Self
    where
        T: DeserializeOwned + Serialize + 'static,
    {
        let decode = |bytes: &[u8]| -> Result<serde_json::Value, serde_json::Error> {
            let typed: T = serde_json::from_slice(bytes)?;
            serde_json::to_value(typed)
        };
        self.decoders.insert(field.into(), Arc::new(decode));
        self
    }

    /// Whether a decode target is registered for `field`.
    pub fn contains(&self, field: &str) -> bool {
        self.decoders.contains_key(field)
    }

    /// Number of registered fields.
    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    /// Whether no fields are registered.
    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }

    /// Decode a dynamic field payload.
    ///
    /// Tries the registered type for `field`, then a generic map, then a
    /// generic list.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::Decode`] if none of the targets accept the
    /// payload.
    pub fn decode(&self, field: &str, bytes: &[u8]) -> Result<serde_json::Value, MappingError> {
        if let Some(decode) = self.decoders.get(field) {
            match decode(bytes) {
                Ok(value) => return Ok(value),
                Err(e) => {
                    tracing::debug!(field, error = %e, "Registered type rejected payload, trying generic targets");
                }
            }
        }

        if let Ok(map) = serde_json::from_slice::<serde_json::Map<String, serde_json::Value>>(bytes) {
            return Ok(serde_json::Value::Object(map));
        }
        if let Ok(list) = serde_json::from_slice::<Vec<serde_json::Value>>(bytes) {
            return Ok(serde_json::Value::Array(list));
        }

        Err(MappingError::Decode(format!(
            "dynamic field `{field}` payload is neither its registered type, a map, nor a list"
        )))
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut fields: Vec<&String> = self.decoders.keys().collect();
        fields.sort();
        f.debug_struct("TypeRegistry").field("fields", &fields).finish()
    }
}
