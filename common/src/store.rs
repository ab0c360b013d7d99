use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Fixed key space of the device record.
pub mod keys {
    pub const API_KEY: &str = "api_key";
    pub const FRIENDLY_ID: &str = "friendly_id";
    pub const REFRESH_RATE: &str = "refresh_rate";
    pub const FILENAME: &str = "filename";
    pub const REGISTERED: &str = "registered";
    pub const LAST_SLEEP: &str = "last_sleep";
    pub const API_RETRY: &str = "retry_count";
    pub const WIFI_RETRY: &str = "wifi_retry";
    pub const LOG_ID: &str = "log_id";
    pub const LOG_HEAD: &str = "log_head";
    pub const LOG_SLOT_PREFIX: &str = "log_";
    pub const SPECIAL_FUNCTION: &str = "sf";
    pub const TEMP_PROFILE: &str = "temp_profile";

    pub fn log_slot(index: usize) -> String {
        format!("{LOG_SLOT_PREFIX}{index}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum StoredValue {
    Str(String),
    Bool(bool),
    U32(u32),
}

impl StoredValue {
    fn kind(&self) -> &'static str {
        match self {
            Self::Str(_) => "string",
            Self::Bool(_) => "bool",
            Self::U32(_) => "u32",
        }
    }
}

/// Typed access to the durable device record.
///
/// Getters return `Ok(None)` for absent keys so first-boot paths can tell
/// "never written" apart from a stored default. Writes are visible
/// immediately; `flush` makes them durable and must succeed before power-down.
pub trait Store {
    fn contains(&self, key: &str) -> Result<bool, StoreError>;
    fn get_str(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn get_bool(&self, key: &str) -> Result<Option<bool>, StoreError>;
    fn get_u32(&self, key: &str) -> Result<Option<u32>, StoreError>;
    fn put_str(&mut self, key: &str, value: &str) -> Result<(), StoreError>;
    fn put_bool(&mut self, key: &str, value: bool) -> Result<(), StoreError>;
    fn put_u32(&mut self, key: &str, value: u32) -> Result<(), StoreError>;
    fn remove(&mut self, key: &str) -> Result<(), StoreError>;
    fn clear(&mut self) -> Result<(), StoreError>;
    fn flush(&mut self) -> Result<(), StoreError>;

    fn str_or(&self, key: &str, default: &str) -> Result<String, StoreError> {
        Ok(self.get_str(key)?.unwrap_or_else(|| default.to_string()))
    }

    fn bool_or(&self, key: &str, default: bool) -> Result<bool, StoreError> {
        Ok(self.get_bool(key)?.unwrap_or(default))
    }

    fn u32_or(&self, key: &str, default: u32) -> Result<u32, StoreError> {
        Ok(self.get_u32(key)?.unwrap_or(default))
    }

    /// Returns whether a write happened.
    fn set_str_if_changed(&mut self, key: &str, value: &str) -> Result<bool, StoreError> {
        if self.get_str(key)?.as_deref() == Some(value) {
            return Ok(false);
        }
        self.put_str(key, value)?;
        Ok(true)
    }

    fn set_bool_if_changed(&mut self, key: &str, value: bool) -> Result<bool, StoreError> {
        if self.get_bool(key)? == Some(value) {
            return Ok(false);
        }
        self.put_bool(key, value)?;
        Ok(true)
    }

    fn set_u32_if_changed(&mut self, key: &str, value: u32) -> Result<bool, StoreError> {
        if self.get_u32(key)? == Some(value) {
            return Ok(false);
        }
        self.put_u32(key, value)?;
        Ok(true)
    }
}

/// In-memory record. Backs tests and the host store snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStore {
    values: BTreeMap<String, StoredValue>,
    #[serde(skip)]
    writes: u32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of mutating calls since construction.
    pub fn write_count(&self) -> u32 {
        self.writes
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    fn typed<'a>(
        &'a self,
        key: &str,
        expected: &'static str,
    ) -> Result<Option<&'a StoredValue>, StoreError> {
        match self.values.get(key) {
            Some(value) if value.kind() != expected => Err(StoreError::TypeMismatch {
                key: key.to_string(),
                expected,
                found: value.kind(),
            }),
            other => Ok(other),
        }
    }

    fn insert(&mut self, key: &str, value: StoredValue) {
        self.writes = self.writes.saturating_add(1);
        self.values.insert(key.to_string(), value);
    }
}

impl Store for MemoryStore {
    fn contains(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.values.contains_key(key))
    }

    fn get_str(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(match self.typed(key, "string")? {
            Some(StoredValue::Str(value)) => Some(value.clone()),
            _ => None,
        })
    }

    fn get_bool(&self, key: &str) -> Result<Option<bool>, StoreError> {
        Ok(match self.typed(key, "bool")? {
            Some(StoredValue::Bool(value)) => Some(*value),
            _ => None,
        })
    }

    fn get_u32(&self, key: &str) -> Result<Option<u32>, StoreError> {
        Ok(match self.typed(key, "u32")? {
            Some(StoredValue::U32(value)) => Some(*value),
            _ => None,
        })
    }

    fn put_str(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.insert(key, StoredValue::Str(value.to_string()));
        Ok(())
    }

    fn put_bool(&mut self, key: &str, value: bool) -> Result<(), StoreError> {
        self.insert(key, StoredValue::Bool(value));
        Ok(())
    }

    fn put_u32(&mut self, key: &str, value: u32) -> Result<(), StoreError> {
        self.insert(key, StoredValue::U32(value));
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        if self.values.remove(key).is_some() {
            self.writes = self.writes.saturating_add(1);
        }
        Ok(())
    }

    fn clear(&mut self) -> Result<(), StoreError> {
        self.writes = self.writes.saturating_add(1);
        self.values.clear();
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        Ok(())
    }
}
