//! Shared dictionary
//!
//! String keys to self-describing values. The whole mapping is stored as one
//! MessagePack blob in `[0, logical_size)` and rewritten on every mutation.

use crate::base::{delegate_to_base, CreateOptions, Session, SharedBase};
use crate::header::ContainerKind;
use crate::SegmentManager;
use scratchpad_core::{Result, ScratchpadError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{instrument, warn};

/// A string-keyed mapping shared between processes
pub struct SharedDict {
    base: SharedBase,
}

delegate_to_base!(SharedDict);

impl SharedDict {
    /// Create an empty dictionary
    #[instrument(skip(manager, options))]
    pub fn create(manager: Arc<SegmentManager>, options: &CreateOptions) -> Result<Self> {
        let capacity = options
            .initial_capacity
            .unwrap_or(manager.config().dict_initial_capacity)
            .max(1);
        let base = SharedBase::create(
            manager,
            ContainerKind::Dict,
            0,
            capacity,
            options.lock_name.as_deref(),
            |_| Ok(()),
        )?;
        Ok(Self { base })
    }

    /// Attach to the dictionary published under `name`
    #[instrument(skip(manager))]
    pub fn attach(manager: Arc<SegmentManager>, name: &str) -> Result<Self> {
        Ok(Self {
            base: SharedBase::attach(manager, name, ContainerKind::Dict)?,
        })
    }

    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        let session = self.base.session()?;
        Ok(read_map(&session)?.get(key).cloned())
    }

    /// Value under `key` converted to `T`
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.get(key)?.map(from_value).transpose()
    }

    /// Insert or overwrite `key`
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        self.modify(|map| {
            map.insert(key.into(), value);
        })
    }

    /// Insert any serializable value
    pub fn set_value<T: Serialize + ?Sized>(&self, key: impl Into<String>, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.set(key, value)
    }

    /// Remove `key`; returns whether it was present
    pub fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.pop(key)?.is_some())
    }

    /// Remove `key` and return its value
    pub fn pop(&self, key: &str) -> Result<Option<Value>> {
        let mut session = self.base.session()?;
        let mut map = read_map(&session)?;
        let removed = map.shift_remove(key);
        if removed.is_some() {
            write_map(&mut session, &map)?;
        }
        Ok(removed)
    }

    pub fn contains(&self, key: &str) -> Result<bool> {
        let session = self.base.session()?;
        Ok(read_map(&session)?.contains_key(key))
    }

    pub fn len(&self) -> Result<usize> {
        let session = self.base.session()?;
        Ok(read_map(&session)?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Insert every pair from `other`, overwriting existing keys
    pub fn update<I, K, V>(&self, other: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let pairs: Vec<(String, Value)> = other.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        self.modify(|map| map.extend(pairs))
    }

    /// Value under `key`, inserting `default` first when missing
    pub fn setdefault(&self, key: &str, default: impl Into<Value>) -> Result<Value> {
        let mut session = self.base.session()?;
        let mut map = read_map(&session)?;
        if let Some(existing) = map.get(key) {
            return Ok(existing.clone());
        }
        let value = default.into();
        map.insert(key.to_string(), value.clone());
        write_map(&mut session, &map)?;
        Ok(value)
    }

    /// Remove every key, keeping the capacity
    pub fn clear(&self) -> Result<()> {
        self.base.session()?.set_logical_size(0)
    }

    pub fn keys(&self) -> Result<Vec<String>> {
        Ok(self.to_map()?.into_iter().map(|(k, _)| k).collect())
    }

    pub fn values(&self) -> Result<Vec<Value>> {
        Ok(self.to_map()?.into_iter().map(|(_, v)| v).collect())
    }

    pub fn items(&self) -> Result<Vec<(String, Value)>> {
        Ok(self.to_map()?.into_iter().collect())
    }

    /// Iterate over a snapshot taken under the lock
    pub fn iter(&self) -> Result<impl Iterator<Item = (String, Value)>> {
        Ok(self.to_map()?.into_iter())
    }

    /// Snapshot of the whole mapping in insertion order
    pub fn to_map(&self) -> Result<Map<String, Value>> {
        let session = self.base.session()?;
        read_map(&session)
    }

    /// Deserialize the whole mapping into `T`, typically a struct whose fields
    /// are the keys
    pub fn extract<T: DeserializeOwned>(&self) -> Result<T> {
        from_value(Value::Object(self.to_map()?))
    }

    /// Compare against a foreign mapping, ignoring order
    pub fn eq_mapping<'a, I>(&self, other: I) -> Result<bool>
    where
        I: IntoIterator<Item = (&'a String, &'a Value)>,
    {
        let ours = self.to_map()?;
        let mut count = 0;
        for (key, value) in other {
            count += 1;
            if ours.get(key) != Some(value) {
                return Ok(false);
            }
        }
        Ok(count == ours.len())
    }

    fn modify<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Map<String, Value>),
    {
        let mut session = self.base.session()?;
        let mut map = read_map(&session)?;
        f(&mut map);
        write_map(&mut session, &map)
    }
}

impl PartialEq<Map<String, Value>> for SharedDict {
    fn eq(&self, other: &Map<String, Value>) -> bool {
        self.eq_mapping(other).unwrap_or(false)
    }
}

impl PartialEq<HashMap<String, Value>> for SharedDict {
    fn eq(&self, other: &HashMap<String, Value>) -> bool {
        self.eq_mapping(other).unwrap_or(false)
    }
}

impl std::fmt::Debug for SharedDict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedDict").field("name", &self.name()).finish()
    }
}

fn from_value<T: DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| ScratchpadError::Deserialization(e.to_string()))
}

/// Decode the live blob; unreadable bytes read as an empty mapping
fn read_map(session: &Session<'_>) -> Result<Map<String, Value>> {
    let len = session.logical_size()?;
    if len == 0 {
        return Ok(Map::new());
    }
    match rmp_serde::from_slice(&session.data()?[..len]) {
        Ok(map) => Ok(map),
        Err(e) => {
            warn!("Discarding unreadable dictionary blob of {} bytes: {}", len, e);
            Ok(Map::new())
        }
    }
}

/// Encode `map`, growing to twice the blob size when it does not fit
fn write_map(session: &mut Session<'_>, map: &Map<String, Value>) -> Result<()> {
    let blob = rmp_serde::to_vec_named(map)?;
    if blob.len() > session.capacity()? {
        session.recap(blob.len() * 2)?;
    }
    session.data_mut()?[..blob.len()].copy_from_slice(&blob);
    session.set_logical_size(blob.len())
}
