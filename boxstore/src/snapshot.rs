//! Snapshot storage and box materialization
//!
//! The snapshot maps box keys to their current values. A key is present only
//! once its box has been touched; the first touch resolves the value from the
//! preloaded portable state (through the box codec) or from the initial value.

use crate::entity::{BoxId, BoxInfo, Value};
use crate::error::{Result, StoreError};
use crate::options::StoreOptions;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{trace, warn};

struct Slot {
    info: Arc<BoxInfo>,
    value: Value,
}

/// Mutable key → value mapping owned by one store
pub(crate) struct SnapshotState {
    slots: RwLock<HashMap<String, Slot>>,
    owners: RwLock<HashMap<String, BoxId>>,
}

impl SnapshotState {
    pub(crate) fn new() -> Self {
        SnapshotState {
            slots: RwLock::new(HashMap::new()),
            owners: RwLock::new(HashMap::new()),
        }
    }

    /// Bind `info.key()` to this box, failing if another box holds it
    pub(crate) fn claim(&self, info: &BoxInfo) -> Result<()> {
        if let Some(owner) = self.owners.read().get(info.key()) {
            return self.check_owner(info, *owner);
        }
        let mut owners = self.owners.write();
        let owner = *owners.entry(info.key().to_string()).or_insert(info.id());
        self.check_owner(info, owner)
    }

    fn check_owner(&self, info: &BoxInfo, owner: BoxId) -> Result<()> {
        if owner == info.id() {
            Ok(())
        } else {
            Err(StoreError::DuplicateKey {
                key: info.key().to_string(),
            })
        }
    }

    /// Current value of a box without materializing it
    pub(crate) fn peek(&self, info: &BoxInfo) -> Option<Value> {
        self.slots
            .read()
            .get(info.key())
            .filter(|slot| slot.info.id() == info.id())
            .map(|slot| slot.value.clone())
    }

    /// Current value of a box, materializing it on first touch
    pub(crate) fn materialize(&self, info: &Arc<BoxInfo>, options: &StoreOptions) -> Result<Value> {
        self.claim(info)?;
        if let Some(slot) = self.slots.read().get(info.key()) {
            return Ok(slot.value.clone());
        }

        let value = match options.preloaded(info) {
            Some(portable) => match &info.codec {
                Some(codec) => codec.decode(info.key(), portable)?,
                None => {
                    warn!(key = info.key(), "preloaded value for opaque box");
                    return Err(StoreError::NotPortable {
                        key: info.key().to_string(),
                    });
                }
            },
            None => info.initial.clone(),
        };
        trace!(key = info.key(), "materialized box");

        let mut slots = self.slots.write();
        let slot = slots.entry(info.key().to_string()).or_insert_with(|| Slot {
            info: info.clone(),
            value,
        });
        Ok(slot.value.clone())
    }

    /// Replace the value of an already claimed box
    pub(crate) fn write(&self, info: &Arc<BoxInfo>, value: Value) {
        self.slots.write().insert(
            info.key().to_string(),
            Slot {
                info: info.clone(),
                value,
            },
        );
    }

    /// Put a box back to a recorded value, or back to untouched
    pub(crate) fn restore(&self, info: &Arc<BoxInfo>, value: Option<Value>) {
        match value {
            Some(value) => self.write(info, value),
            None => {
                let mut slots = self.slots.write();
                if slots.get(info.key()).is_some_and(|slot| slot.info.id() == info.id()) {
                    slots.remove(info.key());
                }
            }
        }
    }

    pub(crate) fn view(&self) -> Snapshot {
        Snapshot {
            values: self
                .slots
                .read()
                .iter()
                .map(|(key, slot)| (key.clone(), slot.value.clone()))
                .collect(),
        }
    }

    /// Portable form of every materialized box except opaque ones
    pub(crate) fn portable(&self) -> Result<BTreeMap<String, serde_json::Value>> {
        let slots: Vec<(Arc<BoxInfo>, Value)> = self
            .slots
            .read()
            .values()
            .map(|slot| (slot.info.clone(), slot.value.clone()))
            .collect();

        let mut state = BTreeMap::new();
        for (info, value) in slots {
            if let Some(codec) = &info.codec {
                state.insert(info.key().to_string(), codec.encode(info.key(), &value)?);
            }
        }
        Ok(state)
    }
}

/// Read-only copy of a store's key → value mapping
#[derive(Clone, Default)]
pub struct Snapshot {
    values: HashMap<String, Value>,
}

impl Snapshot {
    /// Typed value under `key`
    pub fn get<T: Send + Sync + 'static>(&self, key: &str) -> Option<Arc<T>> {
        self.values
            .get(key)
            .and_then(|value| value.clone().downcast::<T>().ok())
    }

    /// Erased value under `key`
    pub fn get_raw(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Whether `key` has been materialized
    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Materialized keys, sorted
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.values.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    /// Number of materialized boxes
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True before any box is touched
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// True when both snapshots hold the very same values
    pub fn same_as(&self, other: &Snapshot) -> bool {
        self.values.len() == other.values.len()
            && self.values.iter().all(|(key, value)| {
                other
                    .values
                    .get(key)
                    .is_some_and(|theirs| same_value(value, theirs))
            })
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot").field("keys", &self.keys()).finish()
    }
}

/// Reference equality of two erased values
pub(crate) fn same_value(a: &Value, b: &Value) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}
