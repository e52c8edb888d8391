//! Zuordnung Beacon-Typ → [`BeaconHostObject`].

use std::collections::HashMap;
use std::sync::Arc;

use beacon_shared::error::BeaconError;

use crate::host_object::{BeaconHostObject, HostSession};

/// At most one host object per beacon type.
#[derive(Debug, Default)]
pub struct BeaconRegistry {
    objects: HashMap<String, BeaconHostObject>,
}

impl BeaconRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, object: BeaconHostObject) -> Result<(), BeaconError> {
        let beacon_type = object.beacon_type().to_string();
        if self.objects.contains_key(&beacon_type) {
            return Err(BeaconError::DuplicateBeaconType(beacon_type));
        }
        tracing::debug!(target: "beacon::host::session", %beacon_type, "beacon type registered");
        self.objects.insert(beacon_type, object);
        Ok(())
    }

    pub fn unregister(&mut self, beacon_type: &str) -> Result<BeaconHostObject, BeaconError> {
        let object = self
            .objects
            .remove(beacon_type)
            .ok_or_else(|| BeaconError::UnknownBeaconType(beacon_type.to_string()))?;
        tracing::debug!(target: "beacon::host::session", %beacon_type, "beacon type unregistered");
        Ok(object)
    }

    pub fn contains(&self, beacon_type: &str) -> bool {
        self.objects.contains_key(beacon_type)
    }

    pub fn get(&self, beacon_type: &str) -> Option<&BeaconHostObject> {
        self.objects.get(beacon_type)
    }

    pub fn get_mut(&mut self, beacon_type: &str) -> Option<&mut BeaconHostObject> {
        self.objects.get_mut(beacon_type)
    }

    pub fn beacon_types(&self) -> impl Iterator<Item = &str> {
        self.objects.keys().map(String::as_str)
    }

    /// Open, non-closing sessions across every beacon type.
    pub fn open_session_count(&self) -> usize {
        self.objects.values().map(BeaconHostObject::open_session_count).sum()
    }

    pub fn find_session(&self, predicate: impl Fn(&HostSession) -> bool) -> Option<Arc<HostSession>> {
        self.objects
            .values()
            .flat_map(|object| object.active_sessions().iter())
            .find(|session| predicate(session))
            .cloned()
    }

    /// Every session still in an active set.
    pub fn all_sessions(&self) -> Vec<Arc<HostSession>> {
        self.objects
            .values()
            .flat_map(|object| object.active_sessions().iter().cloned())
            .collect()
    }

    /// Removes `session` from its type's active set and notifies the handler.
    pub fn remove_session(&mut self, session: &Arc<HostSession>) -> bool {
        self.objects
            .get_mut(&session.beacon_type)
            .is_some_and(|object| object.remove_session(session))
    }
}
