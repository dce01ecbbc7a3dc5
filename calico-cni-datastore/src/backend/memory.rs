use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::endpoint::WorkloadEndpoint;
use crate::profile::Profile;
use crate::{Error, Result};

/// In-process datastore with the same conditional-mutation semantics as the
/// real backends. Used by the plugin test suites; cloning shares state so a
/// test can hold one handle for assertions while the command under test
/// holds another.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    endpoints: BTreeMap<(String, String), WorkloadEndpoint>,
    profiles: BTreeMap<String, Profile>,
    revision: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_endpoint(&self, namespace: &str, name: &str) -> Result<Option<WorkloadEndpoint>> {
        let state = self.inner.lock().unwrap();
        Ok(state
            .endpoints
            .get(&(namespace.to_owned(), name.to_owned()))
            .cloned())
    }

    pub fn list_by_pod(&self, namespace: &str, pod: &str) -> Result<Vec<WorkloadEndpoint>> {
        let state = self.inner.lock().unwrap();
        Ok(state
            .endpoints
            .values()
            .filter(|wep| wep.namespace() == namespace && wep.spec.pod == pod)
            .cloned()
            .collect())
    }

    pub fn create_or_update(&self, wep: &WorkloadEndpoint) -> Result<WorkloadEndpoint> {
        let mut state = self.inner.lock().unwrap();
        let key = (wep.namespace().to_owned(), wep.name().to_owned());
        let stored_version = state
            .endpoints
            .get(&key)
            .map(|existing| existing.metadata.resource_version.clone());

        match (wep.resource_version(), stored_version) {
            // Create: must not already exist.
            (None, Some(_)) => {
                return Err(Error::Conflict {
                    namespace: key.0,
                    name: key.1,
                })
            }
            (None, None) => {}
            // Update: version must still match.
            (Some(rv), Some(stored)) if Some(rv) == stored.as_deref() => {}
            (Some(_), _) => {
                return Err(Error::Conflict {
                    namespace: key.0,
                    name: key.1,
                })
            }
        }

        state.revision += 1;
        let mut stored = wep.clone();
        stored.metadata.resource_version = Some(state.revision.to_string());
        state.endpoints.insert(key, stored.clone());
        Ok(stored)
    }

    pub fn delete_endpoint(
        &self,
        namespace: &str,
        name: &str,
        expected_container_id: &str,
    ) -> Result<bool> {
        let mut state = self.inner.lock().unwrap();
        let key = (namespace.to_owned(), name.to_owned());
        match state.endpoints.get(&key) {
            Some(wep) if wep.spec.container_id == expected_container_id => {
                state.endpoints.remove(&key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub fn ensure_profile(&self, name: &str) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        state
            .profiles
            .entry(name.to_owned())
            .or_insert_with(|| Profile::default_allow(name));
        Ok(())
    }

    /// Snapshot of every stored endpoint, for test assertions.
    pub fn endpoints(&self) -> Vec<WorkloadEndpoint> {
        let state = self.inner.lock().unwrap();
        state.endpoints.values().cloned().collect()
    }

    pub fn profile_names(&self) -> Vec<String> {
        let state = self.inner.lock().unwrap();
        state.profiles.keys().cloned().collect()
    }
}
