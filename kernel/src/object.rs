//! The object registry.
//!
//! System calls refer to kernel objects through 32-bit identifiers.
//! Identifiers start at 3 (0, 1 and 2 are the console pseudo-descriptors)
//! and grow monotonically; looking one up yields a tagged variant the
//! dispatcher pattern-matches, so a stale or mistyped identifier can never
//! be dereferenced as the wrong kind of object.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::fs::open_file::OpenFile;
use crate::sync::{Condition, Lock, Semaphore};
use crate::thread::Thread;

/// First identifier handed out.
const FIRST_OBJECT_ID: i32 = 3;

/// Every kind of kernel object a user program can hold a handle to.
#[derive(Clone)]
pub enum KernelObject {
    Thread(Arc<Thread>),
    Semaphore(Arc<Semaphore>),
    Lock(Arc<Lock>),
    Condition(Arc<Condition>),
    File(Arc<OpenFile>),
}

struct RegistryState {
    next_id: i32,
    objects: BTreeMap<i32, KernelObject>,
}

pub struct ObjectRegistry {
    state: Mutex<RegistryState>,
}

impl Default for ObjectRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectRegistry {
    pub fn new() -> ObjectRegistry {
        ObjectRegistry {
            state: Mutex::new(RegistryState {
                next_id: FIRST_OBJECT_ID,
                objects: BTreeMap::new(),
            }),
        }
    }

    /// Register an object, returning its fresh identifier.
    pub fn add(&self, object: KernelObject) -> i32 {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id;
        assert!(id > 0, "object identifiers exhausted");
        state.next_id += 1;
        state.objects.insert(id, object);
        id
    }

    pub fn get(&self, id: i32) -> Option<KernelObject> {
        self.state.lock().unwrap().objects.get(&id).cloned()
    }

    pub fn remove(&self, id: i32) -> Option<KernelObject> {
        self.state.lock().unwrap().objects.remove(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_start_past_console_descriptors() {
        let registry = ObjectRegistry::new();
        // A registry entry of any kind will do; files and threads need a
        // machine, a semaphore does not.
        let sched = crate::testing::bare_scheduler();
        let id = registry.add(KernelObject::Semaphore(Arc::new(
            crate::sync::Semaphore::new("s", 0, sched),
        )));
        assert_eq!(id, 3);
        assert!(registry.get(3).is_some());
        assert!(registry.get(2).is_none());
        registry.remove(3);
        assert!(registry.get(3).is_none());
    }
}
