//! The handle registry.
//!
//! Maps opaque 64-bit handles to live objects. Handle ids are issued from a
//! monotonic counter and never reused within a process, which is what lets
//! the event path compare weak references by id without a generation
//! counter. The registry mutex guards the map only; it is never held across
//! a DSP operation.

use crate::error::{Result, SonanceError};
use crate::object::{BaseObject, Handle, ObjectType};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Mutex};

/// Opaque user data attached to a handle: a pointer-sized value plus an
/// optional destructor run when the handle dies.
struct Userdata {
    value: usize,
    destructor: Option<Box<dyn FnOnce(usize) + Send>>,
}

impl Userdata {
    fn empty() -> Self {
        Self {
            value: 0,
            destructor: None,
        }
    }
}

impl Drop for Userdata {
    fn drop(&mut self) {
        if let Some(destructor) = self.destructor.take() {
            destructor(self.value);
        }
    }
}

struct Entry {
    object: Arc<dyn BaseObject>,
    refcount: AtomicUsize,
    userdata: Mutex<Userdata>,
}

pub(crate) struct HandleRegistry {
    entries: Mutex<HashMap<Handle, Arc<Entry>>>,
    next_id: AtomicU64,
}

static REGISTRY: LazyLock<HandleRegistry> = LazyLock::new(|| HandleRegistry {
    entries: Mutex::new(HashMap::new()),
    next_id: AtomicU64::new(1),
});

pub(crate) fn registry() -> &'static HandleRegistry {
    &REGISTRY
}

impl HandleRegistry {
    /// Register a freshly constructed object; refcount starts at 1.
    pub fn register(&self, object: Arc<dyn BaseObject>) -> Handle {
        let handle = self.next_id.fetch_add(1, Ordering::Relaxed);
        object.header().assign_handle(handle);
        let entry = Arc::new(Entry {
            object,
            refcount: AtomicUsize::new(1),
            userdata: Mutex::new(Userdata::empty()),
        });
        self.entries.lock().unwrap().insert(handle, entry);
        handle
    }

    fn entry(&self, handle: Handle) -> Result<Arc<Entry>> {
        self.entries
            .lock()
            .unwrap()
            .get(&handle)
            .cloned()
            .ok_or(SonanceError::InvalidHandle(handle))
    }

    /// Resolve a handle to its live object.
    pub fn resolve(&self, handle: Handle) -> Result<Arc<dyn BaseObject>> {
        let entry = self.entry(handle)?;
        if entry.object.header().is_permanently_dead() {
            return Err(SonanceError::Shutdown);
        }
        Ok(entry.object.clone())
    }

    /// Resolve with a type check; mismatches fail with `WrongObjectType`.
    pub fn resolve_as<T: BaseObject>(&self, handle: Handle, expected: ObjectType) -> Result<Arc<T>> {
        let object = self.resolve(handle)?;
        if object.object_type() != expected {
            return Err(SonanceError::WrongObjectType {
                expected: expected.name(),
                got: object.object_type().name(),
            });
        }
        object
            .as_any_arc()
            .downcast::<T>()
            .map_err(|_| SonanceError::Internal("object type tag does not match its type".into()))
    }

    pub fn inc_ref(&self, handle: Handle) -> Result<()> {
        let entry = self.entry(handle)?;
        if entry.object.header().is_permanently_dead() {
            return Err(SonanceError::Shutdown);
        }
        entry.refcount.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Decrement a handle's refcount, releasing it at zero. Decrementing a
    /// handle that was already released is a no-op returning OK; only ids
    /// that were never issued are invalid.
    pub fn dec_ref(&self, handle: Handle) -> Result<()> {
        let entry = {
            let entries = self.entries.lock().unwrap();
            match entries.get(&handle) {
                Some(entry) => entry.clone(),
                None => {
                    return if handle != 0 && handle < self.next_id.load(Ordering::Relaxed) {
                        Ok(())
                    } else {
                        Err(SonanceError::InvalidHandle(handle))
                    };
                }
            }
        };

        if entry.refcount.fetch_sub(1, Ordering::AcqRel) != 1 {
            return Ok(());
        }

        self.release(handle, &entry);
        Ok(())
    }

    /// Final release: latch the object dead, drop userdata, and route the
    /// registry's strong reference through the owning context's deferred
    /// deleter so in-flight blocks never see a dangling object.
    fn release(&self, handle: Handle, entry: &Arc<Entry>) {
        entry.object.header().latch_permanently_dead();
        self.entries.lock().unwrap().remove(&handle);
        *entry.userdata.lock().unwrap() = Userdata::empty();

        let object = entry.object.clone();
        match object.owning_context() {
            Some(context) => context.enqueue_deletion(object),
            None => {
                // Contexts, buffers, and stream handles have no audio-thread
                // aliases; contexts additionally tear themselves down.
                if object.object_type() == ObjectType::Context {
                    if let Ok(context) = object
                        .as_any_arc()
                        .downcast::<crate::context::Context>()
                    {
                        context.shutdown();
                    }
                }
            }
        }
    }

    pub fn get_object_type(&self, handle: Handle) -> Result<ObjectType> {
        Ok(self.resolve(handle)?.object_type())
    }

    pub fn set_userdata(
        &self,
        handle: Handle,
        value: usize,
        destructor: Option<Box<dyn FnOnce(usize) + Send>>,
    ) -> Result<()> {
        let entry = self.entry(handle)?;
        if entry.object.header().is_permanently_dead() {
            return Err(SonanceError::Shutdown);
        }
        *entry.userdata.lock().unwrap() = Userdata { value, destructor };
        Ok(())
    }

    pub fn get_userdata(&self, handle: Handle) -> Result<usize> {
        let entry = self.entry(handle)?;
        let value = entry.userdata.lock().unwrap().value;
        Ok(value)
    }

    /// Userdata lookup that tolerates dead handles; used when building
    /// events, which race benignly with frees.
    pub fn peek_userdata(&self, handle: Handle) -> usize {
        self.entries
            .lock()
            .unwrap()
            .get(&handle)
            .map(|entry| entry.userdata.lock().unwrap().value)
            .unwrap_or(0)
    }

    /// Latch every registered object dead and clear the registry. Contexts
    /// are shut down in the process. Used by library shutdown.
    pub fn shutdown_all(&self) {
        let entries: Vec<(Handle, Arc<Entry>)> = {
            let mut map = self.entries.lock().unwrap();
            map.drain().collect()
        };
        // Shut contexts down last so other objects' deferred deletions can
        // still ride their final iterations.
        let mut contexts = Vec::new();
        for (_, entry) in &entries {
            entry.object.header().latch_permanently_dead();
            if entry.object.object_type() == ObjectType::Context {
                contexts.push(entry.object.clone());
            }
        }
        for (_, entry) in &entries {
            *entry.userdata.lock().unwrap() = Userdata::empty();
        }
        for object in contexts {
            if let Ok(context) = object.as_any_arc().downcast::<crate::context::Context>() {
                context.shutdown();
            }
        }
    }
}
