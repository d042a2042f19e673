//! The base object model.
//!
//! Every engine object that can be reached from a handle implements
//! [`BaseObject`]: it carries a shared [`ObjectHeader`] (its handle id and
//! the permanently-dead latch), a type discriminator, and typed property
//! accessors validated against the schema in [`crate::properties`].

use crate::error::Result;
use crate::properties::{Property, PropertyValue};
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Opaque object identity issued by the handle registry. Zero is reserved.
pub type Handle = u64;

/// Closed set of object types. Discriminants are stable and part of the
/// external surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ObjectType {
    Context = 0,
    Buffer = 1,
    BufferGenerator = 2,
    StreamingGenerator = 3,
    NoiseGenerator = 4,
    DirectSource = 5,
    PannedSource = 6,
    Source3D = 7,
    GlobalEcho = 8,
    GlobalFdnReverb = 9,
    StreamHandle = 10,
}

impl ObjectType {
    pub fn name(self) -> &'static str {
        match self {
            ObjectType::Context => "Context",
            ObjectType::Buffer => "Buffer",
            ObjectType::BufferGenerator => "BufferGenerator",
            ObjectType::StreamingGenerator => "StreamingGenerator",
            ObjectType::NoiseGenerator => "NoiseGenerator",
            ObjectType::DirectSource => "DirectSource",
            ObjectType::PannedSource => "PannedSource",
            ObjectType::Source3D => "Source3D",
            ObjectType::GlobalEcho => "GlobalEcho",
            ObjectType::GlobalFdnReverb => "GlobalFdnReverb",
            ObjectType::StreamHandle => "StreamHandle",
        }
    }
}

/// State shared by every handle-reachable object.
#[derive(Debug, Default)]
pub struct ObjectHeader {
    handle: AtomicU64,
    permanently_dead: AtomicBool,
}

impl ObjectHeader {
    pub fn new() -> Self {
        Self::default()
    }

    /// The object's handle, or 0 before registration.
    pub fn handle(&self) -> Handle {
        self.handle.load(Ordering::Acquire)
    }

    pub(crate) fn assign_handle(&self, handle: Handle) {
        self.handle.store(handle, Ordering::Release);
    }

    /// Once set this never clears; all external operations on the object
    /// fail from then on, and pending events referencing it are suppressed.
    pub fn is_permanently_dead(&self) -> bool {
        self.permanently_dead.load(Ordering::Acquire)
    }

    pub(crate) fn latch_permanently_dead(&self) {
        self.permanently_dead.store(true, Ordering::Release);
    }
}

/// Implemented by every object the handle registry can hold.
pub trait BaseObject: Any + Send + Sync {
    fn header(&self) -> &ObjectHeader;

    fn object_type(&self) -> ObjectType;

    /// Apply a schema-validated property write. Called on the audio thread
    /// (via the property ring or an invokable); implementations only touch
    /// their property cells.
    fn set_property(&self, property: Property, value: PropertyValue) -> Result<()>;

    /// Read the audio-thread-visible value of a property.
    fn get_property(&self, property: Property) -> Result<PropertyValue>;

    /// Second-phase initialization, run on the audio thread before the
    /// object is reachable from the audio pipeline.
    fn init_in_audio_thread(self: Arc<Self>) {}

    /// The context whose audio thread may still hold raw references to this
    /// object. When present, final release goes through that context's
    /// deferred deleter instead of dropping inline.
    fn owning_context(&self) -> Option<Arc<crate::context::Context>> {
        None
    }

    /// Upcast support for typed handle resolution.
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// A weak reference to an object plus the handle it had when captured; used
/// by the event path to detect stale objects at dequeue time.
#[derive(Clone)]
pub struct WeakObjectRef {
    pub handle: Handle,
    pub object: std::sync::Weak<dyn BaseObject>,
}

impl WeakObjectRef {
    pub fn new(object: &Arc<dyn BaseObject>) -> Self {
        Self {
            handle: object.header().handle(),
            object: Arc::downgrade(object),
        }
    }

    /// True while the referenced object is alive and not permanently dead.
    pub fn is_live(&self) -> bool {
        match self.object.upgrade() {
            Some(object) => !object.header().is_permanently_dead(),
            None => false,
        }
    }
}

/// Convenience for the common "unknown property for this type" failure.
pub(crate) fn unknown_property(
    object_type: ObjectType,
    property: Property,
) -> crate::error::SonanceError {
    crate::error::SonanceError::UnknownProperty {
        property: property.name(),
        object_type: object_type.name(),
    }
}
