//! Event delivery.
//!
//! The audio thread enqueues events as it mixes (a generator looped, a
//! stream finished); user threads dequeue them at their leisure. Each
//! pending event carries weak references to every object it mentions; if any
//! of those objects has been freed by dequeue time, the event is delivered
//! with type `Invalid` instead of dangling — the user can never observe an
//! event for an object they already released.

use crate::handle::registry;
use crate::object::{BaseObject, Handle, WeakObjectRef};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Event discriminator. `Invalid` is what both "queue empty" and
/// "suppressed" look like to the consumer; it is always 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(i32)]
pub enum EventType {
    #[default]
    Invalid = 0,
    Looped = 1,
    Finished = 2,
}

/// A delivered event. `userdata` is whatever the user attached to the
/// source handle at enqueue time.
#[derive(Debug, Clone, Copy, Default)]
pub struct Event {
    pub event_type: EventType,
    pub source: Handle,
    pub context: Handle,
    pub userdata: usize,
}

struct PendingEvent {
    event: Event,
    referenced: Vec<WeakObjectRef>,
}

impl PendingEvent {
    /// The event if every referenced object is still live, else `Invalid`.
    fn extract(&self) -> Event {
        for weak in &self.referenced {
            if !weak.is_live() {
                return Event::default();
            }
        }
        self.event
    }
}

/// Per-context MPSC event queue with an enable latch.
pub(crate) struct EventSender {
    enabled: AtomicBool,
    tx: Sender<PendingEvent>,
    rx: Receiver<PendingEvent>,
}

impl EventSender {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            enabled: AtomicBool::new(false),
            tx,
            rx,
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Dequeue one event. Returns `Invalid` when the queue is empty or the
    /// head event referenced a freed object.
    pub fn get_next(&self) -> Event {
        match self.rx.try_recv() {
            Ok(pending) => pending.extract(),
            Err(_) => Event::default(),
        }
    }

    /// Enqueue an event referencing `source` within `context`. A no-op
    /// while events are disabled, or if either object is already dead.
    pub fn enqueue(
        &self,
        event_type: EventType,
        source: &Arc<dyn BaseObject>,
        context: &Arc<dyn BaseObject>,
    ) {
        if !self.is_enabled() {
            return;
        }
        if source.header().is_permanently_dead() || context.header().is_permanently_dead() {
            return;
        }
        let source_handle = source.header().handle();
        let pending = PendingEvent {
            event: Event {
                event_type,
                source: source_handle,
                context: context.header().handle(),
                userdata: registry().peek_userdata(source_handle),
            },
            referenced: vec![WeakObjectRef::new(source), WeakObjectRef::new(context)],
        };
        let _ = self.tx.send(pending);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::object::{ObjectHeader, ObjectType};
    use crate::properties::{Property, PropertyValue};
    use std::any::Any;

    struct Dummy {
        header: ObjectHeader,
    }

    impl Dummy {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                header: ObjectHeader::new(),
            })
        }
    }

    impl BaseObject for Dummy {
        fn header(&self) -> &ObjectHeader {
            &self.header
        }
        fn object_type(&self) -> ObjectType {
            ObjectType::Buffer
        }
        fn set_property(&self, property: Property, _value: PropertyValue) -> Result<()> {
            Err(crate::object::unknown_property(self.object_type(), property))
        }
        fn get_property(&self, property: Property) -> Result<PropertyValue> {
            Err(crate::object::unknown_property(self.object_type(), property))
        }
        fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    fn erased(d: &Arc<Dummy>) -> Arc<dyn BaseObject> {
        d.clone()
    }

    #[test]
    fn disabled_sender_drops_events() {
        let sender = EventSender::new();
        let (src, ctx) = (Dummy::new(), Dummy::new());
        sender.enqueue(EventType::Looped, &erased(&src), &erased(&ctx));
        assert_eq!(sender.get_next().event_type, EventType::Invalid);
    }

    #[test]
    fn event_round_trips_when_objects_live() {
        let sender = EventSender::new();
        sender.set_enabled(true);
        let (src, ctx) = (Dummy::new(), Dummy::new());
        src.header.assign_handle(10);
        ctx.header.assign_handle(11);
        sender.enqueue(EventType::Looped, &erased(&src), &erased(&ctx));
        let event = sender.get_next();
        assert_eq!(event.event_type, EventType::Looped);
        assert_eq!(event.source, 10);
        assert_eq!(event.context, 11);
    }

    #[test]
    fn dead_source_suppresses_event() {
        let sender = EventSender::new();
        sender.set_enabled(true);
        let (src, ctx) = (Dummy::new(), Dummy::new());
        sender.enqueue(EventType::Finished, &erased(&src), &erased(&ctx));
        // Freed between enqueue and dequeue.
        src.header.latch_permanently_dead();
        assert_eq!(sender.get_next().event_type, EventType::Invalid);
    }

    #[test]
    fn dropped_source_suppresses_event() {
        let sender = EventSender::new();
        sender.set_enabled(true);
        let (src, ctx) = (Dummy::new(), Dummy::new());
        sender.enqueue(EventType::Looped, &erased(&src), &erased(&ctx));
        drop(src);
        assert_eq!(sender.get_next().event_type, EventType::Invalid);
    }

    #[test]
    fn empty_queue_returns_invalid() {
        let sender = EventSender::new();
        sender.set_enabled(true);
        assert_eq!(sender.get_next().event_type, EventType::Invalid);
    }
}
