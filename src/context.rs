//! The context: scheduler, audio thread, and 3D environment state.
//!
//! A context owns exactly one audio thread. All control-plane traffic
//! reaches that thread through the invokable queue or the property ring;
//! all object teardown that could race the mixer goes through the
//! iteration-tagged deferred deleter. The per-block pipeline is:
//!
//! 1. bump the iteration counter,
//! 2. run up to a bounded number of invokables,
//! 3. drain the property ring fully,
//! 4. refresh the listener transform,
//! 5. run every live source (generators -> filters -> panning -> master
//!    and effect sends),
//! 6. run global effects into the master,
//! 7. apply the context gain and hand the block to the output sink,
//! 8. execute deletion records that are at least two iterations old.

use crate::config::{BLOCK_SIZE, OUTPUT_CHANNELS};
use crate::device::AudioOutput;
use crate::error::{Result, SonanceError};
use crate::events::{EventSender, EventType};
use crate::fade::FadeDriver;
use crate::invokable::InvokableQueue;
use crate::math::ListenerFrame;
use crate::object::{BaseObject, ObjectHeader, ObjectType};
use crate::panner::{PannerBank, PannerLane, PannerStrategy};
use crate::properties::{
    validate_write, Double3Cell, Double6Cell, DoubleCell, IntCell, Property, PropertyRing,
    PropertyValue, PropertyWrite,
};
use crate::spatial::{DistanceModel, DistanceParams};
use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Audio-thread side of a source; implemented by the three source types.
pub(crate) trait SourceExec: BaseObject {
    fn run_block(&self, block: u64, listener: &ListenerFrame, master: &mut [f32]);
}

/// Audio-thread side of a global effect.
pub(crate) trait EffectExec: BaseObject {
    /// Accumulate a stereo block into the effect's input bus (a send).
    fn accumulate_input(&self, block: &[f32]);

    /// Process the input bus into the master and clear it.
    fn run_block(&self, block: u64, master: &mut [f32]);
}

struct DeletionRecord {
    iteration: u64,
    object: Arc<dyn BaseObject>,
}

/// State owned by the audio thread; other threads reach it only through
/// invokables, so the mutex is effectively uncontended.
struct AudioState {
    sources: Vec<Weak<dyn SourceExec>>,
    effects: Vec<Arc<dyn EffectExec>>,
    gain_fade: FadeDriver,
    panner_bank: Arc<PannerBank>,
}

pub struct Context {
    header: ObjectHeader,
    running: AtomicBool,
    dead: AtomicBool,
    iteration: AtomicU64,

    invokables: InvokableQueue,
    property_ring: PropertyRing,
    events: EventSender,

    pending_deletes: Mutex<VecDeque<DeletionRecord>>,
    deletes_in_progress: AtomicUsize,

    audio_state: Mutex<AudioState>,
    audio_thread: Mutex<Option<std::thread::JoinHandle<()>>>,

    // Listener and context-wide properties.
    gain: DoubleCell,
    position: Double3Cell,
    orientation: Double6Cell,
    default_distance_model: IntCell,
    default_distance_ref: DoubleCell,
    default_distance_max: DoubleCell,
    default_rolloff: DoubleCell,
    default_closeness_boost: DoubleCell,
    default_closeness_boost_distance: DoubleCell,
    default_panner_strategy: IntCell,
}

impl Context {
    /// Construct and start a context over the given output sink. The
    /// constructor itself is trivial; the audio thread starts in the
    /// second phase once the `Arc` exists.
    pub fn new(output: Box<dyn AudioOutput>) -> Result<Arc<Self>> {
        let defaults = DistanceParams::default();
        let context = Arc::new(Self {
            header: ObjectHeader::new(),
            running: AtomicBool::new(false),
            dead: AtomicBool::new(false),
            iteration: AtomicU64::new(0),
            invokables: InvokableQueue::new(),
            property_ring: PropertyRing::new(),
            events: EventSender::new(),
            pending_deletes: Mutex::new(VecDeque::new()),
            deletes_in_progress: AtomicUsize::new(0),
            audio_state: Mutex::new(AudioState {
                sources: Vec::new(),
                effects: Vec::new(),
                gain_fade: FadeDriver::new(1.0),
                panner_bank: PannerBank::new(),
            }),
            audio_thread: Mutex::new(None),
            gain: DoubleCell::new(1.0),
            position: Double3Cell::new([0.0; 3]),
            // Facing positive y with positive z as up.
            orientation: Double6Cell::new([0.0, 1.0, 0.0, 0.0, 0.0, 1.0]),
            default_distance_model: IntCell::new(defaults.model as i64),
            default_distance_ref: DoubleCell::new(defaults.distance_ref),
            default_distance_max: DoubleCell::new(defaults.distance_max),
            default_rolloff: DoubleCell::new(defaults.rolloff),
            default_closeness_boost: DoubleCell::new(defaults.closeness_boost),
            default_closeness_boost_distance: DoubleCell::new(defaults.closeness_boost_distance),
            default_panner_strategy: IntCell::new(PannerStrategy::default() as i64),
        });
        context.start_audio_thread(output);
        Ok(context)
    }

    fn start_audio_thread(self: &Arc<Self>, mut output: Box<dyn AudioOutput>) {
        self.running.store(true, Ordering::Release);
        let context = self.clone();
        let handle = std::thread::Builder::new()
            .name("sonance-audio".to_string())
            .spawn(move || {
                log::info!("audio thread started");
                let mut master = vec![0.0f32; BLOCK_SIZE * OUTPUT_CHANNELS];
                while context.running.load(Ordering::Acquire) {
                    let block = context.iteration.fetch_add(1, Ordering::AcqRel) + 1;
                    context.invokables.drain_some();
                    context.property_ring.drain();
                    master.fill(0.0);
                    context.run_block(block, &mut master);
                    if let Err(err) = output.write_block(&master) {
                        log::error!("output sink failed, stopping audio: {err}");
                        context.running.store(false, Ordering::Release);
                    }
                    context.run_deferred_deletes(block);
                }
                log::info!("audio thread exiting");
            })
            .expect("failed to spawn audio thread");
        *self.audio_thread.lock().unwrap() = Some(handle);
    }

    fn run_block(self: &Arc<Self>, block: u64, master: &mut [f32]) {
        let listener = ListenerFrame::new(self.position.get(), self.orientation.get());

        let mut state = self.audio_state.lock().unwrap();
        if let Some(gain) = self.gain.acquire() {
            state.gain_fade.set_target(block, gain as f32);
        }

        // Run sources against the master, pruning the dead. A source whose
        // handle died this block stops immediately; its lane is released
        // when the deferred deleter drops it.
        let mut live_sources = Vec::with_capacity(state.sources.len());
        state.sources.retain(|weak| match weak.upgrade() {
            Some(source) if !source.header().is_permanently_dead() => {
                live_sources.push(source);
                true
            }
            _ => false,
        });
        let effects = state.effects.clone();
        let gain_fade = state.gain_fade;
        drop(state);

        for source in live_sources {
            source.run_block(block, &listener, master);
        }

        for effect in &effects {
            if effect.header().is_permanently_dead() {
                continue;
            }
            effect.run_block(block, master);
        }

        gain_fade.drive(block, BLOCK_SIZE, |frame, gain| {
            for ch in 0..OUTPUT_CHANNELS {
                master[frame * OUTPUT_CHANNELS + ch] *= gain;
            }
        });
    }

    /* ----------------------------------------------------------------- *
     * Control plane
     * ----------------------------------------------------------------- */

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    /// Current audio iteration ("block time").
    pub fn block_time(&self) -> u64 {
        self.iteration.load(Ordering::Acquire)
    }

    /// Run `f` on the audio thread and wait for its result. If shutdown
    /// races the enqueue, this completes with the shutdown error (never a
    /// hang: whoever observed the death drains the queue for the waiters
    /// that got in ahead of it).
    pub fn call<R, F>(self: &Arc<Self>, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        self.invokables.call(|| self.is_dead(), f)
    }

    /// Fire-and-forget on the audio thread.
    pub fn enqueue(self: &Arc<Self>, f: impl FnOnce() + Send + 'static) -> Result<()> {
        if self.is_dead() {
            return Err(SonanceError::Shutdown);
        }
        self.invokables.enqueue(Box::new(f))
    }

    /// Validate a property write and push it onto the ring.
    pub fn write_property(
        self: &Arc<Self>,
        target: Arc<dyn BaseObject>,
        property: Property,
        value: PropertyValue,
    ) -> Result<()> {
        if self.is_dead() || target.header().is_permanently_dead() {
            return Err(SonanceError::Shutdown);
        }
        validate_write(target.object_type(), property, &value)?;
        self.property_ring.enqueue(PropertyWrite {
            target,
            property,
            value,
        })?;
        // Shutdown may have raced the enqueue; the write is then applied by
        // the shutdown drain, which is as serialized as it ever was.
        if self.is_dead() {
            self.property_ring.drain();
        }
        Ok(())
    }

    /// Read the audio-thread-visible value of a property. The ring is
    /// drained first so a thread always reads its own prior writes.
    pub fn read_property(
        self: &Arc<Self>,
        target: Arc<dyn BaseObject>,
        property: Property,
    ) -> Result<PropertyValue> {
        let ring_owner = self.clone();
        self.call(move || {
            ring_owner.property_ring.drain();
            target.get_property(property)
        })?
    }

    /* ----------------------------------------------------------------- *
     * Registration (audio-thread only, via init invokables)
     * ----------------------------------------------------------------- */

    pub(crate) fn register_source(&self, source: &Arc<dyn SourceExec>) {
        let mut state = self.audio_state.lock().unwrap();
        state.sources.push(Arc::downgrade(source));
    }

    pub(crate) fn register_effect(&self, effect: &Arc<dyn EffectExec>) {
        let mut state = self.audio_state.lock().unwrap();
        state.effects.push(effect.clone());
    }

    pub(crate) fn unregister_effect(&self, effect: &Arc<dyn EffectExec>) {
        let mut state = self.audio_state.lock().unwrap();
        state
            .effects
            .retain(|e| !Arc::ptr_eq(e, effect));
    }

    pub(crate) fn allocate_panner_lane(&self, strategy: PannerStrategy) -> PannerLane {
        let state = self.audio_state.lock().unwrap();
        state.panner_bank.allocate_lane(strategy)
    }

    /// Context-wide defaults consumed by new 3D sources.
    pub(crate) fn default_distance_params(&self) -> DistanceParams {
        DistanceParams {
            model: DistanceModel::from_i64(self.default_distance_model.get()),
            distance_ref: self.default_distance_ref.get(),
            distance_max: self.default_distance_max.get(),
            rolloff: self.default_rolloff.get(),
            closeness_boost: self.default_closeness_boost.get(),
            closeness_boost_distance: self.default_closeness_boost_distance.get(),
        }
    }

    pub(crate) fn default_panner_strategy(&self) -> PannerStrategy {
        PannerStrategy::from_i64(self.default_panner_strategy.get())
    }

    /* ----------------------------------------------------------------- *
     * Events
     * ----------------------------------------------------------------- */

    pub fn enable_events(&self) {
        self.events.set_enabled(true);
    }

    /// Dequeue the next pending event; `Invalid` when none remain or the
    /// head event referenced a freed object.
    pub fn get_next_event(&self) -> crate::events::Event {
        self.events.get_next()
    }

    pub(crate) fn send_event(self: &Arc<Self>, event_type: EventType, source: &Arc<dyn BaseObject>) {
        let context: Arc<dyn BaseObject> = self.clone();
        self.events.enqueue(event_type, source, &context);
    }

    /* ----------------------------------------------------------------- *
     * Deferred deletion
     * ----------------------------------------------------------------- */

    /// Queue an object whose last handle reference just dropped. It is
    /// actually dropped once two audio iterations have passed, so any
    /// in-flight block that still sees it completes first.
    pub(crate) fn enqueue_deletion(&self, object: Arc<dyn BaseObject>) {
        self.deletes_in_progress.fetch_add(1, Ordering::AcqRel);
        if self.is_dead() {
            // Audio thread is gone; nothing can alias the object.
            drop(object);
        } else {
            self.pending_deletes.lock().unwrap().push_back(DeletionRecord {
                iteration: self.block_time(),
                object,
            });
        }
        self.deletes_in_progress.fetch_sub(1, Ordering::AcqRel);
    }

    fn run_deferred_deletes(&self, block: u64) {
        let mut queue = self.pending_deletes.lock().unwrap();
        while let Some(front) = queue.front() {
            // Tags are monotone, so the first too-young record ends the scan.
            if block <= front.iteration + 1 {
                break;
            }
            let record = queue.pop_front().unwrap();
            drop(record);
        }
    }

    /* ----------------------------------------------------------------- *
     * Shutdown
     * ----------------------------------------------------------------- */

    /// Stop the audio thread and tear the context down. Idempotent; safe
    /// to call from any non-audio thread.
    pub fn shutdown(self: &Arc<Self>) {
        if self.dead.swap(true, Ordering::AcqRel) {
            return;
        }
        log::info!("context shutting down");
        self.header.latch_permanently_dead();
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.audio_thread.lock().unwrap().take() {
            let _ = handle.join();
        }

        // Pending invokables still run (completing any waiters), and queued
        // property writes still land; no new work is admitted afterwards.
        self.invokables.drain_all();
        self.property_ring.drain();

        // Wait out racing deleters, then drain the queue unconditionally.
        while self.deletes_in_progress.load(Ordering::Acquire) != 0 {
            std::hint::spin_loop();
        }
        for _ in 0..2 {
            self.pending_deletes.lock().unwrap().clear();
        }

        let state = self.audio_state.lock().unwrap();
        log::debug!(
            "context dead after {} iteration(s), {} source slot(s), {} effect(s)",
            self.block_time(),
            state.sources.len(),
            state.effects.len()
        );
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        // Normal teardown goes through shutdown(); this is the backstop for
        // contexts that were never registered.
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.audio_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl BaseObject for Context {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn object_type(&self) -> ObjectType {
        ObjectType::Context
    }

    fn set_property(&self, property: Property, value: PropertyValue) -> Result<()> {
        match (property, value) {
            (Property::Gain, PropertyValue::Double(v)) => self.gain.set(v),
            (Property::Position, PropertyValue::Double3(v)) => self.position.set(v),
            (Property::Orientation, PropertyValue::Double6(v)) => self.orientation.set(v),
            (Property::DefaultDistanceModel, PropertyValue::Int(v)) => {
                self.default_distance_model.set(v)
            }
            (Property::DefaultDistanceRef, PropertyValue::Double(v)) => {
                self.default_distance_ref.set(v)
            }
            (Property::DefaultDistanceMax, PropertyValue::Double(v)) => {
                self.default_distance_max.set(v)
            }
            (Property::DefaultRolloff, PropertyValue::Double(v)) => self.default_rolloff.set(v),
            (Property::DefaultClosenessBoost, PropertyValue::Double(v)) => {
                self.default_closeness_boost.set(v)
            }
            (Property::DefaultClosenessBoostDistance, PropertyValue::Double(v)) => {
                self.default_closeness_boost_distance.set(v)
            }
            (Property::DefaultPannerStrategy, PropertyValue::Int(v)) => {
                self.default_panner_strategy.set(v)
            }
            (property, _) => {
                return Err(crate::object::unknown_property(self.object_type(), property))
            }
        }
        Ok(())
    }

    fn get_property(&self, property: Property) -> Result<PropertyValue> {
        Ok(match property {
            Property::Gain => PropertyValue::Double(self.gain.get()),
            Property::Position => PropertyValue::Double3(self.position.get()),
            Property::Orientation => PropertyValue::Double6(self.orientation.get()),
            Property::DefaultDistanceModel => {
                PropertyValue::Int(self.default_distance_model.get())
            }
            Property::DefaultDistanceRef => PropertyValue::Double(self.default_distance_ref.get()),
            Property::DefaultDistanceMax => PropertyValue::Double(self.default_distance_max.get()),
            Property::DefaultRolloff => PropertyValue::Double(self.default_rolloff.get()),
            Property::DefaultClosenessBoost => {
                PropertyValue::Double(self.default_closeness_boost.get())
            }
            Property::DefaultClosenessBoostDistance => {
                PropertyValue::Double(self.default_closeness_boost_distance.get())
            }
            Property::DefaultPannerStrategy => {
                PropertyValue::Int(self.default_panner_strategy.get())
            }
            property => {
                return Err(crate::object::unknown_property(self.object_type(), property))
            }
        })
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::CollectSink;

    fn test_context() -> (Arc<Context>, CollectSink) {
        let sink = CollectSink::with_limit(crate::config::SR as usize * 2);
        let context = Context::new(Box::new(sink.clone())).unwrap();
        (context, sink)
    }

    #[test]
    fn context_produces_silence_with_no_sources() {
        let (context, sink) = test_context();
        sink.wait_for_frames(BLOCK_SIZE * 4);
        assert!(sink.samples().iter().all(|&s| s == 0.0));
        context.shutdown();
    }

    #[test]
    fn shutdown_is_idempotent_and_call_fails_after() {
        let (context, _sink) = test_context();
        context.shutdown();
        context.shutdown();
        let err = context.call(|| ()).unwrap_err();
        assert!(matches!(err, SonanceError::Shutdown));
    }

    #[test]
    fn property_round_trip_through_ring() {
        let (context, _sink) = test_context();
        let target: Arc<dyn BaseObject> = context.clone();
        context
            .write_property(target.clone(), Property::Gain, PropertyValue::Double(0.5))
            .unwrap();
        // The ring drains at the next block; read through an invokable so
        // ordering is guaranteed.
        let value = context.read_property(target, Property::Gain).unwrap();
        match value {
            PropertyValue::Double(v) => assert_eq!(v, 0.5),
            other => panic!("unexpected value {other:?}"),
        }
        context.shutdown();
    }

    #[test]
    fn invalid_property_write_is_rejected_before_enqueue() {
        let (context, _sink) = test_context();
        let target: Arc<dyn BaseObject> = context.clone();
        let err = context
            .write_property(target, Property::Looping, PropertyValue::Int(1))
            .unwrap_err();
        assert!(matches!(err, SonanceError::UnknownProperty { .. }));
        context.shutdown();
    }

    #[test]
    fn deferred_deletion_waits_two_iterations() {
        let (context, _sink) = test_context();
        struct Probe {
            header: ObjectHeader,
            dropped: Arc<AtomicBool>,
        }
        impl Drop for Probe {
            fn drop(&mut self) {
                self.dropped.store(true, Ordering::Release);
            }
        }
        impl BaseObject for Probe {
            fn header(&self) -> &ObjectHeader {
                &self.header
            }
            fn object_type(&self) -> ObjectType {
                ObjectType::Buffer
            }
            fn set_property(&self, p: Property, _v: PropertyValue) -> Result<()> {
                Err(crate::object::unknown_property(self.object_type(), p))
            }
            fn get_property(&self, p: Property) -> Result<PropertyValue> {
                Err(crate::object::unknown_property(self.object_type(), p))
            }
            fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
                self
            }
        }

        let dropped = Arc::new(AtomicBool::new(false));
        let probe: Arc<dyn BaseObject> = Arc::new(Probe {
            header: ObjectHeader::new(),
            dropped: dropped.clone(),
        });
        let tag = context.block_time();
        context.enqueue_deletion(probe);
        // Wait until well past tag + 1; the record must have run by then.
        while context.block_time() <= tag + 3 {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert!(dropped.load(Ordering::Acquire));
        context.shutdown();
    }

    #[test]
    fn shutdown_drains_pending_deletions() {
        let (context, _sink) = test_context();
        context.shutdown();
        // Post-shutdown deletions drop inline instead of queueing.
        let dropped = Arc::new(AtomicBool::new(false));
        struct Probe2(Arc<AtomicBool>, ObjectHeader);
        impl Drop for Probe2 {
            fn drop(&mut self) {
                self.0.store(true, Ordering::Release);
            }
        }
        impl BaseObject for Probe2 {
            fn header(&self) -> &ObjectHeader {
                &self.1
            }
            fn object_type(&self) -> ObjectType {
                ObjectType::Buffer
            }
            fn set_property(&self, p: Property, _v: PropertyValue) -> Result<()> {
                Err(crate::object::unknown_property(self.object_type(), p))
            }
            fn get_property(&self, p: Property) -> Result<PropertyValue> {
                Err(crate::object::unknown_property(self.object_type(), p))
            }
            fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
                self
            }
        }
        context.enqueue_deletion(Arc::new(Probe2(dropped.clone(), ObjectHeader::new())));
        assert!(dropped.load(Ordering::Acquire));
    }
}
