//! Typed properties and the property-write ring.
//!
//! Every object exposes a subset of [`Property`] ids as declared by the
//! schema table at the bottom of this module. User threads validate writes
//! against the schema, then push them onto a bounded ring that the audio
//! thread drains at the top of every block; property mutation order is
//! therefore serialized through the audio thread and DSP code never sees a
//! torn value. Reads route through a waitable invokable and return whatever
//! the audio thread currently sees.
//!
//! Object-side storage is a set of small cells, each with a
//! "changed since last acquire" latch so block processing can react to user
//! writes (seeks, buffer swaps) exactly once.

use crate::config;
use crate::error::{Result, SonanceError};
use crate::filter_design::BiquadConfig;
use crate::object::{BaseObject, Handle, ObjectType};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Property identifiers. Discriminants are stable and part of the external
/// surface; the grouping mirrors the object types that expose them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Property {
    Azimuth = 0,
    Buffer,
    Elevation,
    Gain,
    PannerStrategy,
    DefaultPannerStrategy,
    PanningScalar,
    Position,
    Orientation,

    ClosenessBoost,
    ClosenessBoostDistance,
    DistanceMax,
    DistanceModel,
    DistanceRef,
    Rolloff,

    DefaultClosenessBoost,
    DefaultClosenessBoostDistance,
    DefaultDistanceMax,
    DefaultDistanceModel,
    DefaultDistanceRef,
    DefaultRolloff,

    Looping,

    NoiseType,

    PitchBend,

    InputFilterEnabled,
    InputFilterCutoff,
    MeanFreePath,
    T60,
    LateReflectionsLfRolloff,
    LateReflectionsLfReference,
    LateReflectionsHfRolloff,
    LateReflectionsHfReference,
    LateReflectionsDiffusion,
    LateReflectionsModulationDepth,
    LateReflectionsModulationFrequency,
    LateReflectionsDelay,

    Filter,
    FilterDirect,
    FilterEffects,
    FilterInput,
}

impl Property {
    pub fn name(self) -> &'static str {
        match self {
            Property::Azimuth => "AZIMUTH",
            Property::Buffer => "BUFFER",
            Property::Elevation => "ELEVATION",
            Property::Gain => "GAIN",
            Property::PannerStrategy => "PANNER_STRATEGY",
            Property::DefaultPannerStrategy => "DEFAULT_PANNER_STRATEGY",
            Property::PanningScalar => "PANNING_SCALAR",
            Property::Position => "POSITION",
            Property::Orientation => "ORIENTATION",
            Property::ClosenessBoost => "CLOSENESS_BOOST",
            Property::ClosenessBoostDistance => "CLOSENESS_BOOST_DISTANCE",
            Property::DistanceMax => "DISTANCE_MAX",
            Property::DistanceModel => "DISTANCE_MODEL",
            Property::DistanceRef => "DISTANCE_REF",
            Property::Rolloff => "ROLLOFF",
            Property::DefaultClosenessBoost => "DEFAULT_CLOSENESS_BOOST",
            Property::DefaultClosenessBoostDistance => "DEFAULT_CLOSENESS_BOOST_DISTANCE",
            Property::DefaultDistanceMax => "DEFAULT_DISTANCE_MAX",
            Property::DefaultDistanceModel => "DEFAULT_DISTANCE_MODEL",
            Property::DefaultDistanceRef => "DEFAULT_DISTANCE_REF",
            Property::DefaultRolloff => "DEFAULT_ROLLOFF",
            Property::Looping => "LOOPING",
            Property::NoiseType => "NOISE_TYPE",
            Property::PitchBend => "PITCH_BEND",
            Property::InputFilterEnabled => "INPUT_FILTER_ENABLED",
            Property::InputFilterCutoff => "INPUT_FILTER_CUTOFF",
            Property::MeanFreePath => "MEAN_FREE_PATH",
            Property::T60 => "T60",
            Property::LateReflectionsLfRolloff => "LATE_REFLECTIONS_LF_ROLLOFF",
            Property::LateReflectionsLfReference => "LATE_REFLECTIONS_LF_REFERENCE",
            Property::LateReflectionsHfRolloff => "LATE_REFLECTIONS_HF_ROLLOFF",
            Property::LateReflectionsHfReference => "LATE_REFLECTIONS_HF_REFERENCE",
            Property::LateReflectionsDiffusion => "LATE_REFLECTIONS_DIFFUSION",
            Property::LateReflectionsModulationDepth => "LATE_REFLECTIONS_MODULATION_DEPTH",
            Property::LateReflectionsModulationFrequency => {
                "LATE_REFLECTIONS_MODULATION_FREQUENCY"
            }
            Property::LateReflectionsDelay => "LATE_REFLECTIONS_DELAY",
            Property::Filter => "FILTER",
            Property::FilterDirect => "FILTER_DIRECT",
            Property::FilterEffects => "FILTER_EFFECTS",
            Property::FilterInput => "FILTER_INPUT",
        }
    }
}

/// Reference to an object held in an object-valued property. Carries both
/// the handle (the external identity) and a strong reference resolved at
/// validation time, so the ring never re-resolves on the audio thread.
#[derive(Clone)]
pub struct ObjectRef {
    pub handle: Handle,
    pub object: Option<Arc<dyn BaseObject>>,
}

impl ObjectRef {
    pub fn null() -> Self {
        Self {
            handle: 0,
            object: None,
        }
    }
}

impl std::fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectRef")
            .field("handle", &self.handle)
            .finish()
    }
}

/// A property value. The variant must match the schema's declared kind.
#[derive(Debug, Clone)]
pub enum PropertyValue {
    Int(i64),
    Double(f64),
    Double3([f64; 3]),
    Double6([f64; 6]),
    Object(ObjectRef),
    Biquad(BiquadConfig),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKind {
    Int,
    Double,
    Double3,
    Double6,
    Object,
    Biquad,
}

impl PropertyValue {
    pub fn kind(&self) -> PropertyKind {
        match self {
            PropertyValue::Int(_) => PropertyKind::Int,
            PropertyValue::Double(_) => PropertyKind::Double,
            PropertyValue::Double3(_) => PropertyKind::Double3,
            PropertyValue::Double6(_) => PropertyKind::Double6,
            PropertyValue::Object(_) => PropertyKind::Object,
            PropertyValue::Biquad(_) => PropertyKind::Biquad,
        }
    }
}

/* ---------------------------------------------------------------------- *
 * Property cells
 * ---------------------------------------------------------------------- */

/// Integer-valued cell.
#[derive(Debug)]
pub struct IntCell {
    value: AtomicI64,
    changed: AtomicBool,
}

impl IntCell {
    pub fn new(value: i64) -> Self {
        Self {
            value: AtomicI64::new(value),
            changed: AtomicBool::new(false),
        }
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Release);
        self.changed.store(true, Ordering::Release);
    }

    /// Current value if it changed since the last acquire.
    pub fn acquire(&self) -> Option<i64> {
        if self.changed.swap(false, Ordering::AcqRel) {
            Some(self.get())
        } else {
            None
        }
    }
}

/// Double-valued cell; stores the bit pattern so reads are lock-free.
#[derive(Debug)]
pub struct DoubleCell {
    bits: AtomicU64,
    changed: AtomicBool,
}

impl DoubleCell {
    pub fn new(value: f64) -> Self {
        Self {
            bits: AtomicU64::new(value.to_bits()),
            changed: AtomicBool::new(false),
        }
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Acquire))
    }

    pub fn set(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::Release);
        self.changed.store(true, Ordering::Release);
    }

    /// Audio-thread bookkeeping write: updates the visible value without
    /// tripping the changed latch (used for playback position readback).
    pub fn set_internal(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::Release);
    }

    pub fn acquire(&self) -> Option<f64> {
        if self.changed.swap(false, Ordering::AcqRel) {
            Some(self.get())
        } else {
            None
        }
    }

    /// Clear the latch without reading, discarding any pending change.
    pub fn mark_unchanged(&self) {
        self.changed.store(false, Ordering::Release);
    }
}

/// Cell for the fatter value kinds that need a lock.
#[derive(Debug)]
pub struct SlotCell<T: Clone> {
    value: Mutex<T>,
    changed: AtomicBool,
}

impl<T: Clone> SlotCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            value: Mutex::new(value),
            changed: AtomicBool::new(false),
        }
    }

    pub fn get(&self) -> T {
        self.value.lock().unwrap().clone()
    }

    pub fn set(&self, value: T) {
        *self.value.lock().unwrap() = value;
        self.changed.store(true, Ordering::Release);
    }

    pub fn acquire(&self) -> Option<T> {
        if self.changed.swap(false, Ordering::AcqRel) {
            Some(self.get())
        } else {
            None
        }
    }
}

pub type Double3Cell = SlotCell<[f64; 3]>;
pub type Double6Cell = SlotCell<[f64; 6]>;
pub type BiquadCell = SlotCell<BiquadConfig>;
pub type ObjectCell = SlotCell<ObjectRef>;

/* ---------------------------------------------------------------------- *
 * Property ring
 * ---------------------------------------------------------------------- */

/// One pending write: the target was resolved at validation time.
pub(crate) struct PropertyWrite {
    pub target: Arc<dyn BaseObject>,
    pub property: Property,
    pub value: PropertyValue,
}

/// Bounded MPSC ring of property writes, drained by the audio thread every
/// block. Producers block when the ring is full; the audio thread never
/// blocks on it.
pub(crate) struct PropertyRing {
    tx: Sender<PropertyWrite>,
    rx: Receiver<PropertyWrite>,
}

impl PropertyRing {
    pub fn new() -> Self {
        let (tx, rx) = bounded(config::PROPERTY_RING_CAPACITY);
        Self { tx, rx }
    }

    /// Enqueue a validated write. Blocks while the ring is full; the audio
    /// thread drains every block, so the wait is bounded by one block
    /// period unless the context is shutting down.
    pub fn enqueue(&self, write: PropertyWrite) -> Result<()> {
        self.tx.send(write).map_err(|_| SonanceError::Shutdown)
    }

    /// Drain everything currently queued, applying each write in FIFO
    /// order. Returns the number applied.
    pub fn drain(&self) -> usize {
        let mut applied = 0;
        while let Ok(write) = self.rx.try_recv() {
            if let Err(err) = write.target.set_property(write.property, write.value) {
                // Validation happens before enqueue, so this indicates an
                // engine bug rather than a user error.
                log::error!(
                    "property ring: applying {} failed: {err}",
                    write.property.name()
                );
            }
            applied += 1;
        }
        applied
    }
}

/* ---------------------------------------------------------------------- *
 * Schema
 * ---------------------------------------------------------------------- */

/// Declared shape of one property on one object type.
#[derive(Debug, Clone, Copy)]
pub struct PropDesc {
    pub property: Property,
    pub kind: PropertyKind,
    /// Bounds for Int/Double kinds; ignored for the rest.
    pub min: f64,
    pub max: f64,
}

const fn desc(property: Property, kind: PropertyKind, min: f64, max: f64) -> PropDesc {
    PropDesc {
        property,
        kind,
        min,
        max,
    }
}

const fn unbounded(property: Property, kind: PropertyKind) -> PropDesc {
    desc(property, kind, f64::NEG_INFINITY, f64::INFINITY)
}

const GAIN: PropDesc = desc(Property::Gain, PropertyKind::Double, 0.0, f64::INFINITY);

const DISTANCE_GROUP: [PropDesc; 6] = [
    desc(Property::DistanceModel, PropertyKind::Int, 0.0, 3.0),
    desc(Property::DistanceRef, PropertyKind::Double, 0.0, f64::INFINITY),
    desc(Property::DistanceMax, PropertyKind::Double, 0.0, f64::INFINITY),
    desc(Property::Rolloff, PropertyKind::Double, 0.0, f64::INFINITY),
    desc(Property::ClosenessBoost, PropertyKind::Double, 0.0, f64::INFINITY),
    desc(
        Property::ClosenessBoostDistance,
        PropertyKind::Double,
        0.0,
        f64::INFINITY,
    ),
];

const SOURCE_FILTERS: [PropDesc; 4] = [
    unbounded(Property::Filter, PropertyKind::Biquad),
    unbounded(Property::FilterDirect, PropertyKind::Biquad),
    unbounded(Property::FilterEffects, PropertyKind::Biquad),
    unbounded(Property::FilterInput, PropertyKind::Biquad),
];

const CONTEXT_SCHEMA: [PropDesc; 10] = [
    GAIN,
    unbounded(Property::Position, PropertyKind::Double3),
    unbounded(Property::Orientation, PropertyKind::Double6),
    desc(Property::DefaultDistanceModel, PropertyKind::Int, 0.0, 3.0),
    desc(Property::DefaultDistanceRef, PropertyKind::Double, 0.0, f64::INFINITY),
    desc(Property::DefaultDistanceMax, PropertyKind::Double, 0.0, f64::INFINITY),
    desc(Property::DefaultRolloff, PropertyKind::Double, 0.0, f64::INFINITY),
    desc(Property::DefaultClosenessBoost, PropertyKind::Double, 0.0, f64::INFINITY),
    desc(
        Property::DefaultClosenessBoostDistance,
        PropertyKind::Double,
        0.0,
        f64::INFINITY,
    ),
    desc(Property::DefaultPannerStrategy, PropertyKind::Int, 0.0, 1.0),
];

const BUFFER_GENERATOR_SCHEMA: [PropDesc; 5] = [
    GAIN,
    unbounded(Property::Buffer, PropertyKind::Object),
    desc(Property::Position, PropertyKind::Double, 0.0, f64::INFINITY),
    desc(Property::Looping, PropertyKind::Int, 0.0, 1.0),
    desc(Property::PitchBend, PropertyKind::Double, 0.5, 2.0),
];

const STREAMING_GENERATOR_SCHEMA: [PropDesc; 3] = [
    GAIN,
    desc(Property::Position, PropertyKind::Double, 0.0, f64::INFINITY),
    desc(Property::Looping, PropertyKind::Int, 0.0, 1.0),
];

const NOISE_GENERATOR_SCHEMA: [PropDesc; 2] = [
    GAIN,
    desc(Property::NoiseType, PropertyKind::Int, 0.0, 2.0),
];

const DIRECT_SOURCE_SCHEMA: [PropDesc; 5] = [
    GAIN,
    SOURCE_FILTERS[0],
    SOURCE_FILTERS[1],
    SOURCE_FILTERS[2],
    SOURCE_FILTERS[3],
];

const PANNED_SOURCE_SCHEMA: [PropDesc; 9] = [
    GAIN,
    desc(Property::Azimuth, PropertyKind::Double, 0.0, 360.0),
    desc(Property::Elevation, PropertyKind::Double, -90.0, 90.0),
    desc(Property::PanningScalar, PropertyKind::Double, -1.0, 1.0),
    desc(Property::PannerStrategy, PropertyKind::Int, 0.0, 1.0),
    SOURCE_FILTERS[0],
    SOURCE_FILTERS[1],
    SOURCE_FILTERS[2],
    SOURCE_FILTERS[3],
];

const SOURCE_3D_SCHEMA: [PropDesc; 13] = [
    GAIN,
    unbounded(Property::Position, PropertyKind::Double3),
    desc(Property::PannerStrategy, PropertyKind::Int, 0.0, 1.0),
    DISTANCE_GROUP[0],
    DISTANCE_GROUP[1],
    DISTANCE_GROUP[2],
    DISTANCE_GROUP[3],
    DISTANCE_GROUP[4],
    DISTANCE_GROUP[5],
    SOURCE_FILTERS[0],
    SOURCE_FILTERS[1],
    SOURCE_FILTERS[2],
    SOURCE_FILTERS[3],
];

const GLOBAL_ECHO_SCHEMA: [PropDesc; 2] = [GAIN, SOURCE_FILTERS[3]];

const GLOBAL_FDN_REVERB_SCHEMA: [PropDesc; 13] = [
    GAIN,
    desc(Property::InputFilterEnabled, PropertyKind::Int, 0.0, 1.0),
    desc(Property::InputFilterCutoff, PropertyKind::Double, 0.0, 22050.0),
    desc(Property::MeanFreePath, PropertyKind::Double, 0.0, 0.5),
    desc(Property::T60, PropertyKind::Double, 0.0, 100.0),
    desc(Property::LateReflectionsLfRolloff, PropertyKind::Double, -2.0, 2.0),
    desc(
        Property::LateReflectionsLfReference,
        PropertyKind::Double,
        0.0,
        22050.0,
    ),
    desc(Property::LateReflectionsHfRolloff, PropertyKind::Double, -2.0, 2.0),
    desc(
        Property::LateReflectionsHfReference,
        PropertyKind::Double,
        0.0,
        22050.0,
    ),
    desc(Property::LateReflectionsDiffusion, PropertyKind::Double, 0.0, 1.0),
    desc(
        Property::LateReflectionsModulationDepth,
        PropertyKind::Double,
        0.0,
        0.3,
    ),
    desc(
        Property::LateReflectionsModulationFrequency,
        PropertyKind::Double,
        0.01,
        100.0,
    ),
    desc(Property::LateReflectionsDelay, PropertyKind::Double, 0.0, 0.5),
];

/// The schema for one object type: which properties it exposes and how.
pub fn schema_of(object_type: ObjectType) -> &'static [PropDesc] {
    match object_type {
        ObjectType::Context => &CONTEXT_SCHEMA,
        ObjectType::Buffer | ObjectType::StreamHandle => &[],
        ObjectType::BufferGenerator => &BUFFER_GENERATOR_SCHEMA,
        ObjectType::StreamingGenerator => &STREAMING_GENERATOR_SCHEMA,
        ObjectType::NoiseGenerator => &NOISE_GENERATOR_SCHEMA,
        ObjectType::DirectSource => &DIRECT_SOURCE_SCHEMA,
        ObjectType::PannedSource => &PANNED_SOURCE_SCHEMA,
        ObjectType::Source3D => &SOURCE_3D_SCHEMA,
        ObjectType::GlobalEcho => &GLOBAL_ECHO_SCHEMA,
        ObjectType::GlobalFdnReverb => &GLOBAL_FDN_REVERB_SCHEMA,
    }
}

/// Validate a write against the schema: the property must exist on the
/// type, the value kind must match, and Int/Double values must be in range.
pub fn validate_write(
    object_type: ObjectType,
    property: Property,
    value: &PropertyValue,
) -> Result<()> {
    let descriptor = schema_of(object_type)
        .iter()
        .find(|d| d.property == property)
        .ok_or_else(|| crate::object::unknown_property(object_type, property))?;

    if descriptor.kind != value.kind() {
        return Err(SonanceError::WrongPropertyType {
            property: property.name(),
            expected: kind_name(descriptor.kind),
        });
    }

    let scalar = match value {
        PropertyValue::Int(v) => Some(*v as f64),
        PropertyValue::Double(v) => Some(*v),
        _ => None,
    };
    if let Some(v) = scalar {
        if v < descriptor.min || v > descriptor.max || v.is_nan() {
            return Err(SonanceError::Range {
                property: property.name(),
                value: v,
                min: descriptor.min,
                max: descriptor.max,
            });
        }
    }

    Ok(())
}

/// Validate a read: the property must exist, and if `expected` is given the
/// declared kind must match the accessor used.
pub fn validate_read(
    object_type: ObjectType,
    property: Property,
    expected: PropertyKind,
) -> Result<()> {
    let descriptor = schema_of(object_type)
        .iter()
        .find(|d| d.property == property)
        .ok_or_else(|| crate::object::unknown_property(object_type, property))?;
    if descriptor.kind != expected {
        return Err(SonanceError::WrongPropertyType {
            property: property.name(),
            expected: kind_name(descriptor.kind),
        });
    }
    Ok(())
}

fn kind_name(kind: PropertyKind) -> &'static str {
    match kind {
        PropertyKind::Int => "int",
        PropertyKind::Double => "double",
        PropertyKind::Double3 => "double3",
        PropertyKind::Double6 => "double6",
        PropertyKind::Object => "object",
        PropertyKind::Biquad => "biquad",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cells_latch_changes() {
        let cell = DoubleCell::new(1.0);
        assert_eq!(cell.acquire(), None);
        cell.set(2.0);
        assert_eq!(cell.acquire(), Some(2.0));
        assert_eq!(cell.acquire(), None);
        // Internal writes do not trip the latch.
        cell.set_internal(3.0);
        assert_eq!(cell.acquire(), None);
        assert_eq!(cell.get(), 3.0);
    }

    #[test]
    fn int_cell_round_trips() {
        let cell = IntCell::new(0);
        cell.set(7);
        assert_eq!(cell.get(), 7);
        assert_eq!(cell.acquire(), Some(7));
    }

    #[test]
    fn schema_rejects_unknown_property() {
        let err = validate_write(
            ObjectType::NoiseGenerator,
            Property::Buffer,
            &PropertyValue::Object(ObjectRef::null()),
        )
        .unwrap_err();
        assert!(matches!(err, SonanceError::UnknownProperty { .. }));
    }

    #[test]
    fn schema_rejects_wrong_kind() {
        let err = validate_write(
            ObjectType::BufferGenerator,
            Property::Looping,
            &PropertyValue::Double(1.0),
        )
        .unwrap_err();
        assert!(matches!(err, SonanceError::WrongPropertyType { .. }));
    }

    #[test]
    fn schema_rejects_out_of_range() {
        let err = validate_write(
            ObjectType::Source3D,
            Property::DistanceModel,
            &PropertyValue::Int(9),
        )
        .unwrap_err();
        assert!(matches!(err, SonanceError::Range { .. }));
    }

    #[test]
    fn schema_accepts_valid_write() {
        validate_write(
            ObjectType::PannedSource,
            Property::Azimuth,
            &PropertyValue::Double(90.0),
        )
        .unwrap();
    }

    #[test]
    fn position_kind_depends_on_object_type() {
        // Double3 on 3D sources, plain double (seconds) on generators.
        validate_write(
            ObjectType::Source3D,
            Property::Position,
            &PropertyValue::Double3([1.0, 2.0, 3.0]),
        )
        .unwrap();
        validate_write(
            ObjectType::BufferGenerator,
            Property::Position,
            &PropertyValue::Double(1.5),
        )
        .unwrap();
    }
}
