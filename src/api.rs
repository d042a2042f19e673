//! The handle-oriented control surface.
//!
//! Everything a binding needs: library lifecycle, object factories, typed
//! property accessors, handle reference counting, and event dequeueing, all
//! in terms of opaque [`Handle`]s and [`SonanceError`] codes. A C wrapper
//! over this module is one `match` per function; nothing here exposes crate
//! internals.

use crate::buffer::{decode_to_buffer_data, BufferObject};
use crate::context::{Context, EffectExec};
use crate::decoding::{decoder_for_protocol, decoder_for_stream};
use crate::device::{AudioOutput, CpalOutput};
use crate::effects::{EchoTapConfig, GlobalEcho, GlobalFdnReverb};
use crate::error::{record_error, Result, SonanceError};
use crate::events::Event;
use crate::filter_design::BiquadConfig;
use crate::generators::{BufferGenerator, GeneratorExec, NoiseGenerator, StreamingGenerator};
use crate::handle::registry;
use crate::object::{BaseObject, Handle, ObjectType};
use crate::properties::{
    validate_read, ObjectRef, Property, PropertyKind, PropertyValue,
};
use crate::sources::{DirectSource, PannedSource, Source3D};
use crate::streams::{MemoryStream, StreamHandleObject};
use std::sync::{Arc, Mutex};

static INITIALIZED: Mutex<bool> = Mutex::new(false);

/// Where log output goes; mirrors the stable backend enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum LoggingBackend {
    None = 0,
    Stderr = 1,
}

/// Log verbosity; mirrors the stable level enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum LogLevel {
    Error = 0,
    Warn = 10,
    Info = 20,
    Debug = 30,
}

/// Configure the logging backend. Call before [`initialize`]; calling again
/// is a no-op because the global logger can only be installed once.
pub fn configure_logging_backend(backend: LoggingBackend) -> Result<()> {
    if backend == LoggingBackend::Stderr {
        let _ = env_logger::Builder::new()
            .filter_level(log::LevelFilter::Trace)
            .target(env_logger::Target::Stderr)
            .try_init();
        log::set_max_level(log::LevelFilter::Info);
    }
    Ok(())
}

pub fn set_log_level(level: LogLevel) {
    log::set_max_level(match level {
        LogLevel::Error => log::LevelFilter::Error,
        LogLevel::Warn => log::LevelFilter::Warn,
        LogLevel::Info => log::LevelFilter::Info,
        LogLevel::Debug => log::LevelFilter::Debug,
    });
}

/// Message of the most recent error on this thread.
pub use crate::error::last_error_message as get_last_error_message;
pub use crate::error::ErrorCode;

fn err<T>(e: SonanceError) -> Result<T> {
    Err(record_error(e))
}

fn track<T>(result: Result<T>) -> Result<T> {
    result.map_err(record_error)
}

fn ensure_initialized() -> Result<()> {
    if *INITIALIZED.lock().unwrap() {
        Ok(())
    } else {
        err(SonanceError::NotInitialized)
    }
}

/// Bring the library up. Fails if already initialized.
pub fn initialize() -> Result<()> {
    let mut initialized = INITIALIZED.lock().unwrap();
    if *initialized {
        return err(SonanceError::AlreadyInitialized);
    }
    *initialized = true;
    log::info!("sonance initialized");
    Ok(())
}

/// Tear the library down: every live object is latched dead, contexts stop
/// their audio threads. Idempotent; a second call succeeds as a no-op.
pub fn shutdown() -> Result<()> {
    let mut initialized = INITIALIZED.lock().unwrap();
    if !*initialized {
        return Ok(());
    }
    *initialized = false;
    drop(initialized);
    registry().shutdown_all();
    log::info!("sonance shut down");
    Ok(())
}

/* --------------------------------------------------------------------- *
 * Handles
 * --------------------------------------------------------------------- */

pub fn handle_inc_ref(handle: Handle) -> Result<()> {
    track(registry().inc_ref(handle))
}

pub fn handle_dec_ref(handle: Handle) -> Result<()> {
    track(registry().dec_ref(handle))
}

/// Alias for decrementing to release; kept for surface compatibility.
pub fn handle_free(handle: Handle) -> Result<()> {
    handle_dec_ref(handle)
}

pub fn get_object_type(handle: Handle) -> Result<ObjectType> {
    track(registry().get_object_type(handle))
}

/// Attach an opaque pointer-sized value to a handle, with an optional
/// destructor run when the handle dies (or when the value is replaced).
pub fn set_userdata(
    handle: Handle,
    value: usize,
    destructor: Option<Box<dyn FnOnce(usize) + Send>>,
) -> Result<()> {
    track(registry().set_userdata(handle, value, destructor))
}

pub fn get_userdata(handle: Handle) -> Result<usize> {
    track(registry().get_userdata(handle))
}

/* --------------------------------------------------------------------- *
 * Object factories
 * --------------------------------------------------------------------- */

fn resolve_context(handle: Handle) -> Result<Arc<Context>> {
    track(registry().resolve_as::<Context>(handle, ObjectType::Context))
}

/// Register a context-owned object: post its second-phase init to the audio
/// thread, then issue the handle. A failed post registers nothing.
fn register_in_context<T: BaseObject>(context: &Arc<Context>, object: Arc<T>) -> Result<Handle> {
    let init = object.clone();
    track(context.enqueue(move || init.init_in_audio_thread()))?;
    Ok(registry().register(object))
}

/// Create a context on the default audio device.
pub fn create_context() -> Result<Handle> {
    ensure_initialized()?;
    let output = track(CpalOutput::open().map(|o| Box::new(o) as Box<dyn AudioOutput>))?;
    let context = track(Context::new(output))?;
    Ok(registry().register(context))
}

/// Create a context over a caller-supplied output sink; no audio device is
/// touched. This is how offline rendering and tests run the full engine.
pub fn create_context_with_output(output: Box<dyn AudioOutput>) -> Result<Handle> {
    ensure_initialized()?;
    let context = track(Context::new(output))?;
    Ok(registry().register(context))
}

pub fn create_buffer_generator(context: Handle) -> Result<Handle> {
    ensure_initialized()?;
    let context = resolve_context(context)?;
    let generator = BufferGenerator::new(context.clone());
    register_in_context(&context, generator)
}

pub fn create_noise_generator(context: Handle, channels: usize) -> Result<Handle> {
    ensure_initialized()?;
    let context = resolve_context(context)?;
    let generator = NoiseGenerator::new(context.clone(), channels);
    register_in_context(&context, generator)
}

pub fn create_streaming_generator(
    context: Handle,
    protocol: &str,
    path: &str,
    options: &str,
) -> Result<Handle> {
    ensure_initialized()?;
    let context = resolve_context(context)?;
    let decoder = track(decoder_for_protocol(protocol, path, options))?;
    let generator = track(StreamingGenerator::new(context.clone(), decoder))?;
    register_in_context(&context, generator)
}

pub fn create_streaming_generator_from_stream_handle(
    context: Handle,
    stream: Handle,
) -> Result<Handle> {
    ensure_initialized()?;
    let context = resolve_context(context)?;
    let stream =
        track(registry().resolve_as::<StreamHandleObject>(stream, ObjectType::StreamHandle))?;
    let (byte_stream, hint) = track(stream.take())?;
    let decoder = track(decoder_for_stream(byte_stream, hint.as_deref()))?;
    let generator = track(StreamingGenerator::new(context.clone(), decoder))?;
    register_in_context(&context, generator)
}

pub fn create_buffer_from_file(path: &str) -> Result<Handle> {
    create_buffer_from_stream_params("file", path, "")
}

pub fn create_buffer_from_stream_params(
    protocol: &str,
    path: &str,
    options: &str,
) -> Result<Handle> {
    ensure_initialized()?;
    let decoder = track(decoder_for_protocol(protocol, path, options))?;
    let data = track(decode_to_buffer_data(decoder))?;
    Ok(registry().register(BufferObject::new(data)))
}

pub fn create_buffer_from_encoded_data(data: Vec<u8>) -> Result<Handle> {
    ensure_initialized()?;
    let stream = Box::new(MemoryStream::new(data));
    let decoder = track(decoder_for_stream(stream, None))?;
    let buffer_data = track(decode_to_buffer_data(decoder))?;
    Ok(registry().register(BufferObject::new(buffer_data)))
}

pub fn create_buffer_from_stream_handle(stream: Handle) -> Result<Handle> {
    ensure_initialized()?;
    let stream =
        track(registry().resolve_as::<StreamHandleObject>(stream, ObjectType::StreamHandle))?;
    let (byte_stream, hint) = track(stream.take())?;
    let decoder = track(decoder_for_stream(byte_stream, hint.as_deref()))?;
    let data = track(decode_to_buffer_data(decoder))?;
    Ok(registry().register(BufferObject::new(data)))
}

pub fn create_stream_handle_from_stream_params(
    protocol: &str,
    path: &str,
    options: &str,
) -> Result<Handle> {
    ensure_initialized()?;
    let stream = track(crate::streams::open_stream(protocol, path, options))?;
    let hint = crate::streams::extension_hint(path);
    Ok(registry().register(StreamHandleObject::new(stream, hint)))
}

/// Wrap caller-provided bytes as a stream handle.
pub fn create_stream_handle_from_memory(data: Vec<u8>) -> Result<Handle> {
    ensure_initialized()?;
    let stream = Box::new(MemoryStream::new(data));
    Ok(registry().register(StreamHandleObject::new(stream, None)))
}

pub fn create_direct_source(context: Handle) -> Result<Handle> {
    ensure_initialized()?;
    let context = resolve_context(context)?;
    let source = DirectSource::new(context.clone());
    register_in_context(&context, source)
}

pub fn create_panned_source(context: Handle) -> Result<Handle> {
    ensure_initialized()?;
    let context = resolve_context(context)?;
    let source = PannedSource::new(context.clone());
    register_in_context(&context, source)
}

pub fn create_source_3d(context: Handle) -> Result<Handle> {
    ensure_initialized()?;
    let context = resolve_context(context)?;
    let source = Source3D::new(context.clone());
    register_in_context(&context, source)
}

pub fn create_global_echo(context: Handle) -> Result<Handle> {
    ensure_initialized()?;
    let context = resolve_context(context)?;
    let effect = GlobalEcho::new(Arc::downgrade(&context));
    register_in_context(&context, effect)
}

pub fn create_global_fdn_reverb(context: Handle) -> Result<Handle> {
    ensure_initialized()?;
    let context = resolve_context(context)?;
    let effect = GlobalFdnReverb::new(Arc::downgrade(&context));
    register_in_context(&context, effect)
}

/* --------------------------------------------------------------------- *
 * Graph wiring
 * --------------------------------------------------------------------- */

enum AnySource {
    Direct(Arc<DirectSource>),
    Panned(Arc<PannedSource>),
    ThreeD(Arc<Source3D>),
}

impl AnySource {
    fn base(&self) -> &crate::sources::SourceBase {
        match self {
            AnySource::Direct(s) => s.base(),
            AnySource::Panned(s) => s.base(),
            AnySource::ThreeD(s) => s.base(),
        }
    }
}

fn resolve_source(handle: Handle) -> Result<AnySource> {
    let object = track(registry().resolve(handle))?;
    let downcast_failed =
        || SonanceError::Internal("object type tag does not match its type".into());
    match object.object_type() {
        ObjectType::DirectSource => Ok(AnySource::Direct(
            object.as_any_arc().downcast().map_err(|_| downcast_failed())?,
        )),
        ObjectType::PannedSource => Ok(AnySource::Panned(
            object.as_any_arc().downcast().map_err(|_| downcast_failed())?,
        )),
        ObjectType::Source3D => Ok(AnySource::ThreeD(
            object.as_any_arc().downcast().map_err(|_| downcast_failed())?,
        )),
        other => err(SonanceError::WrongObjectType {
            expected: "a source",
            got: other.name(),
        }),
    }
}

fn resolve_generator(handle: Handle) -> Result<Arc<dyn GeneratorExec>> {
    let object = track(registry().resolve(handle))?;
    let downcast_failed =
        || SonanceError::Internal("object type tag does not match its type".into());
    let generator: Arc<dyn GeneratorExec> = match object.object_type() {
        ObjectType::BufferGenerator => object
            .as_any_arc()
            .downcast::<BufferGenerator>()
            .map_err(|_| downcast_failed())?,
        ObjectType::StreamingGenerator => object
            .as_any_arc()
            .downcast::<StreamingGenerator>()
            .map_err(|_| downcast_failed())?,
        ObjectType::NoiseGenerator => object
            .as_any_arc()
            .downcast::<NoiseGenerator>()
            .map_err(|_| downcast_failed())?,
        other => {
            return err(SonanceError::WrongObjectType {
                expected: "a generator",
                got: other.name(),
            })
        }
    };
    Ok(generator)
}

fn resolve_effect(handle: Handle) -> Result<Arc<dyn EffectExec>> {
    let object = track(registry().resolve(handle))?;
    let downcast_failed =
        || SonanceError::Internal("object type tag does not match its type".into());
    let effect: Arc<dyn EffectExec> = match object.object_type() {
        ObjectType::GlobalEcho => object
            .as_any_arc()
            .downcast::<GlobalEcho>()
            .map_err(|_| downcast_failed())?,
        ObjectType::GlobalFdnReverb => object
            .as_any_arc()
            .downcast::<GlobalFdnReverb>()
            .map_err(|_| downcast_failed())?,
        other => {
            return err(SonanceError::WrongObjectType {
                expected: "a global effect",
                got: other.name(),
            })
        }
    };
    Ok(effect)
}

pub fn source_add_generator(source: Handle, generator: Handle) -> Result<()> {
    ensure_initialized()?;
    let source = resolve_source(source)?;
    let generator = resolve_generator(generator)?;
    source.base().add_generator(generator);
    Ok(())
}

pub fn source_remove_generator(source: Handle, generator: Handle) -> Result<()> {
    ensure_initialized()?;
    let source = resolve_source(source)?;
    let generator = resolve_generator(generator)?;
    source.base().remove_generator(&generator);
    Ok(())
}

/// Route a source into a global effect at `slot` with the given send gain;
/// `effect = 0` clears the slot.
pub fn source_set_effect(source: Handle, slot: usize, effect: Handle, gain: f64) -> Result<()> {
    ensure_initialized()?;
    let source = resolve_source(source)?;
    if effect == 0 {
        source.base().set_route(slot, None);
        return Ok(());
    }
    let effect = resolve_effect(effect)?;
    source.base().set_route(
        slot,
        Some(crate::sources::EffectRoute {
            effect: Arc::downgrade(&effect),
            gain: gain as f32,
        }),
    );
    Ok(())
}

pub fn echo_set_taps(echo: Handle, taps: &[EchoTapConfig]) -> Result<()> {
    ensure_initialized()?;
    let echo = track(registry().resolve_as::<GlobalEcho>(echo, ObjectType::GlobalEcho))?;
    track(echo.set_taps(taps))
}

/* --------------------------------------------------------------------- *
 * Properties
 * --------------------------------------------------------------------- */

/// The target's context: either itself, or its owner.
fn property_context(object: &Arc<dyn BaseObject>) -> Result<Arc<Context>> {
    if object.object_type() == ObjectType::Context {
        return object
            .clone()
            .as_any_arc()
            .downcast::<Context>()
            .map_err(|_| SonanceError::Internal("context downcast failed".into()));
    }
    object.owning_context().ok_or_else(|| {
        SonanceError::UnknownProperty {
            property: "any",
            object_type: object.object_type().name(),
        }
    })
}

fn set_property(target: Handle, property: Property, value: PropertyValue) -> Result<()> {
    ensure_initialized()?;
    let object = track(registry().resolve(target))?;
    // Validate against the schema before looking for a context, so
    // property-less objects report UnknownProperty rather than an
    // ownership error.
    track(crate::properties::validate_write(
        object.object_type(),
        property,
        &value,
    ))?;
    let context = track(property_context(&object))?;
    track(context.write_property(object, property, value))
}

fn get_property(target: Handle, property: Property, kind: PropertyKind) -> Result<PropertyValue> {
    ensure_initialized()?;
    let object = track(registry().resolve(target))?;
    track(validate_read(object.object_type(), property, kind))?;
    let context = track(property_context(&object))?;
    track(context.read_property(object, property))
}

pub fn set_i(target: Handle, property: Property, value: i64) -> Result<()> {
    set_property(target, property, PropertyValue::Int(value))
}

pub fn get_i(target: Handle, property: Property) -> Result<i64> {
    match get_property(target, property, PropertyKind::Int)? {
        PropertyValue::Int(v) => Ok(v),
        _ => err(SonanceError::Internal("property kind mismatch".into())),
    }
}

pub fn set_d(target: Handle, property: Property, value: f64) -> Result<()> {
    set_property(target, property, PropertyValue::Double(value))
}

pub fn get_d(target: Handle, property: Property) -> Result<f64> {
    match get_property(target, property, PropertyKind::Double)? {
        PropertyValue::Double(v) => Ok(v),
        _ => err(SonanceError::Internal("property kind mismatch".into())),
    }
}

pub fn set_d3(target: Handle, property: Property, value: [f64; 3]) -> Result<()> {
    set_property(target, property, PropertyValue::Double3(value))
}

pub fn get_d3(target: Handle, property: Property) -> Result<[f64; 3]> {
    match get_property(target, property, PropertyKind::Double3)? {
        PropertyValue::Double3(v) => Ok(v),
        _ => err(SonanceError::Internal("property kind mismatch".into())),
    }
}

pub fn set_d6(target: Handle, property: Property, value: [f64; 6]) -> Result<()> {
    set_property(target, property, PropertyValue::Double6(value))
}

pub fn get_d6(target: Handle, property: Property) -> Result<[f64; 6]> {
    match get_property(target, property, PropertyKind::Double6)? {
        PropertyValue::Double6(v) => Ok(v),
        _ => err(SonanceError::Internal("property kind mismatch".into())),
    }
}

/// Set an object-valued property; `value = 0` clears it.
pub fn set_o(target: Handle, property: Property, value: Handle) -> Result<()> {
    let reference = if value == 0 {
        ObjectRef::null()
    } else {
        let object = track(registry().resolve(value))?;
        ObjectRef {
            handle: value,
            object: Some(object),
        }
    };
    set_property(target, property, PropertyValue::Object(reference))
}

pub fn get_o(target: Handle, property: Property) -> Result<Handle> {
    match get_property(target, property, PropertyKind::Object)? {
        PropertyValue::Object(reference) => Ok(reference.handle),
        _ => err(SonanceError::Internal("property kind mismatch".into())),
    }
}

pub fn set_biquad(target: Handle, property: Property, value: BiquadConfig) -> Result<()> {
    set_property(target, property, PropertyValue::Biquad(value))
}

pub fn get_biquad(target: Handle, property: Property) -> Result<BiquadConfig> {
    match get_property(target, property, PropertyKind::Biquad)? {
        PropertyValue::Biquad(v) => Ok(v),
        _ => err(SonanceError::Internal("property kind mismatch".into())),
    }
}

/* --------------------------------------------------------------------- *
 * Events
 * --------------------------------------------------------------------- */

pub fn context_enable_events(context: Handle) -> Result<()> {
    ensure_initialized()?;
    let context = resolve_context(context)?;
    context.enable_events();
    Ok(())
}

/// Dequeue the next event, or an `Invalid` event when none are pending (or
/// the head event referenced a freed object).
pub fn context_get_next_event(context: Handle) -> Result<Event> {
    ensure_initialized()?;
    let context = resolve_context(context)?;
    Ok(context.get_next_event())
}

/// Release any resources tied to a dequeued event. Currently a no-op; kept
/// so bindings written against it stay correct if events grow payloads.
pub fn event_deinit(_event: &mut Event) {}
