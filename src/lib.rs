//! Sonance - real-time 3D audio synthesis and spatialization.
//!
//! A context owns an audio thread that mixes generators through sources
//! (direct, panned, or fully spatialized) into global effects and a master
//! bus, driven at a fixed block rate. Control happens through opaque
//! handles and typed properties; see [`api`] for the full surface.
//!
//! ```no_run
//! use sonance::api;
//! use sonance::properties::Property;
//!
//! api::initialize().unwrap();
//! let ctx = api::create_context().unwrap();
//! let src = api::create_source_3d(ctx).unwrap();
//! let gen = api::create_buffer_generator(ctx).unwrap();
//! let buf = api::create_buffer_from_file("hello.ogg").unwrap();
//! api::set_o(gen, Property::Buffer, buf).unwrap();
//! api::source_add_generator(src, gen).unwrap();
//! api::set_d3(src, Property::Position, [3.0, 4.0, 0.0]).unwrap();
//! ```

pub mod api;
pub mod buffer;
pub mod config;
pub mod context;
pub mod decoding;
pub mod device;
pub mod effects;
pub mod error;
pub mod events;
pub mod fade;
pub mod filter_design;
pub mod generators;
mod handle;
mod invokable;
pub mod math;
pub mod object;
pub mod panner;
pub mod properties;
pub mod resampler;
pub mod spatial;
pub mod sources;
pub mod streams;

pub use error::{ErrorCode, Result, SonanceError};
pub use events::{Event, EventType};
pub use object::{Handle, ObjectType};
pub use panner::PannerStrategy;
pub use properties::Property;
pub use spatial::DistanceModel;
