//! Library lifecycle semantics. These live in their own test binary
//! because shutdown is process-global.

mod common;

use common::{sine, wav_bytes};
use sonance::api;
use sonance::config::{BLOCK_SIZE, SR};
use sonance::device::CollectSink;
use sonance::{ErrorCode, Property};

#[test]
fn shutdown_is_idempotent_and_latches_handles() {
    // Not initialized yet: object creation refuses.
    let err = api::create_noise_generator(1, 1).unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotInitialized);

    api::initialize().unwrap();
    let err = api::initialize().unwrap_err();
    assert_eq!(err.code(), ErrorCode::AlreadyInitialized);

    let sink = CollectSink::with_limit(BLOCK_SIZE * 64);
    let ctx = api::create_context_with_output(Box::new(sink.clone())).unwrap();
    let buffer =
        api::create_buffer_from_encoded_data(wav_bytes(&sine(440.0, 256, SR), SR)).unwrap();
    let generator = api::create_buffer_generator(ctx).unwrap();
    let source = api::create_direct_source(ctx).unwrap();
    api::source_add_generator(source, generator).unwrap();
    api::set_o(generator, Property::Buffer, buffer).unwrap();

    api::shutdown().unwrap();
    // Second shutdown is OK.
    api::shutdown().unwrap();

    // Handle operations on the latched objects now fail.
    let err = api::get_object_type(source).unwrap_err();
    assert!(matches!(
        err.code(),
        ErrorCode::InvalidHandle | ErrorCode::Shutdown
    ));
    let err = api::set_i(generator, Property::Looping, 1).unwrap_err();
    assert!(matches!(
        err.code(),
        ErrorCode::InvalidHandle | ErrorCode::Shutdown | ErrorCode::NotInitialized
    ));

    // The library can come back up afterwards.
    api::initialize().unwrap();
    let sink = CollectSink::with_limit(BLOCK_SIZE * 16);
    let ctx = api::create_context_with_output(Box::new(sink.clone())).unwrap();
    sink.wait_for_frames(BLOCK_SIZE * 4);
    api::handle_free(ctx).unwrap();
    api::shutdown().unwrap();
}
