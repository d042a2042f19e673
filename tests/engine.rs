//! End-to-end scenarios: the full pipeline running against an in-process
//! output sink.

mod common;

use common::{ensure_init, peak, rms, sine, sink_context, wav_bytes};
use sonance::api;
use sonance::config::{BLOCK_SIZE, SR};
use sonance::events::EventType;
use sonance::filter_design::BiquadConfig;
use sonance::properties::{schema_of, Property, PropertyKind, PropertyValue};
use sonance::{DistanceModel, ErrorCode, ObjectType, PannerStrategy};
use std::time::{Duration, Instant};

/// Scenario: a looping 1 kHz sine through a direct source reaches the
/// master at close to full scale.
#[test]
fn sine_smoke() {
    let (ctx, sink) = sink_context(SR as usize * 4);
    let buffer = api::create_buffer_from_encoded_data(wav_bytes(&sine(1000.0, SR as usize, SR), SR))
        .unwrap();
    let generator = api::create_buffer_generator(ctx).unwrap();
    let source = api::create_direct_source(ctx).unwrap();
    api::source_add_generator(source, generator).unwrap();
    api::set_i(generator, Property::Looping, 1).unwrap();
    api::set_o(generator, Property::Buffer, buffer).unwrap();
    // Reading back forces the ring to drain, so the generator is live
    // before measurement starts.
    assert_eq!(api::get_o(generator, Property::Buffer).unwrap(), buffer);
    sink.clear();

    sink.wait_for_frames(SR as usize * 4);
    let samples = sink.samples();
    // Inspect a late window, well past setup and fade-in.
    let tail = &samples[samples.len() - 4410 * 2..];
    let tail_peak = peak(tail);
    assert!(
        (0.9..=1.0).contains(&tail_peak),
        "sine peak was {tail_peak}"
    );
    api::handle_free(source).unwrap();
    api::handle_free(generator).unwrap();
    api::handle_free(buffer).unwrap();
    api::handle_free(ctx).unwrap();
}

/// Scenario: a 3D source at (1, 0, 0) with the default listener lands hard
/// right.
#[test]
fn pan_3d_right() {
    let (ctx, sink) = sink_context(SR as usize * 2);
    api::set_i(
        ctx,
        Property::DefaultPannerStrategy,
        PannerStrategy::Stereo as i64,
    )
    .unwrap();
    let buffer = api::create_buffer_from_encoded_data(wav_bytes(&sine(440.0, SR as usize, SR), SR))
        .unwrap();
    let generator = api::create_buffer_generator(ctx).unwrap();
    let source = api::create_source_3d(ctx).unwrap();
    api::source_add_generator(source, generator).unwrap();
    api::set_d3(source, Property::Position, [1.0, 0.0, 0.0]).unwrap();
    api::set_i(generator, Property::Looping, 1).unwrap();
    api::set_o(generator, Property::Buffer, buffer).unwrap();
    assert_eq!(api::get_o(generator, Property::Buffer).unwrap(), buffer);
    sink.clear();

    sink.wait_for_frames(SR as usize * 2);
    let samples = sink.samples();
    let tail = &samples[samples.len() - 8820..];
    let left: Vec<f32> = tail.iter().step_by(2).copied().collect();
    let right: Vec<f32> = tail[1..].iter().step_by(2).copied().collect();
    assert!(rms(&right) > 0.1, "right channel silent");
    assert!(
        rms(&left) < rms(&right) * 0.05,
        "left {} right {}",
        rms(&left),
        rms(&right)
    );
    api::handle_free(ctx).unwrap();
}

/// Scenario: INVERSE distance model at 100x the reference distance is
/// roughly 100x quieter than at the reference distance.
#[test]
fn distance_inverse_attenuates() {
    let (ctx, sink) = sink_context(SR as usize);
    api::set_i(
        ctx,
        Property::DefaultPannerStrategy,
        PannerStrategy::Stereo as i64,
    )
    .unwrap();
    let buffer = api::create_buffer_from_encoded_data(wav_bytes(&sine(440.0, SR as usize, SR), SR))
        .unwrap();
    let generator = api::create_buffer_generator(ctx).unwrap();
    let source = api::create_source_3d(ctx).unwrap();
    api::source_add_generator(source, generator).unwrap();
    api::set_i(source, Property::DistanceModel, DistanceModel::Inverse as i64).unwrap();
    api::set_d(source, Property::DistanceRef, 1.0).unwrap();
    api::set_d(source, Property::DistanceMax, 100.0).unwrap();
    api::set_d(source, Property::Rolloff, 1.0).unwrap();
    api::set_i(generator, Property::Looping, 1).unwrap();
    api::set_o(generator, Property::Buffer, buffer).unwrap();

    let measure_at = |position: [f64; 3]| -> f32 {
        api::set_d3(source, Property::Position, position).unwrap();
        // Let the fade settle, then sample a fresh window.
        std::thread::sleep(Duration::from_millis(30));
        sink.clear();
        sink.wait_for_frames(SR as usize / 2);
        rms(&sink.samples())
    };

    let near = measure_at([0.0, 1.0, 0.0]);
    let far = measure_at([0.0, 100.0, 0.0]);
    assert!(near > 0.1, "near rms {near}");
    let ratio = far / near;
    assert!(ratio < 0.05, "far/near ratio {ratio}");
    api::handle_free(ctx).unwrap();
}

fn drain_events(ctx: u64, budget: Duration) -> Vec<sonance::Event> {
    let mut events = Vec::new();
    let deadline = Instant::now() + budget;
    while Instant::now() < deadline {
        let event = api::context_get_next_event(ctx).unwrap();
        if event.event_type == EventType::Invalid {
            std::thread::sleep(Duration::from_millis(1));
            continue;
        }
        events.push(event);
    }
    events
}

/// Scenario: a finite looping stream delivers one Looped event per
/// wrap-around, and position wraps with it.
#[test]
fn streaming_loop_events() {
    // Generous limit: the accounting below must finish well before the
    // sink starts discarding, or mixed frames and stored frames diverge.
    let (ctx, sink) = sink_context(SR as usize * 32);
    api::context_enable_events(ctx).unwrap();

    // A quarter-second stream looped over ~2 seconds of audio: 7-9 loops.
    let loop_frames = SR as usize / 4;
    let stream = api::create_stream_handle_from_memory(wav_bytes(
        &sine(440.0, loop_frames, SR),
        SR,
    ))
    .unwrap();
    let generator = api::create_streaming_generator_from_stream_handle(ctx, stream).unwrap();
    let source = api::create_direct_source(ctx).unwrap();
    api::set_i(generator, Property::Looping, 1).unwrap();
    let start_frames = sink.frames_written();
    api::source_add_generator(source, generator).unwrap();

    sink.wait_for_frames(start_frames + SR as usize * 2);
    // Freeing the source stops the generator from being pulled, freezing
    // the loop count within a block of the frame reading.
    api::handle_free(source).unwrap();
    let end_frames = sink.frames_written();

    let events = drain_events(ctx, Duration::from_millis(300));
    let looped = events
        .iter()
        .filter(|e| e.event_type == EventType::Looped && e.source == generator)
        .count();
    let expected = (end_frames - start_frames) / loop_frames;
    assert!(
        (looped as i64 - expected as i64).abs() <= 3,
        "looped {looped}, expected about {expected}"
    );

    // Position stays within one loop length.
    let position = api::get_d(generator, Property::Position).unwrap();
    assert!(position <= loop_frames as f64 / SR as f64 + 0.2, "position {position}");
    api::handle_free(ctx).unwrap();
}

/// Scenario: a non-looping stream reports Finished exactly once, and a
/// seek re-arms it.
#[test]
fn streaming_finished_once_and_rearm() {
    let (ctx, sink) = sink_context(SR as usize * 8);
    api::context_enable_events(ctx).unwrap();

    let stream = api::create_stream_handle_from_memory(wav_bytes(
        &sine(440.0, SR as usize / 8, SR),
        SR,
    ))
    .unwrap();
    let generator = api::create_streaming_generator_from_stream_handle(ctx, stream).unwrap();
    let source = api::create_direct_source(ctx).unwrap();
    api::source_add_generator(source, generator).unwrap();

    let start = sink.frames_written();
    sink.wait_for_frames(start + SR as usize);
    let events = drain_events(ctx, Duration::from_millis(300));
    let finished = events
        .iter()
        .filter(|e| e.event_type == EventType::Finished && e.source == generator)
        .count();
    assert_eq!(finished, 1, "finished should be one-shot");

    // Seeking backwards re-arms the latch.
    api::set_d(generator, Property::Position, 0.0).unwrap();
    let start = sink.frames_written();
    sink.wait_for_frames(start + SR as usize);
    let events = drain_events(ctx, Duration::from_millis(300));
    let finished = events
        .iter()
        .filter(|e| e.event_type == EventType::Finished && e.source == generator)
        .count();
    assert_eq!(finished, 1, "seek should re-arm finished");
    api::handle_free(ctx).unwrap();
}

/// Scenario: events referencing a freed object are delivered as Invalid.
#[test]
fn freed_source_suppresses_events() {
    let (ctx, sink) = sink_context(SR as usize * 4);
    api::context_enable_events(ctx).unwrap();

    // A buffer shorter than a block loops several times per block, keeping
    // the event queue busy.
    let buffer =
        api::create_buffer_from_encoded_data(wav_bytes(&sine(440.0, 64, SR), SR)).unwrap();
    let generator = api::create_buffer_generator(ctx).unwrap();
    let source = api::create_direct_source(ctx).unwrap();
    api::source_add_generator(source, generator).unwrap();
    api::set_i(generator, Property::Looping, 1).unwrap();
    api::set_o(generator, Property::Buffer, buffer).unwrap();

    // Prove events are flowing.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let event = api::context_get_next_event(ctx).unwrap();
        if event.event_type == EventType::Looped {
            assert_eq!(event.source, generator);
            break;
        }
        assert!(Instant::now() < deadline, "no looped event arrived");
        std::thread::sleep(Duration::from_millis(1));
    }

    // Free the generator's handle; queued and future events referencing it
    // must all be suppressed.
    api::handle_free(generator).unwrap();
    std::thread::sleep(Duration::from_millis(20));
    for _ in 0..200 {
        let event = api::context_get_next_event(ctx).unwrap();
        assert_eq!(
            event.event_type,
            EventType::Invalid,
            "event for freed object delivered"
        );
    }
    let _ = sink.frames_written();
    api::handle_free(ctx).unwrap();
}

/// P1: every property in every schema round-trips through set/get.
#[test]
fn property_round_trips_per_schema() {
    let (ctx, _sink) = sink_context(BLOCK_SIZE * 16);
    let buffer =
        api::create_buffer_from_encoded_data(wav_bytes(&sine(440.0, 256, SR), SR)).unwrap();

    let objects = vec![
        (ObjectType::Context, ctx),
        (ObjectType::BufferGenerator, api::create_buffer_generator(ctx).unwrap()),
        (
            ObjectType::StreamingGenerator,
            api::create_streaming_generator_from_stream_handle(
                ctx,
                api::create_stream_handle_from_memory(wav_bytes(&sine(440.0, 256, SR), SR))
                    .unwrap(),
            )
            .unwrap(),
        ),
        (ObjectType::NoiseGenerator, api::create_noise_generator(ctx, 2).unwrap()),
        (ObjectType::DirectSource, api::create_direct_source(ctx).unwrap()),
        (ObjectType::PannedSource, api::create_panned_source(ctx).unwrap()),
        (ObjectType::Source3D, api::create_source_3d(ctx).unwrap()),
        (ObjectType::GlobalEcho, api::create_global_echo(ctx).unwrap()),
        (ObjectType::GlobalFdnReverb, api::create_global_fdn_reverb(ctx).unwrap()),
    ];

    for (object_type, handle) in &objects {
        assert_eq!(api::get_object_type(*handle).unwrap(), *object_type);
        for descriptor in schema_of(*object_type) {
            let scalar = if descriptor.max.is_finite() {
                (descriptor.min + descriptor.max) / 2.0
            } else {
                descriptor.min + 1.0
            };
            match descriptor.kind {
                PropertyKind::Int => {
                    let value = scalar.floor() as i64;
                    api::set_i(*handle, descriptor.property, value).unwrap();
                    assert_eq!(api::get_i(*handle, descriptor.property).unwrap(), value);
                }
                PropertyKind::Double => {
                    api::set_d(*handle, descriptor.property, scalar).unwrap();
                    assert_eq!(api::get_d(*handle, descriptor.property).unwrap(), scalar);
                }
                PropertyKind::Double3 => {
                    let value = [1.0, -2.0, 3.5];
                    api::set_d3(*handle, descriptor.property, value).unwrap();
                    assert_eq!(api::get_d3(*handle, descriptor.property).unwrap(), value);
                }
                PropertyKind::Double6 => {
                    let value = [0.0, 1.0, 0.0, 0.0, 0.0, 1.0];
                    api::set_d6(*handle, descriptor.property, value).unwrap();
                    assert_eq!(api::get_d6(*handle, descriptor.property).unwrap(), value);
                }
                PropertyKind::Object => {
                    api::set_o(*handle, descriptor.property, buffer).unwrap();
                    assert_eq!(api::get_o(*handle, descriptor.property).unwrap(), buffer);
                }
                PropertyKind::Biquad => {
                    let value = BiquadConfig {
                        b0: 0.5,
                        b1: 0.25,
                        b2: 0.125,
                        a1: -0.1,
                        a2: 0.05,
                        gain: 0.9,
                    };
                    api::set_biquad(*handle, descriptor.property, value).unwrap();
                    assert_eq!(api::get_biquad(*handle, descriptor.property).unwrap(), value);
                }
            }
        }
    }
    api::handle_free(ctx).unwrap();
}

/// Error taxonomy at the surface.
#[test]
fn error_codes_match_taxonomy() {
    let (ctx, _sink) = sink_context(BLOCK_SIZE * 16);
    let generator = api::create_noise_generator(ctx, 1).unwrap();

    // Unknown property for the type.
    let err = api::set_o(generator, Property::Buffer, 0).unwrap_err();
    assert_eq!(err.code(), ErrorCode::UnknownProperty);

    // Wrong accessor for a declared property.
    let err = api::set_d(generator, Property::NoiseType, 1.0).unwrap_err();
    assert_eq!(err.code(), ErrorCode::WrongPropertyType);

    // Out of declared range.
    let err = api::set_i(generator, Property::NoiseType, 99).unwrap_err();
    assert_eq!(err.code(), ErrorCode::Range);
    assert!(!api::get_last_error_message().is_empty());

    // Unknown handle.
    let err = api::get_object_type(u64::MAX).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidHandle);

    // Wrong object type.
    let err = api::source_add_generator(generator, generator).unwrap_err();
    assert_eq!(err.code(), ErrorCode::WrongObjectType);

    // Unknown protocol.
    let err = api::create_streaming_generator(ctx, "gopher", "x", "").unwrap_err();
    assert_eq!(err.code(), ErrorCode::UnknownProtocol);

    // Double-free of a stale handle is a tolerated no-op.
    let buffer =
        api::create_buffer_from_encoded_data(wav_bytes(&sine(440.0, 64, SR), SR)).unwrap();
    api::handle_free(buffer).unwrap();
    api::handle_free(buffer).unwrap();

    api::handle_free(ctx).unwrap();
}

/// Userdata attaches to handles and its destructor runs on free.
#[test]
fn userdata_lifecycle() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    let (ctx, _sink) = sink_context(BLOCK_SIZE * 16);
    let buffer =
        api::create_buffer_from_encoded_data(wav_bytes(&sine(440.0, 64, SR), SR)).unwrap();

    let dropped = Arc::new(AtomicUsize::new(0));
    let observer = dropped.clone();
    api::set_userdata(
        buffer,
        0xDEAD,
        Some(Box::new(move |value| {
            assert_eq!(value, 0xDEAD);
            observer.fetch_add(1, Ordering::SeqCst);
        })),
    )
    .unwrap();
    assert_eq!(api::get_userdata(buffer).unwrap(), 0xDEAD);

    api::handle_free(buffer).unwrap();
    assert_eq!(dropped.load(Ordering::SeqCst), 1);
    api::handle_free(ctx).unwrap();
}

/// Effects wire up end to end: a routed echo tap thickens the output.
#[test]
fn echo_routing_produces_output() {
    let (ctx, sink) = sink_context(SR as usize * 2);
    let buffer = api::create_buffer_from_encoded_data(wav_bytes(&sine(440.0, SR as usize, SR), SR))
        .unwrap();
    let generator = api::create_buffer_generator(ctx).unwrap();
    let source = api::create_direct_source(ctx).unwrap();
    let echo = api::create_global_echo(ctx).unwrap();
    api::echo_set_taps(
        echo,
        &[sonance::effects::EchoTapConfig {
            delay: 0.05,
            gain_l: 0.5,
            gain_r: 0.5,
        }],
    )
    .unwrap();
    api::source_add_generator(source, generator).unwrap();
    api::source_set_effect(source, 0, echo, 1.0).unwrap();
    // Only the echo path is audible: the direct path is muted through its
    // per-path filter gain.
    api::set_biquad(
        source,
        Property::FilterDirect,
        BiquadConfig {
            gain: 0.0,
            ..BiquadConfig::identity()
        },
    )
    .unwrap();
    api::set_i(generator, Property::Looping, 1).unwrap();
    api::set_o(generator, Property::Buffer, buffer).unwrap();
    assert_eq!(api::get_o(generator, Property::Buffer).unwrap(), buffer);
    sink.clear();

    sink.wait_for_frames(SR as usize * 2);
    let samples = sink.samples();
    let tail = &samples[samples.len() - 8820..];
    let tail_rms = rms(tail);
    assert!(
        tail_rms > 0.05,
        "echo send produced no output: rms {tail_rms}"
    );
    // And it is quieter than the dry sine would be, since only the tap at
    // half gain remains.
    assert!(tail_rms < 0.6, "echo output implausibly loud: {tail_rms}");
    api::handle_free(ctx).unwrap();
}

/// Streaming generators keep up with real time: after the pipeline warms
/// up, output contains no silent stretches (P6).
#[test]
fn streaming_does_not_starve() {
    let (ctx, sink) = sink_context(SR as usize * 2);
    ensure_init();
    let stream = api::create_stream_handle_from_memory(wav_bytes(
        &sine(440.0, SR as usize * 4, SR),
        SR,
    ))
    .unwrap();
    let generator = api::create_streaming_generator_from_stream_handle(ctx, stream).unwrap();
    let source = api::create_direct_source(ctx).unwrap();
    api::source_add_generator(source, generator).unwrap();
    let _ = api::get_d(generator, Property::Position).unwrap();
    sink.clear();

    sink.wait_for_frames(SR as usize * 2);
    let samples = sink.samples();
    // Skip the warmup half, then look for silent blocks. The unpaced test
    // sink consumes faster than a device would, so allow a small number of
    // underruns; a starving pipeline fails by orders of magnitude.
    let steady = &samples[samples.len() / 2..];
    let total_blocks = steady.len() / (BLOCK_SIZE * 2);
    let silent_blocks = steady
        .chunks(BLOCK_SIZE * 2)
        .filter(|chunk| peak(chunk) == 0.0)
        .count();
    assert!(
        silent_blocks <= total_blocks / 20,
        "streaming starved {silent_blocks} of {total_blocks} blocks"
    );
    api::handle_free(ctx).unwrap();
}
