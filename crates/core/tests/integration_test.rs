//! Integration tests for the SCO link simulation.
//!
//! These tests drive whole scenarios through [`Simulation`]: a source plays
//! a clip onto a loopback SCO link, the link injects errors, and a sink (or a
//! generic data stream on the to-air endpoint) collects what arrives.

use proptest::prelude::*;
use scosim_core::audio::{AudioClip, AudioSource, WavFile};
use scosim_core::bitio::{bits_to_bytes, bytes_to_bits, bytes_to_samples, samples_to_bytes};
use scosim_core::error::{ConfigError, LifecycleError, ResourceError};
use scosim_core::factory::{StreamDescriptor, StreamFactory};
use scosim_core::link::LinkStatistics;
use scosim_core::schema::{config_map, ConfigMap};
use scosim_core::transport::{sco_to_air, LoopbackDevice};
use scosim_core::{Error, Notification, Sample, Simulation, StreamId, StreamState, StreamType};
use serde_json::{json, Value};

/// 240 samples: eight 30-sample packets at 8 kHz, tesco 6.
fn speech() -> AudioClip {
    AudioClip::mono(8000.0, 16, (0..240).map(|i| (i * 37 % 2000) - 1000).collect())
}

fn sim() -> Simulation {
    let mut sim = Simulation::new(LoopbackDevice::new().with_sco_link(100, 1024));
    sim.add_clip("speech", speech());
    sim
}

fn instance(sim: &mut Simulation, interface: &str, stream_type: StreamType, params: Value) -> StreamId {
    sim.get_instance(interface, stream_type, &config_map(params))
        .expect("instantiation failed")
}

fn bring_up(sim: &mut Simulation, id: StreamId) {
    sim.create(id).expect("create failed");
    sim.config(id, &ConfigMap::new()).expect("config failed");
    sim.start(id).expect("start failed");
}

fn received(notes: &[Notification]) -> Vec<Vec<Sample>> {
    notes
        .iter()
        .filter_map(|n| match n {
            Notification::Data { data, .. } => Some(data.clone()),
            _ => None,
        })
        .collect()
}

fn end_of_files(notes: &[Notification]) -> usize {
    notes
        .iter()
        .filter(|n| matches!(n, Notification::EndOfFile { .. }))
        .count()
}

/// Source with `link` keys, plus a data-backed sink on the same link.
fn loopback(sim: &mut Simulation, link: Value) -> (StreamId, StreamId) {
    let mut source_params = json!({"backing": "file", "filename": "speech"});
    let mut sink_params = json!({"backing": "data", "sample_rate": 8000, "sample_width": 16});
    if let (Value::Object(src), Value::Object(extra)) = (&mut source_params, &link) {
        src.extend(extra.clone());
    }
    if let Some(enabled) = link.get("metadata_enable") {
        sink_params["metadata_enable"] = enabled.clone();
    }

    let source = instance(sim, "sco", StreamType::Source, source_params);
    sink_params["stream"] = json!(source.0);
    let sink = instance(sim, "sco", StreamType::Sink, sink_params);
    bring_up(sim, source);
    bring_up(sim, sink);
    (source, sink)
}

#[test]
fn test_clean_loopback_delivers_audio() {
    let mut sim = sim();
    let (source, sink) = loopback(&mut sim, json!({"seed": 1}));
    sim.run_for(0.05).unwrap();

    let notes = sim.take_notifications();
    let packets = received(&notes);
    assert_eq!(packets.len(), 8);
    assert_eq!(packets.concat(), speech().get_audio_stream_data(0).unwrap());
    assert_eq!(end_of_files(&notes), 1);

    let stats = sim.statistics(source).unwrap();
    assert_eq!(
        stats,
        LinkStatistics {
            sent_packets: 8,
            ..LinkStatistics::default()
        }
    );
    assert!(sim.statistics(sink).is_none());
}

#[test]
fn test_loopback_with_standard_metadata() {
    let mut sim = sim();
    loopback(&mut sim, json!({"seed": 3, "metadata_enable": true}));
    sim.run_for(0.05).unwrap();

    let packets = received(&sim.take_notifications());
    assert_eq!(packets.len(), 8);
    assert!(packets.iter().all(|p| p.len() == 30));
    assert_eq!(packets.concat(), speech().get_audio_stream_data(0).unwrap());
}

#[test]
fn test_sink_rejects_bare_packets_when_expecting_metadata() {
    let mut sim = sim();
    let source = instance(
        &mut sim,
        "sco",
        StreamType::Source,
        json!({"backing": "file", "filename": "speech", "seed": 3}),
    );
    let sink = instance(
        &mut sim,
        "sco",
        StreamType::Sink,
        json!({
            "backing": "data",
            "sample_rate": 8000,
            "sample_width": 16,
            "metadata_enable": true,
            "stream": source.0
        }),
    );
    bring_up(&mut sim, source);
    bring_up(&mut sim, sink);
    sim.run_for(0.05).unwrap();

    assert!(received(&sim.take_notifications()).is_empty());
}

#[test]
fn test_total_packet_loss_gives_silence() {
    let mut sim = sim();
    let (source, _) = loopback(&mut sim, json!({"seed": 9, "per": 100, "packet_number": 3}));
    sim.run_for(0.05).unwrap();

    let packets = received(&sim.take_notifications());
    assert_eq!(packets.len(), 8);
    assert!(packets.iter().flatten().all(|&s| s == 0));

    let stats = sim.statistics(source).unwrap();
    assert_eq!(stats.sent_packets, 8);
    assert_eq!(stats.sent_per, 24);
    assert_eq!(stats.sent_nothing_received_error, 8);
    assert_eq!(stats.sent_ber, 0);
}

fn lossy_run(seed: u64) -> (Vec<Vec<Sample>>, LinkStatistics) {
    let mut sim = sim();
    let (source, _) = loopback(
        &mut sim,
        json!({"seed": seed, "per": 30, "ber": 2, "packet_number": 3, "metadata_enable": true}),
    );
    sim.run_for(0.05).unwrap();
    let stats = sim.statistics(source).unwrap();
    (received(&sim.take_notifications()), stats)
}

#[test]
fn test_seeded_runs_are_identical() {
    let (a, stats_a) = lossy_run(77);
    let (b, stats_b) = lossy_run(77);
    assert_eq!(a, b);
    assert_eq!(stats_a, stats_b);
    assert!(stats_a.sent_ber > 0);
}

#[test]
fn test_loop_three_reports_one_completion() {
    let mut sim = sim();
    let source = instance(
        &mut sim,
        "sco",
        StreamType::Source,
        json!({"backing": "file", "filename": "speech", "loop": 3, "seed": 5}),
    );
    let tap = instance(
        &mut sim,
        "data",
        StreamType::Sink,
        json!({"endpoint": sco_to_air(100), "sample_rate": 8000, "sample_width": 16}),
    );
    bring_up(&mut sim, source);
    bring_up(&mut sim, tap);
    sim.run_for(1.0).unwrap();

    let notes = sim.take_notifications();
    assert_eq!(end_of_files(&notes), 1);
    assert_eq!(received(&notes).concat().len(), 3 * 240);
    // statistics cover the last traversal only
    assert_eq!(sim.statistics(source).unwrap().sent_packets, 8);
    assert_eq!(sim.state(source), Some(StreamState::Started));
}

#[test]
fn test_stop_is_idempotent_and_restart_resets_statistics() {
    let mut sim = sim();
    let (source, _) = loopback(&mut sim, json!({"seed": 11}));
    sim.run_for(0.01).unwrap();
    assert_eq!(sim.statistics(source).unwrap().sent_packets, 3);

    sim.stop(source).unwrap();
    sim.stop(source).unwrap();
    assert_eq!(sim.state(source), Some(StreamState::Stopped));

    sim.start(source).unwrap();
    assert_eq!(sim.statistics(source).unwrap(), LinkStatistics::default());
    sim.run_for(0.001).unwrap();
    assert_eq!(sim.statistics(source).unwrap().sent_packets, 1);
}

#[test]
fn test_invalid_transitions() {
    let mut sim = sim();
    let source = instance(
        &mut sim,
        "sco",
        StreamType::Source,
        json!({"backing": "file", "filename": "speech"}),
    );

    let err = sim.start(source).unwrap_err();
    assert!(matches!(
        err,
        Error::Lifecycle(LifecycleError::InvalidTransition {
            from: StreamState::Instantiated,
            operation: "start"
        })
    ));

    bring_up(&mut sim, source);
    let err = sim.destroy(source).unwrap_err();
    assert!(matches!(err, Error::Lifecycle(LifecycleError::InvalidTransition { .. })));

    sim.stop(source).unwrap();
    sim.destroy(source).unwrap();
    assert_eq!(sim.state(source), Some(StreamState::Destroyed));
    assert!(sim.start(source).is_err());
    sim.put_instance(source).unwrap();
    assert_eq!(sim.state(source), None);
}

#[test]
fn test_unknown_endpoint_fails_create() {
    let mut sim = sim();
    let source = instance(
        &mut sim,
        "sco",
        StreamType::Source,
        json!({"backing": "file", "filename": "speech", "service_tag": 5}),
    );
    let err = sim.create(source).unwrap_err();
    assert!(matches!(err, Error::Resource(ResourceError::EndpointUnavailable(ref e)) if e == "sco5/from_air"));
    assert_eq!(sim.state(source), Some(StreamState::Instantiated));
}

#[test]
fn test_config_errors_name_the_key() {
    let mut sim = sim();
    let err = sim
        .get_instance(
            "sco",
            StreamType::Source,
            &config_map(json!({"backing": "file", "filename": "speech", "tesco": 5})),
        )
        .unwrap_err();
    assert!(matches!(err, Error::Config(ConfigError::InvalidChoice { ref key, .. }) if key == "tesco"));

    let err = sim
        .get_instance(
            "sco",
            StreamType::Source,
            &config_map(json!({"backing": "file", "filename": "speech", "per": 120})),
        )
        .unwrap_err();
    assert!(matches!(err, Error::Config(ConfigError::OutOfRange { ref key, .. }) if key == "per"));
}

#[test]
fn test_duplicate_registration_is_rejected() {
    fn noop(
        id: StreamId,
        stream_type: StreamType,
        params: &ConfigMap,
        ctx: &scosim_core::SimContext,
    ) -> scosim_core::Result<Box<dyn scosim_core::stream::Stream>> {
        scosim_core::stream::data::DataStream::construct(id, stream_type, params, ctx)
    }

    let mut factory = StreamFactory::with_builtin();
    let err = factory
        .register(
            StreamDescriptor {
                interface: "file",
                platforms: &[],
                stream_types: &[StreamType::Source],
            },
            noop,
        )
        .unwrap_err();
    assert!(matches!(err, Error::Resource(ResourceError::DuplicateInterface(_))));

    // the original file kind still accepts sinks
    let mut sim = Simulation::with_factory(factory, LoopbackDevice::new().with_endpoint("pcm", 64));
    let params = config_map(json!({
        "filename": "out.raw",
        "endpoint": "pcm",
        "sample_rate": 8000,
        "sample_width": 16
    }));
    assert!(sim.get_instance("file", StreamType::Sink, &params).is_ok());
}

#[test]
fn test_delayed_start() {
    let mut sim = sim();
    let source = instance(
        &mut sim,
        "sco",
        StreamType::Source,
        json!({"backing": "file", "filename": "speech", "delay": 0.01}),
    );
    let tap = instance(
        &mut sim,
        "data",
        StreamType::Sink,
        json!({"endpoint": sco_to_air(100), "sample_rate": 8000, "sample_width": 16}),
    );
    bring_up(&mut sim, source);
    bring_up(&mut sim, tap);
    assert_eq!(sim.state(source), Some(StreamState::Started));

    sim.run_for(0.009).unwrap();
    assert!(received(&sim.take_notifications()).is_empty());
    sim.run_for(0.002).unwrap();
    assert_eq!(received(&sim.take_notifications()).concat().len(), 30);
}

#[test]
fn test_delayed_restart_starts_a_fresh_session() {
    let mut sim = sim();
    let (source, _) = loopback(&mut sim, json!({"seed": 3, "delay": 0.01}));
    sim.run_for(0.1).unwrap();
    assert_eq!(sim.statistics(source).unwrap().sent_packets, 8);

    sim.stop(source).unwrap();
    sim.start(source).unwrap();
    assert_eq!(sim.statistics(source).unwrap(), LinkStatistics::default());

    // stopped again before the delay ran out
    sim.run_for(0.005).unwrap();
    sim.stop(source).unwrap();
    assert_eq!(sim.statistics(source).unwrap(), LinkStatistics::default());
}

#[test]
fn test_put_instance_releases_an_undestroyed_stream() {
    let mut sim = sim();
    let params = json!({"backing": "file", "filename": "speech", "service_tag": 100});
    let first = instance(&mut sim, "sco", StreamType::Source, params.clone());
    sim.create(first).unwrap();
    assert_eq!(sim.context().sco_link_count(), 1);
    assert!(matches!(
        sim.destroy(first).unwrap_err(),
        Error::Lifecycle(LifecycleError::InvalidTransition {
            from: StreamState::Created,
            ..
        })
    ));

    sim.put_instance(first).unwrap();
    assert_eq!(sim.context().sco_link_count(), 0);
    assert!(sim.context().instances("sco").is_empty());

    let second = instance(&mut sim, "sco", StreamType::Source, params);
    sim.create(second).unwrap();
    assert_eq!(sim.context().sco_link(100).map(|l| l.members().len()), Some(1));
}

#[test]
fn test_late_sink_discards_backlog() {
    let mut sim = sim();
    let source = instance(
        &mut sim,
        "sco",
        StreamType::Source,
        json!({"backing": "file", "filename": "speech", "seed": 6}),
    );
    let sink = instance(
        &mut sim,
        "sco",
        StreamType::Sink,
        json!({"backing": "data", "sample_rate": 8000, "sample_width": 16, "stream": source.0}),
    );
    bring_up(&mut sim, source);
    sim.create(sink).unwrap();

    // three packets queue up before the sink starts
    sim.run_for(0.01).unwrap();
    sim.config(sink, &ConfigMap::new()).unwrap();
    sim.start(sink).unwrap();

    // first receive at 13.75 ms sees four packets and keeps the newest
    sim.run_for(0.004).unwrap();
    let packets = received(&sim.take_notifications());
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0], speech().get_audio_stream_data(0).unwrap()[90..120]);
}

#[test]
fn test_sink_without_data_stays_silent() {
    let mut sim = sim();
    let source = instance(
        &mut sim,
        "sco",
        StreamType::Source,
        json!({"backing": "file", "filename": "speech"}),
    );
    let sink = instance(
        &mut sim,
        "sco",
        StreamType::Sink,
        json!({"backing": "data", "sample_rate": 8000, "sample_width": 16, "stream": source.0}),
    );
    sim.create(source).unwrap();
    bring_up(&mut sim, sink);

    sim.run_for(0.02).unwrap();
    assert!(received(&sim.take_notifications()).is_empty());
    assert_eq!(sim.state(sink), Some(StreamState::Started));
}

#[test]
fn test_sink_stop_flushes_queued_packets() {
    let mut sim = sim();
    let (source, sink) = loopback(&mut sim, json!({"seed": 9}));
    // packet 0 is received at 3.75 ms, packet 1 is still queued at 5 ms
    sim.run_for(0.005).unwrap();
    assert_eq!(received(&sim.take_notifications()).len(), 1);

    sim.stop(source).unwrap();
    sim.stop(sink).unwrap();
    sim.start(sink).unwrap();
    sim.run_for(0.01).unwrap();
    assert!(received(&sim.take_notifications()).is_empty());
}

#[test]
fn test_zeagle_metadata_on_the_air() {
    let mut sim = sim();
    let source = instance(
        &mut sim,
        "sco",
        StreamType::Source,
        json!({
            "backing": "file",
            "filename": "speech",
            "seed": 2,
            "metadata_enable": true,
            "metadata_format": "zeagle"
        }),
    );
    let tap = instance(
        &mut sim,
        "data",
        StreamType::Sink,
        json!({
            "endpoint": sco_to_air(100),
            "sample_rate": 8000,
            "sample_width": 16,
            "frame_size": 66
        }),
    );
    bring_up(&mut sim, source);
    bring_up(&mut sim, tap);
    sim.run_for(0.01).unwrap();

    let air = received(&sim.take_notifications()).concat();
    assert!(air.len() >= 66);
    // standard header with status 4, declaring payload + weak header + mask
    assert_eq!(&air[..5], &[0x5C5C, 5, 122, 4, 0]);
    assert_eq!(&air[5..35], &speech().get_audio_stream_data(0).unwrap()[..30]);
    // weak header: no bit errors, status Ok; then an all-clear mask
    assert_eq!(air[35], 0);
    assert!(air[36..66].iter().all(|&s| s == 0));
}

#[test]
fn test_data_backed_source_and_forwarding() {
    let mut sim = sim();
    let source = instance(
        &mut sim,
        "sco",
        StreamType::Source,
        json!({"backing": "data", "sample_width": 16, "seed": 4}),
    );
    let sink = instance(
        &mut sim,
        "sco",
        StreamType::Sink,
        json!({"backing": "data", "sample_rate": 8000, "sample_width": 16, "stream": source.0}),
    );
    bring_up(&mut sim, source);
    bring_up(&mut sim, sink);

    let chunk: Vec<Sample> = (100..130).collect();
    sim.consume(source, 0, chunk.clone());
    sim.run_for(0.004).unwrap();
    sim.eof(source, 0);
    sim.run_for(0.001).unwrap();

    let notes = sim.take_notifications();
    assert_eq!(received(&notes), vec![chunk]);
    assert_eq!(end_of_files(&notes), 1);
}

#[test]
fn test_file_sink_writes_wav() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("capture.wav");
    let filename = path.to_str().unwrap().to_string();

    let mut sim = sim();
    let source = instance(
        &mut sim,
        "sco",
        StreamType::Source,
        json!({"backing": "file", "filename": "speech", "seed": 8}),
    );
    let sink = instance(
        &mut sim,
        "sco",
        StreamType::Sink,
        json!({
            "backing": "file",
            "filename": filename,
            "sample_rate": 8000,
            "sample_width": 16,
            "stream": source.0
        }),
    );
    bring_up(&mut sim, source);
    bring_up(&mut sim, sink);
    sim.run_for(0.05).unwrap();

    for id in [sink, source] {
        sim.stop(id).unwrap();
        sim.destroy(id).unwrap();
    }
    assert_eq!(sim.context().sco_link_count(), 0);

    let wav = WavFile::open(&path).unwrap();
    assert_eq!(wav.get_audio_stream_sample_rate(0), Some(8000.0));
    assert_eq!(
        wav.get_audio_stream_data(0).unwrap(),
        speech().get_audio_stream_data(0).unwrap()
    );
    assert_eq!(sim.context().capture(&filename).map(<[Sample]>::len), Some(240));
}

proptest! {
    #[test]
    fn prop_bits_round_trip(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
        prop_assert_eq!(bits_to_bytes(&bytes_to_bits(&bytes)), bytes);
    }

    #[test]
    fn prop_samples_round_trip(samples in proptest::collection::vec(any::<i16>(), 0..64)) {
        let samples: Vec<Sample> = samples.into_iter().map(Sample::from).collect();
        prop_assert_eq!(bytes_to_samples(&samples_to_bytes(&samples)), samples);
    }
}
