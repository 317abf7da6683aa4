//! Integration tests for the live and playback pipelines.

use manifold::config::{PlaybackConfig, StreamConfig, TerminalConfig};
use manifold::motion::MotionConfig;
use manifold::pipeline::{LivePipeline, PipelineState, PlaybackPipeline, RecordPolicy};
use manifold::shmem::ExportReader;
use manifold::testing::{
    encoded_frame, CaptureRecorder, CaptureRender, CollectHandle, DecoderProbe, LoopbackDecoder,
    SourceProbe, StubSource,
};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const W: u32 = 8;
const H: u32 = 8;

fn test_config(slot: usize, id: i64) -> StreamConfig {
    StreamConfig::new(format!("rtsp://cam{slot}.local/stream"), slot, id)
        .with_terminal(TerminalConfig {
            n_slots: 4,
            width: W,
            height: H,
        })
        .with_motion(MotionConfig {
            interval: Duration::ZERO,
            threshold: 0.0,
            duration: Duration::from_millis(30_000),
        })
}

struct Rig {
    pipeline: Arc<LivePipeline>,
    source: Arc<SourceProbe>,
    decoder: Arc<DecoderProbe>,
    renders: Vec<CollectHandle>,
}

fn make_rig(cfg: StreamConfig) -> Rig {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let (source, source_probe) = StubSource::new();
    let (decoder, decoder_probe) = LoopbackDecoder::new(W, H);
    let render_a = CaptureRender::new();
    let render_b = CaptureRender::new();
    let renders = vec![render_a.handle(), render_b.handle()];

    let pipeline = LivePipeline::new(
        cfg,
        Box::new(source),
        Box::new(decoder),
        vec![Box::new(render_a), Box::new(render_b)],
    )
    .expect("pipeline construction");

    Rig {
        pipeline,
        source: source_probe,
        decoder: decoder_probe,
        renders,
    }
}

#[test]
fn test_export_client_reference_counting() {
    let rig = make_rig(test_config(1, 10));
    let p = &rig.pipeline;

    assert!(!p.analysis_attached());
    assert!(!p.export_gate_open());

    // first client activates the whole cascade
    p.add_export_client(1);
    assert!(p.analysis_attached());
    assert!(p.export_gate_open());
    assert_eq!(p.export_clients(), 1);
    assert_eq!(p.analysis_clients(), 1);
    assert_eq!(p.decode_clients(), 1);
    assert!(rig.decoder.decoding.load(Ordering::SeqCst));

    // second client only counts
    p.add_export_client(1);
    assert_eq!(p.export_clients(), 2);
    assert!(p.export_gate_open());

    // branch deactivates only after the last client leaves
    p.add_export_client(-1);
    assert!(p.export_gate_open());
    assert!(p.analysis_attached());

    p.add_export_client(-1);
    assert!(!p.export_gate_open());
    assert!(!p.analysis_attached());
    assert_eq!(p.decode_clients(), 0);
    assert!(!rig.decoder.decoding.load(Ordering::SeqCst));
}

#[test]
fn test_underflow_is_clamped() {
    let rig = make_rig(test_config(1, 11));
    rig.pipeline.add_decode_client(-1);
    assert_eq!(rig.pipeline.decode_clients(), 0);
    // state stays usable after the bad call
    rig.pipeline.add_decode_client(1);
    assert_eq!(rig.pipeline.decode_clients(), 1);
    assert!(rig.decoder.decoding.load(Ordering::SeqCst));
}

#[test]
fn test_export_terminals_are_distinct_and_idempotent() {
    let rig = make_rig(test_config(2, 20));
    let p = &rig.pipeline;

    let t1 = p.acquire_export_terminal().unwrap();
    let t2 = p.acquire_export_terminal().unwrap();
    assert_ne!(t1.name, t2.name);
    assert_eq!(p.export_clients(), 2);

    // releasing one leaves the other attached and the branch active
    assert!(p.release_export_terminal(&t1.name));
    assert_eq!(p.export_clients(), 1);
    assert!(p.export_gate_open());
    assert!(p.terminal_handle(&t2.name).is_some());
    assert!(p.terminal_handle(&t1.name).is_none());

    // double release is a logged no-op, not a double decrement
    assert!(!p.release_export_terminal(&t1.name));
    assert_eq!(p.export_clients(), 1);

    assert!(p.release_export_terminal(&t2.name));
    assert_eq!(p.export_clients(), 0);
    assert!(!p.export_gate_open());
}

#[test]
fn test_recording_always() {
    let rig = make_rig(test_config(3, 30));
    let p = &rig.pipeline;
    let (recorder, probe) = CaptureRecorder::new();
    let recorder = Arc::new(Mutex::new(recorder));

    p.set_recording(RecordPolicy::Always, recorder, 42).unwrap();
    assert!(p.record_gate_open());
    // no analysis side effect under "always"
    assert_eq!(p.analysis_clients(), 0);
    assert_eq!(probe.inputs.lock().unwrap().as_slice(), &[(42, 3)]);

    // recorded frames are the raw source frames, not decoded ones
    rig.source.deliver(encoded_frame(0));
    rig.source.deliver(encoded_frame(1));
    assert_eq!(probe.sequences(), vec![0, 1]);

    p.clear_recording().unwrap();
    assert!(!p.record_gate_open());
    assert!(!p.is_recording());
    assert_eq!(probe.cleared.lock().unwrap().as_slice(), &[3]);
    assert_eq!(p.analysis_clients(), 0);

    // gate closed again: nothing more is recorded
    rig.source.deliver(encoded_frame(2));
    assert_eq!(probe.frame_count(), 2);
}

#[test]
fn test_recording_on_movement_follows_events() {
    let rig = make_rig(test_config(4, 40));
    let p = &rig.pipeline;
    let (recorder, _probe) = CaptureRecorder::new();

    p.set_recording(RecordPolicy::OnMovement, Arc::new(Mutex::new(recorder)), 7)
        .unwrap();
    assert_eq!(p.analysis_clients(), 1);
    assert!(p.analysis_attached());
    assert!(!p.record_gate_open());

    p.motion_event(true, Duration::from_millis(1000));
    assert!(p.record_gate_open());

    p.motion_event(false, Duration::from_millis(2000));
    assert!(!p.record_gate_open());

    p.clear_recording().unwrap();
    assert_eq!(p.analysis_clients(), 0);
    assert!(!p.analysis_attached());
}

#[test]
fn test_recording_never_keeps_gate_shut() {
    let rig = make_rig(test_config(5, 50));
    let p = &rig.pipeline;
    let (recorder, probe) = CaptureRecorder::new();

    p.set_recording(RecordPolicy::Never, Arc::new(Mutex::new(recorder)), 9)
        .unwrap();
    assert!(p.is_recording());
    assert!(!p.record_gate_open());
    assert_eq!(probe.inputs.lock().unwrap().as_slice(), &[(9, 5)]);

    p.motion_event(true, Duration::from_millis(100));
    assert!(!p.record_gate_open());

    rig.source.deliver(encoded_frame(0));
    assert_eq!(probe.frame_count(), 0);

    p.clear_recording().unwrap();
    assert_eq!(probe.cleared.lock().unwrap().as_slice(), &[5]);
}

#[test]
fn test_second_recording_replaces_first() {
    let rig = make_rig(test_config(6, 60));
    let p = &rig.pipeline;
    let (first, first_probe) = CaptureRecorder::new();
    let (second, second_probe) = CaptureRecorder::new();

    p.set_recording(RecordPolicy::Always, Arc::new(Mutex::new(first)), 1)
        .unwrap();
    assert!(p.record_gate_open());

    // replacing with on-movement must leave exactly the second call's
    // effects: gate closed until an event, one analysis client
    p.set_recording(RecordPolicy::OnMovement, Arc::new(Mutex::new(second)), 2)
        .unwrap();
    assert!(!p.record_gate_open());
    assert_eq!(p.analysis_clients(), 1);
    assert_eq!(first_probe.cleared.lock().unwrap().as_slice(), &[6]);
    assert_eq!(second_probe.inputs.lock().unwrap().as_slice(), &[(2, 6)]);

    p.clear_recording().unwrap();
    assert_eq!(p.analysis_clients(), 0);
}

#[test]
fn test_presentation_clients_route_frames() {
    let rig = make_rig(test_config(7, 70));
    let p = &rig.pipeline;

    p.add_presentation_client(0, 1).unwrap();
    assert_eq!(p.presentation_clients(0), 1);
    assert_eq!(p.decode_clients(), 1);

    rig.source.deliver(encoded_frame(0));
    rig.source.deliver(encoded_frame(1));
    rig.decoder.pump();

    assert_eq!(rig.renders[0].sequences(), vec![0, 1]);
    assert_eq!(rig.renders[1].count(), 0);

    // second display joins mid-stream and only sees later frames
    p.add_presentation_client(1, 1).unwrap();
    rig.source.deliver(encoded_frame(2));
    rig.decoder.pump();
    assert_eq!(rig.renders[0].sequences(), vec![0, 1, 2]);
    assert_eq!(rig.renders[1].sequences(), vec![2]);

    p.add_presentation_client(0, -1).unwrap();
    rig.source.deliver(encoded_frame(3));
    rig.decoder.pump();
    assert_eq!(rig.renders[0].sequences(), vec![0, 1, 2]);
    assert_eq!(rig.renders[1].sequences(), vec![2, 3]);

    assert!(p.add_presentation_client(5, 1).is_err());
}

#[test]
fn test_export_terminal_end_to_end() {
    let rig = make_rig(test_config(8, 80));
    let p = &rig.pipeline;

    let handle = p.acquire_export_terminal().unwrap();
    let reader = ExportReader::open(&handle).unwrap();

    rig.source.deliver(encoded_frame(5));
    rig.decoder.pump();

    assert_eq!(reader.written(), 1);
    let (meta, payload) = reader.latest().unwrap();
    assert_eq!(meta.sequence, 5);
    assert_eq!(meta.width, W);
    assert_eq!(meta.height, H);
    assert_eq!(payload.len(), (W * H * 3) as usize);

    // the reader's mapping outlives the terminal
    p.release_export_terminal(&handle.name);
    assert_eq!(reader.written(), 1);
}

#[test]
fn test_internal_motion_detector_drives_record_gate() {
    let cfg = test_config(9, 90).with_motion(MotionConfig {
        interval: Duration::ZERO,
        threshold: 0.05,
        duration: Duration::from_millis(100),
    });
    let rig = make_rig(cfg);
    let p = &rig.pipeline;
    let (recorder, _probe) = CaptureRecorder::new();

    p.set_recording(RecordPolicy::OnMovement, Arc::new(Mutex::new(recorder)), 3)
        .unwrap();
    let events = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&events);
    p.on_motion(move |event| log.lock().unwrap().push(event));

    // two static frames, then a hard luma jump
    rig.source.deliver(encoded_frame(0));
    rig.source.deliver(encoded_frame(1));
    rig.decoder.pump();
    assert!(!p.record_gate_open());

    rig.source.deliver(encoded_frame(200)); // payload fill jumps 1 -> 200
    rig.decoder.pump();
    assert!(p.record_gate_open());

    // quiet frames past the window close it again
    rig.source.deliver(encoded_frame(201));
    rig.source.deliver(encoded_frame(210)); // 400 ms after the movement
    rig.decoder.pump();
    assert!(!p.record_gate_open());

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 2);
    assert!(events[0].start);
    assert!(!events[1].start);
}

#[test]
fn test_close_releases_everything() {
    let rig = make_rig(test_config(10, 100));
    let p = &rig.pipeline;
    let (recorder, probe) = CaptureRecorder::new();

    p.add_presentation_client(0, 1).unwrap();
    p.acquire_export_terminal().unwrap();
    p.set_recording(RecordPolicy::Always, Arc::new(Mutex::new(recorder)), 1)
        .unwrap();

    p.request_close();
    assert_eq!(p.state(), PipelineState::Closing);
    assert!(rig.source.stop_requested());
    assert!(rig.decoder.stop_requested.load(Ordering::SeqCst));
    assert!(!p.is_recording());
    assert_eq!(probe.cleared.lock().unwrap().as_slice(), &[10]);
    assert_eq!(p.export_clients(), 0);
    assert_eq!(p.presentation_clients(0), 0);
    assert_eq!(p.decode_clients(), 0);

    p.wait_close().unwrap();
    assert_eq!(p.state(), PipelineState::Closed);
    assert!(rig.source.wait_done_at.lock().unwrap().is_some());

    // terminal acquisition after close is refused
    assert!(p.acquire_export_terminal().is_err());
    // and a second close is a no-op
    p.wait_close().unwrap();
}

#[test]
fn test_failed_source_start_unwinds_to_closed() {
    let (source, _probe) = StubSource::new();
    let source = source.with_failing_start();
    let (decoder, decoder_probe) = LoopbackDecoder::new(W, H);

    let result = LivePipeline::new(
        test_config(11, 110),
        Box::new(source),
        Box::new(decoder),
        vec![],
    );
    assert!(result.is_err());
    // the already-started decoder was stopped during the unwind
    assert!(decoder_probe.stop_requested.load(Ordering::SeqCst));
}

#[test]
fn test_playback_pipeline_decode_and_presentation() {
    let (decoder, decoder_probe) = LoopbackDecoder::new(W, H);
    let render = CaptureRender::new();
    let frames = render.handle();

    let p = PlaybackPipeline::new(
        PlaybackConfig::new(12, 120),
        Box::new(decoder),
        vec![Box::new(render)],
    )
    .unwrap();

    p.add_presentation_client(0, 1).unwrap();
    assert_eq!(p.decode_clients(), 1);
    assert!(decoder_probe.decoding.load(Ordering::SeqCst));

    // the external cacher feeds frames through the input handle
    let input = p.input();
    input.deliver(encoded_frame(0));
    input.deliver(encoded_frame(1));
    decoder_probe.pump();
    assert_eq!(frames.sequences(), vec![0, 1]);

    p.add_presentation_client(0, -1).unwrap();
    assert_eq!(p.decode_clients(), 0);
    assert!(!decoder_probe.decoding.load(Ordering::SeqCst));

    p.close().unwrap();
    assert_eq!(p.state(), PipelineState::Closed);
    // frames delivered after close are silently dropped
    input.deliver(encoded_frame(2));
    assert_eq!(frames.count(), 2);
}
