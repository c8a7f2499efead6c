//! End-to-end runs of a decoder session against the loopback decoder.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use sp_common::{BufferType, DecodeError, DecodeStatus, VideoCodec};
use sp_decoder::bitstream::{escape_rbsp, unescape_rbsp, BitWriter, Sps};
use sp_decoder::platform::Release;
use sp_decoder::sim::LoopbackCodec;
use sp_decoder::{DecoderConfig, DecoderSession, DecoderStage, ManualClock};

const PPS: &[u8] = &[0x00, 0x00, 0x00, 0x01, 0x68, 0xCE, 0x3C, 0x80];
const IDR: &[u8] = &[0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x84, 0x00, 0x33];
const P_SLICE: &[u8] = &[0x00, 0x00, 0x00, 0x01, 0x41, 0x9A, 0x02];

/// 1280x720 High profile SPS without VUI.
fn high_profile_sps() -> Vec<u8> {
    let mut w = BitWriter::new();
    w.write_bits(100, 8);
    w.write_bits(0, 6);
    w.write_bits(0, 2);
    w.write_bits(40, 8);
    w.write_ue(0);
    // chroma_format_idc, bit depths, transform bypass, no scaling matrix
    w.write_ue(1);
    w.write_ue(0);
    w.write_ue(0);
    w.write_bit(false);
    w.write_bit(false);
    w.write_ue(0);
    w.write_ue(2);
    w.write_ue(4);
    w.write_bit(false);
    w.write_ue(79);
    w.write_ue(44);
    w.write_bit(true);
    w.write_bit(true);
    w.write_bit(false);
    w.write_bit(false);
    w.write_trailing_bits();

    let mut nal = vec![0x00, 0x00, 0x00, 0x01, 0x67];
    nal.extend_from_slice(&escape_rbsp(&w.into_bytes()));
    nal
}

fn parse_sps(nal: &[u8]) -> Sps {
    Sps::parse_rbsp(&unescape_rbsp(&nal[5..])).unwrap()
}

fn session_with(codec: &Arc<LoopbackCodec>, config: DecoderConfig) -> DecoderSession {
    let mut session = DecoderSession::create(
        codec.clone(),
        None,
        config,
        Arc::new(ManualClock::new(5_000_000)),
    )
    .unwrap();
    session.start().unwrap();
    session
}

fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn timestamps_strictly_increase_on_a_frozen_clock() {
    let codec = Arc::new(LoopbackCodec::new("c2.loopback.avc", 4, 4096));
    let session = session_with(&codec, DecoderConfig::default());

    assert_eq!(
        session.submit_decode_unit(&high_profile_sps(), BufferType::Sps, 0, 5_000),
        DecodeStatus::Ok
    );
    assert_eq!(session.submit_decode_unit(PPS, BufferType::Pps, 0, 5_000), DecodeStatus::Ok);
    for frame in 1..=10 {
        let data = if frame == 1 { IDR } else { P_SLICE };
        assert_eq!(
            session.submit_decode_unit(data, BufferType::PicData, frame, 5_000),
            DecodeStatus::Ok
        );
    }

    let queued = codec.queued_inputs();
    assert_eq!(queued.len(), 11);
    assert!(queued
        .windows(2)
        .all(|pair| pair[1].timestamp_us > pair[0].timestamp_us));
    assert_eq!(queued[0].timestamp_us, 5_000_000);
}

#[test]
fn non_adaptive_decoder_gets_config_for_every_pps() {
    let codec = Arc::new(LoopbackCodec::new("c2.loopback.avc", 4, 4096));
    let config = DecoderConfig {
        adaptive_playback: Some(false),
        ..DecoderConfig::default()
    };
    let session = session_with(&codec, config);
    let sps = high_profile_sps();

    for frame in [1, 2] {
        session.submit_decode_unit(&sps, BufferType::Sps, 0, 5_000);
        session.submit_decode_unit(PPS, BufferType::Pps, 0, 5_000);
        session.submit_decode_unit(IDR, BufferType::PicData, frame, 5_000);
    }

    let queued = codec.queued_inputs();
    let config_flags: Vec<bool> = queued.iter().map(|q| q.is_config()).collect();
    assert_eq!(config_flags, vec![true, false, true, false]);

    let blob = &queued[0].data;
    assert_eq!(&blob[..5], &[0x00, 0x00, 0x00, 0x01, 0x67]);
    assert!(blob.ends_with(PPS));

    // The cached SPS is the patched one: a single reference frame.
    let patched = parse_sps(&blob[..blob.len() - PPS.len()]);
    assert_eq!(patched.max_num_ref_frames, 1);
    assert_eq!(patched.profile_idc, 100);
}

#[test]
fn adaptive_decoder_fuses_parameter_sets_with_next_picture() {
    let vps: &[u8] = &[0x00, 0x00, 0x00, 0x01, 0x40, 0x01, 0x0C];
    let sps: &[u8] = &[0x00, 0x00, 0x00, 0x01, 0x42, 0x01, 0x01];
    let pps: &[u8] = &[0x00, 0x00, 0x00, 0x01, 0x44, 0x01, 0xC1];
    let pic: &[u8] = &[0x00, 0x00, 0x00, 0x01, 0x26, 0x01, 0xAF];

    let codec = Arc::new(LoopbackCodec::new("c2.loopback.hevc", 4, 4096));
    let config = DecoderConfig {
        codec: VideoCodec::H265,
        adaptive_playback: Some(true),
        ..DecoderConfig::default()
    };
    let session = session_with(&codec, config);

    for frame in [1, 2] {
        assert!(session.submit_decode_unit(vps, BufferType::Vps, 0, 5_000).is_ok());
        assert!(session.submit_decode_unit(sps, BufferType::Sps, 0, 5_000).is_ok());
        assert!(session.submit_decode_unit(pps, BufferType::Pps, 0, 5_000).is_ok());
        assert!(session
            .submit_decode_unit(pic, BufferType::PicData, frame, 5_000)
            .is_ok());
    }

    let queued = codec.queued_inputs();
    assert_eq!(queued.len(), 3);

    let config_blob = [vps, sps, pps].concat();
    assert!(queued[0].is_config());
    assert_eq!(queued[0].data, config_blob);

    assert!(!queued[1].is_config());
    assert_eq!(queued[1].data, pic);

    // Second round: one slot holding VPS, SPS, PPS and the picture.
    assert!(!queued[2].is_config());
    assert_eq!(queued[2].data, [vps, sps, pps, pic].concat());
}

#[test]
fn intel_decoder_receives_baseline_sps_then_replay() {
    let codec = Arc::new(LoopbackCodec::new("OMX.Intel.hw_vd.h264", 4, 4096));
    let session = session_with(&codec, DecoderConfig::default());
    assert!(session.quirks().needs_baseline_sps_hack);

    session.submit_decode_unit(&high_profile_sps(), BufferType::Sps, 0, 5_000);
    session.submit_decode_unit(PPS, BufferType::Pps, 0, 5_000);

    let queued = codec.queued_inputs();
    assert_eq!(queued.len(), 2);
    assert!(queued.iter().all(|q| q.is_config()));

    let blob = &queued[0].data;
    let hacked = parse_sps(&blob[..blob.len() - PPS.len()]);
    assert_eq!(hacked.profile_idc, 66);

    let replay = parse_sps(&queued[1].data);
    assert_eq!(replay.profile_idc, 100);
    assert!(replay.constraint_set_flags[4]);
    assert!(replay.constraint_set_flags[5]);
    assert!(queued[1].timestamp_us > queued[0].timestamp_us);

    // The replay happens only once.
    session.submit_decode_unit(PPS, BufferType::Pps, 0, 5_000);
    assert_eq!(codec.queued_inputs().len(), 3);
}

#[test]
fn configure_failure_returns_no_session() {
    let codec = Arc::new(LoopbackCodec::new("c2.loopback.avc", 4, 4096).with_configure_error("no surface"));
    let err = DecoderSession::create(
        codec.clone(),
        None,
        DecoderConfig::default(),
        Arc::new(ManualClock::new(0)),
    )
    .unwrap_err();

    match err {
        DecodeError::DecoderInit { codec, reason } => {
            assert_eq!(codec, VideoCodec::H264);
            assert!(reason.contains("no surface"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!codec.is_started());
}

#[test]
fn invalid_config_is_rejected_before_configure() {
    let codec = Arc::new(LoopbackCodec::new("c2.loopback.avc", 4, 4096));
    let config = DecoderConfig {
        input_slots: 0,
        ..DecoderConfig::default()
    };
    let err = DecoderSession::create(codec.clone(), None, config, Arc::new(ManualClock::new(0)))
        .unwrap_err();
    assert!(matches!(err, DecodeError::InvalidConfig(_)));
    assert!(codec.configured_format().is_none());
}

#[test]
fn polling_frames_are_released_and_counted() {
    let codec = Arc::new(LoopbackCodec::new("c2.loopback.avc", 4, 4096));
    let session = session_with(&codec, DecoderConfig::default());

    session.submit_decode_unit(&high_profile_sps(), BufferType::Sps, 0, 5_000);
    session.submit_decode_unit(PPS, BufferType::Pps, 0, 5_000);
    for frame in 1..=5 {
        session.submit_decode_unit(IDR, BufferType::PicData, frame, 5_000);
    }

    wait_until("all frames released", || codec.releases().len() == 5);
    wait_until("rendered count", || session.stats().active.rendered >= 1);

    let releases = codec.releases();
    assert!(releases.iter().any(|(_, release)| *release == Release::Render));

    let stats = session.stats();
    assert_eq!(stats.active.received, 5);
    assert!(stats.immediate_release);
    assert_eq!(stats.stages.frames_in, 5);
}

#[test]
fn sustained_headroom_switches_to_scheduled_release_once() {
    let codec = Arc::new(LoopbackCodec::new("c2.loopback.avc", 4, 4096));
    let clock = Arc::new(ManualClock::new(5_000_000));
    let mut session =
        DecoderSession::create(codec.clone(), None, DecoderConfig::default(), clock.clone())
            .unwrap();
    session.start().unwrap();

    session.submit_decode_unit(&high_profile_sps(), BufferType::Sps, 0, 5_000);
    session.submit_decode_unit(PPS, BufferType::Pps, 0, 5_000);
    // 60 Hz with 3 s of hysteresis: picture 182 is the first released on a
    // schedule. The frozen clock keeps every decode sample at 0 ms.
    for frame in 1..=250 {
        let data = if frame == 1 { IDR } else { P_SLICE };
        assert_eq!(
            session.submit_decode_unit(data, BufferType::PicData, frame, 5_000),
            DecodeStatus::Ok
        );
    }

    wait_until("all frames released", || codec.releases().len() == 250);

    let stats = session.stats();
    assert!(!stats.immediate_release);
    assert_eq!(stats.release_mode_changes, 1);

    let deadlines: Vec<i64> = codec
        .releases()
        .iter()
        .filter_map(|(_, release)| match release {
            Release::RenderAt { timestamp_ns } => Some(*timestamp_ns),
            _ => None,
        })
        .collect();
    assert!(deadlines.len() >= 69, "only {} scheduled releases", deadlines.len());
    assert!(deadlines.windows(2).all(|w| w[0] < w[1]));

    let first = Release::RenderAt {
        timestamp_ns: deadlines[0],
    };
    assert!(codec.render_delay(first).unwrap() > Duration::ZERO);
}

#[test]
fn callback_mode_end_to_end() {
    let codec = Arc::new(LoopbackCodec::new("c2.loopback.avc", 3, 4096));
    let config = DecoderConfig {
        callback_mode: true,
        ..DecoderConfig::default()
    };
    let session = session_with(&codec, config);

    session.submit_decode_unit(&high_profile_sps(), BufferType::Sps, 0, 5_000);
    session.submit_decode_unit(PPS, BufferType::Pps, 0, 5_000);
    for frame in 1..=8 {
        assert_eq!(
            session.submit_decode_unit(P_SLICE, BufferType::PicData, frame, 5_000),
            DecodeStatus::Ok
        );
    }

    // Every output comes back, rendered or dropped as stale.
    wait_until("all outputs returned", || codec.releases().len() == 8);
    assert!(codec
        .releases()
        .iter()
        .any(|(_, release)| release.renders()));
    wait_until("output format", || {
        session.stats().stages.output_format_seen
    });
}

#[test]
fn callback_mode_falls_back_to_polling() {
    let codec = Arc::new(LoopbackCodec::new("c2.loopback.avc", 2, 4096).polling_only());
    let config = DecoderConfig {
        callback_mode: true,
        ..DecoderConfig::default()
    };
    let session = session_with(&codec, config);

    assert!(session
        .submit_decode_unit(IDR, BufferType::PicData, 1, 5_000)
        .is_ok());
    wait_until("frame released", || codec.releases().len() == 1);
}

#[test]
fn stop_rejects_input_and_tears_down_once() {
    let codec = Arc::new(LoopbackCodec::new("c2.loopback.avc", 4, 4096));
    let session = session_with(&codec, DecoderConfig::default());

    let teardowns = Arc::new(AtomicUsize::new(0));
    let counter = teardowns.clone();
    session.on_teardown(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    session.stop();
    assert!(session.is_stopping());
    assert_eq!(
        session.submit_decode_unit(IDR, BufferType::PicData, 1, 5_000),
        DecodeStatus::NeedKeyframe
    );

    session.release();
    assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    assert!(codec.is_released());
    assert!(codec.queued_inputs().is_empty());
}

#[test]
fn dropping_a_session_releases_the_decoder() {
    let codec = Arc::new(LoopbackCodec::new("c2.loopback.avc", 4, 4096));
    {
        let session = session_with(&codec, DecoderConfig::default());
        session.submit_decode_unit(IDR, BufferType::PicData, 1, 5_000);
    }
    assert!(codec.is_released());
}

#[test]
fn frame_gaps_are_counted_as_loss() {
    let codec = Arc::new(LoopbackCodec::new("c2.loopback.avc", 4, 4096));
    let session = session_with(&codec, DecoderConfig::default());

    for frame in [1, 2, 3, 6, 7] {
        session.submit_decode_unit(P_SLICE, BufferType::PicData, frame, 5_000);
    }

    let stats = session.stats();
    assert_eq!(stats.active.received, 5);
    assert_eq!(stats.active.frames_lost, 2);
    assert_eq!(stats.active.loss_events, 1);
    assert_eq!(stats.active.total_frames, 7);
}

#[test]
fn overlay_and_diagnostics_follow_the_stream() {
    let codec = Arc::new(LoopbackCodec::new("c2.loopback.avc", 4, 4096));
    let session = session_with(&codec, DecoderConfig::default());

    assert_eq!(session.diagnostics().stage, DecoderStage::PreSps);
    session.submit_decode_unit(&high_profile_sps(), BufferType::Sps, 0, 5_000);
    assert_eq!(session.diagnostics().stage, DecoderStage::PrePps);
    session.submit_decode_unit(PPS, BufferType::Pps, 0, 5_000);
    assert_eq!(session.diagnostics().stage, DecoderStage::PreIFrame);

    session.submit_decode_unit(IDR, BufferType::PicData, 1, 5_000);
    wait_until("first frame out", || {
        session.diagnostics().stage == DecoderStage::EarlyOutput
    });

    let report = session.diagnostics().to_string();
    assert!(report.contains("EarlyOutputError"));
    assert!(report.contains("c2.loopback.avc"));

    assert_eq!(
        session.format_info("{decoder} {resolution}"),
        "c2.loopback.avc 1920x1080"
    );
}
