//! SPS rewriting for hardware decoder compatibility.
//!
//! [`patch_sps`] is a pure function of the input NAL and the
//! [`SpsPatchOptions`]; the same inputs always produce the same bytes. The
//! start code and NAL header are copied through unchanged, only the RBSP is
//! re-serialized.

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use sp_common::Resolution;

use super::bits::{escape_rbsp, unescape_rbsp};
use super::sps::{BitstreamRestriction, Sps, Vui};
use super::{BitstreamError, NAL_PREFIX_LEN, SPS_NAL_HEADER, START_CODE};

/// High profile.
pub const PROFILE_HIGH: u8 = 100;
/// Baseline profile.
pub const PROFILE_BASELINE: u8 = 66;

/// Decoder-dependent switches for [`patch_sps`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpsPatchOptions {
    /// Initial stream resolution, used to pick the level.
    pub resolution: Resolution,
    /// Display refresh rate in Hz.
    pub refresh_rate: u32,
    /// Reference frame invalidation needs the host's level and ref count.
    pub ref_frame_invalidation: bool,
    /// Drop the video signal, colour description and chroma location VUI groups.
    pub strip_vui_extensions: bool,
    /// Add or patch the bitstream restriction block; when false it is removed.
    pub bitstream_restrictions: bool,
    /// Mark High profile streams as Constrained High (no B-frames).
    pub constrained_high_profile: bool,
    /// Advertise Baseline profile to the decoder and replay the real SPS later.
    pub baseline_hack: bool,
}

/// Output of [`patch_sps`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PatchedSps {
    /// Start code, NAL header and patched, escaped RBSP.
    pub nal: Vec<u8>,
    /// The SPS as it was before the baseline hack, when the hack was applied.
    pub saved: Option<Sps>,
}

/// Lowest `level_idc` that covers the resolution/refresh tier, if one is known.
pub fn level_for(resolution: Resolution, refresh_rate: u32) -> Option<u8> {
    if refresh_rate > 60 {
        return None;
    }
    if resolution.fits_within(Resolution::SD) {
        Some(31)
    } else if resolution.fits_within(Resolution::HD) {
        Some(32)
    } else if resolution.fits_within(Resolution::FHD) {
        Some(42)
    } else {
        None
    }
}

/// Set constraint_set4/5 for Constrained High, clear them for everything else.
pub fn apply_profile_constraints(sps: &mut Sps, constrained_high: bool) {
    let set = sps.profile_idc == PROFILE_HIGH && constrained_high;
    sps.constraint_set_flags[4] = set;
    sps.constraint_set_flags[5] = set;
}

/// Parse, patch and re-serialize an Annex-B SPS NAL.
///
/// # Arguments
/// * `nal` - 4-byte start code, the `0x67` header byte, then the escaped SPS payload.
/// * `opts` - Decoder-dependent switches.
///
/// # Errors
/// Returns `BitstreamError::MissingStartCode` or `BitstreamError::NotSps` if
/// the framing precondition does not hold, or a parse error from [`Sps::parse_rbsp`].
pub fn patch_sps(nal: &[u8], opts: &SpsPatchOptions) -> Result<PatchedSps, BitstreamError> {
    if nal.len() < NAL_PREFIX_LEN || nal[..START_CODE.len()] != START_CODE {
        return Err(BitstreamError::MissingStartCode);
    }
    let header = nal[START_CODE.len()];
    if header != SPS_NAL_HEADER {
        return Err(BitstreamError::NotSps { header });
    }

    let rbsp = unescape_rbsp(&nal[NAL_PREFIX_LEN..]);
    let mut sps = Sps::parse_rbsp(&rbsp)?;

    if !opts.ref_frame_invalidation {
        if let Some(level) = level_for(opts.resolution, opts.refresh_rate) {
            debug!(from = sps.level_idc, to = level, "Patching level_idc");
            sps.level_idc = level;
        }
        sps.max_num_ref_frames = 1;
    }

    if opts.strip_vui_extensions {
        if let Some(vui) = sps.vui.as_mut() {
            vui.video_signal_type = None;
            vui.chroma_loc_info = None;
        }
    }

    if opts.bitstream_restrictions {
        let num_ref_frames = sps.max_num_ref_frames;
        let vui = sps.vui.get_or_insert_with(Vui::default);
        let restriction = vui.bitstream_restriction.get_or_insert_with(|| {
            trace!("Adding bitstream restrictions");
            BitstreamRestriction {
                motion_vectors_over_pic_boundaries_flag: true,
                log2_max_mv_length_horizontal: 16,
                log2_max_mv_length_vertical: 16,
                max_num_reorder_frames: 0,
                ..BitstreamRestriction::default()
            }
        });
        restriction.max_dec_frame_buffering = num_ref_frames;
        restriction.max_bytes_per_pic_denom = 2;
        restriction.max_bits_per_mb_denom = 1;
    } else if let Some(vui) = sps.vui.as_mut() {
        vui.bitstream_restriction = None;
    }

    apply_profile_constraints(&mut sps, opts.constrained_high_profile);

    let saved = if opts.baseline_hack {
        trace!("Hacking SPS to baseline");
        let saved = sps.clone();
        sps.profile_idc = PROFILE_BASELINE;
        Some(saved)
    } else {
        None
    };

    let mut out = Vec::with_capacity(nal.len() + 8);
    out.extend_from_slice(&nal[..NAL_PREFIX_LEN]);
    out.extend_from_slice(&escape_rbsp(&sps.write_rbsp()));

    Ok(PatchedSps { nal: out, saved })
}

/// Build the codec-config NAL that restores the real profile after the baseline hack.
pub fn replay_sps_nal(saved: &Sps, constrained_high: bool) -> Vec<u8> {
    let mut sps = saved.clone();
    sps.profile_idc = PROFILE_HIGH;
    apply_profile_constraints(&mut sps, constrained_high);

    let mut out = Vec::with_capacity(NAL_PREFIX_LEN + 32);
    out.extend_from_slice(&START_CODE);
    out.push(SPS_NAL_HEADER);
    out.extend_from_slice(&escape_rbsp(&sps.write_rbsp()));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitstream::sps::tests::sample_high_sps;

    fn nal_for(sps: &Sps) -> Vec<u8> {
        let mut nal = vec![0x00, 0x00, 0x00, 0x01, SPS_NAL_HEADER];
        nal.extend_from_slice(&escape_rbsp(&sps.write_rbsp()));
        nal
    }

    fn parse_nal(nal: &[u8]) -> Sps {
        Sps::parse_rbsp(&unescape_rbsp(&nal[NAL_PREFIX_LEN..])).unwrap()
    }

    fn hd_options() -> SpsPatchOptions {
        SpsPatchOptions {
            resolution: Resolution::HD,
            refresh_rate: 60,
            ..SpsPatchOptions::default()
        }
    }

    #[test]
    fn level_breakpoints() {
        assert_eq!(level_for(Resolution::SD, 60), Some(31));
        assert_eq!(level_for(Resolution::HD, 60), Some(32));
        assert_eq!(level_for(Resolution::FHD, 30), Some(42));
        assert_eq!(level_for(Resolution::FHD, 120), None);
        assert_eq!(level_for(Resolution::UHD, 60), None);
    }

    #[test]
    fn clamps_level_and_reference_frames() {
        let nal = nal_for(&sample_high_sps());
        let patched = patch_sps(&nal, &hd_options()).unwrap();
        let sps = parse_nal(&patched.nal);
        assert_eq!(sps.level_idc, 32);
        assert_eq!(sps.max_num_ref_frames, 1);
        assert!(patched.saved.is_none());
        assert_eq!(&patched.nal[..5], &nal[..5]);
    }

    #[test]
    fn ref_frame_invalidation_keeps_level() {
        let nal = nal_for(&sample_high_sps());
        let opts = SpsPatchOptions {
            ref_frame_invalidation: true,
            ..hd_options()
        };
        let sps = parse_nal(&patch_sps(&nal, &opts).unwrap().nal);
        assert_eq!(sps.level_idc, 51);
        assert_eq!(sps.max_num_ref_frames, 4);
    }

    #[test]
    fn strips_vui_extensions() {
        let nal = nal_for(&sample_high_sps());
        let opts = SpsPatchOptions {
            strip_vui_extensions: true,
            ..hd_options()
        };
        let sps = parse_nal(&patch_sps(&nal, &opts).unwrap().nal);
        let vui = sps.vui.unwrap();
        assert!(vui.video_signal_type.is_none());
        assert!(vui.chroma_loc_info.is_none());
        assert!(vui.timing_info.is_some());
    }

    #[test]
    fn bitstream_restrictions_patched_or_removed() {
        let nal = nal_for(&sample_high_sps());

        let opts = SpsPatchOptions {
            bitstream_restrictions: true,
            ..hd_options()
        };
        let sps = parse_nal(&patch_sps(&nal, &opts).unwrap().nal);
        let br = sps.vui.unwrap().bitstream_restriction.unwrap();
        assert_eq!(br.max_dec_frame_buffering, 1);
        assert_eq!(br.max_bytes_per_pic_denom, 2);
        assert_eq!(br.max_bits_per_mb_denom, 1);
        // Existing motion vector limits are left alone.
        assert_eq!(br.log2_max_mv_length_horizontal, 11);

        let sps = parse_nal(&patch_sps(&nal, &hd_options()).unwrap().nal);
        assert!(sps.vui.unwrap().bitstream_restriction.is_none());
    }

    #[test]
    fn adds_vui_when_missing() {
        let mut source = sample_high_sps();
        source.vui = None;
        let opts = SpsPatchOptions {
            bitstream_restrictions: true,
            ..hd_options()
        };
        let sps = parse_nal(&patch_sps(&nal_for(&source), &opts).unwrap().nal);
        let br = sps.vui.unwrap().bitstream_restriction.unwrap();
        assert!(br.motion_vectors_over_pic_boundaries_flag);
        assert_eq!(br.log2_max_mv_length_horizontal, 16);
        assert_eq!(br.log2_max_mv_length_vertical, 16);
        assert_eq!(br.max_num_reorder_frames, 0);
        assert_eq!(br.max_dec_frame_buffering, 1);
    }

    #[test]
    fn constraint_flags_follow_profile() {
        let mut source = sample_high_sps();
        source.constraint_set_flags[4] = true;

        let sps = parse_nal(&patch_sps(&nal_for(&source), &hd_options()).unwrap().nal);
        assert!(!sps.constraint_set_flags[4]);
        assert!(!sps.constraint_set_flags[5]);

        let opts = SpsPatchOptions {
            constrained_high_profile: true,
            ..hd_options()
        };
        let sps = parse_nal(&patch_sps(&nal_for(&source), &opts).unwrap().nal);
        assert!(sps.constraint_set_flags[4]);
        assert!(sps.constraint_set_flags[5]);
    }

    #[test]
    fn baseline_hack_saves_real_sps_for_replay() {
        let opts = SpsPatchOptions {
            baseline_hack: true,
            constrained_high_profile: true,
            ..hd_options()
        };
        let patched = patch_sps(&nal_for(&sample_high_sps()), &opts).unwrap();
        assert_eq!(parse_nal(&patched.nal).profile_idc, PROFILE_BASELINE);

        let saved = patched.saved.unwrap();
        assert_eq!(saved.profile_idc, PROFILE_HIGH);
        assert_eq!(saved.max_num_ref_frames, 1);

        let replay = replay_sps_nal(&saved, true);
        assert_eq!(&replay[..5], &[0x00, 0x00, 0x00, 0x01, 0x67]);
        let replayed = parse_nal(&replay);
        assert_eq!(replayed.profile_idc, PROFILE_HIGH);
        assert!(replayed.constraint_set_flags[4]);
        assert_eq!(replayed.level_idc, 32);
    }

    #[test]
    fn patching_is_deterministic_and_idempotent() {
        let nal = nal_for(&sample_high_sps());
        let opts = SpsPatchOptions {
            bitstream_restrictions: true,
            strip_vui_extensions: true,
            constrained_high_profile: true,
            ..hd_options()
        };
        let once = patch_sps(&nal, &opts).unwrap();
        let again = patch_sps(&nal, &opts).unwrap();
        assert_eq!(once, again);

        let twice = patch_sps(&once.nal, &opts).unwrap();
        assert_eq!(twice.nal, once.nal);
    }

    #[test]
    fn rejects_bad_framing() {
        assert_eq!(
            patch_sps(&[0x00, 0x00, 0x01, 0x67, 0x64], &hd_options()),
            Err(BitstreamError::MissingStartCode)
        );
        assert_eq!(
            patch_sps(&[0x00, 0x00, 0x00, 0x01, 0x68, 0xCE], &hd_options()),
            Err(BitstreamError::NotSps { header: 0x68 })
        );
    }
}
