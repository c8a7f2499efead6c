//! Sequence parameter set syntax model.
//!
//! Covers `seq_parameter_set_data()` and `vui_parameters()` from H.264
//! clause 7.3.2.1 / E.1.1. Every field that is present in the bitstream is
//! retained so that [`Sps::write_rbsp`] reproduces an unmodified SPS bit for
//! bit. Scaling lists keep their raw `delta_scale` values for the same reason.
//!
//! Optional syntax groups are modelled as `Option`s, which means a group is
//! either fully present or fully absent; there is no way to write a
//! half-populated bitstream restriction block.

use super::bits::{BitReader, BitWriter};
use super::BitstreamError;

/// `profile_idc` values whose SPS carries the chroma/bit-depth extension.
const HIGH_PROFILES: [u8; 13] = [100, 110, 122, 244, 44, 83, 86, 118, 128, 138, 139, 134, 135];

/// `aspect_ratio_idc` value signalling an explicit SAR.
const EXTENDED_SAR: u8 = 255;

// ---------------------------------------------------------------------------
// Syntax structures
// ---------------------------------------------------------------------------

/// A parsed H.264 sequence parameter set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sps {
    pub profile_idc: u8,
    /// `constraint_set0_flag` through `constraint_set5_flag`.
    pub constraint_set_flags: [bool; 6],
    pub reserved_zero_2bits: u8,
    pub level_idc: u8,
    pub seq_parameter_set_id: u32,
    /// Present only for the high profiles.
    pub high_profile: Option<HighProfileInfo>,
    pub log2_max_frame_num_minus4: u32,
    pub pic_order_cnt: PicOrderCnt,
    pub max_num_ref_frames: u32,
    pub gaps_in_frame_num_value_allowed_flag: bool,
    pub pic_width_in_mbs_minus1: u32,
    pub pic_height_in_map_units_minus1: u32,
    pub frame_mbs_only_flag: bool,
    pub mb_adaptive_frame_field_flag: bool,
    pub direct_8x8_inference_flag: bool,
    pub frame_cropping: Option<FrameCropping>,
    pub vui: Option<Vui>,
}

/// Chroma format, bit depth and scaling matrices of high-profile streams.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HighProfileInfo {
    pub chroma_format_idc: u32,
    pub separate_colour_plane_flag: bool,
    pub bit_depth_luma_minus8: u32,
    pub bit_depth_chroma_minus8: u32,
    pub qpprime_y_zero_transform_bypass_flag: bool,
    /// One entry per list when `seq_scaling_matrix_present_flag` is set.
    pub scaling_matrix: Option<Vec<Option<ScalingList>>>,
}

/// Raw `delta_scale` values of one scaling list, in bitstream order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScalingList {
    pub delta_scale: Vec<i32>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PicOrderCnt {
    Type0 {
        log2_max_pic_order_cnt_lsb_minus4: u32,
    },
    Type1 {
        delta_pic_order_always_zero_flag: bool,
        offset_for_non_ref_pic: i32,
        offset_for_top_to_bottom_field: i32,
        offset_for_ref_frame: Vec<i32>,
    },
    Type2,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameCropping {
    pub left: u32,
    pub right: u32,
    pub top: u32,
    pub bottom: u32,
}

/// Video usability information.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Vui {
    pub aspect_ratio: Option<AspectRatio>,
    /// `overscan_appropriate_flag` when overscan info is present.
    pub overscan_appropriate: Option<bool>,
    pub video_signal_type: Option<VideoSignalType>,
    pub chroma_loc_info: Option<ChromaLocInfo>,
    pub timing_info: Option<TimingInfo>,
    pub nal_hrd: Option<HrdParameters>,
    pub vcl_hrd: Option<HrdParameters>,
    /// Only coded when at least one HRD is present.
    pub low_delay_hrd_flag: bool,
    pub pic_struct_present_flag: bool,
    pub bitstream_restriction: Option<BitstreamRestriction>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AspectRatio {
    pub aspect_ratio_idc: u8,
    pub sar_width: u16,
    pub sar_height: u16,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VideoSignalType {
    pub video_format: u8,
    pub video_full_range_flag: bool,
    pub colour_description: Option<ColourDescription>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ColourDescription {
    pub colour_primaries: u8,
    pub transfer_characteristics: u8,
    pub matrix_coefficients: u8,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChromaLocInfo {
    pub top_field: u32,
    pub bottom_field: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimingInfo {
    pub num_units_in_tick: u32,
    pub time_scale: u32,
    pub fixed_frame_rate_flag: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HrdParameters {
    pub bit_rate_scale: u8,
    pub cpb_size_scale: u8,
    /// `cpb_cnt_minus1 + 1` entries.
    pub cpb: Vec<CpbSpec>,
    pub initial_cpb_removal_delay_length_minus1: u8,
    pub cpb_removal_delay_length_minus1: u8,
    pub dpb_output_delay_length_minus1: u8,
    pub time_offset_length: u8,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CpbSpec {
    pub bit_rate_value_minus1: u32,
    pub cpb_size_value_minus1: u32,
    pub cbr_flag: bool,
}

/// VUI bitstream restriction block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BitstreamRestriction {
    pub motion_vectors_over_pic_boundaries_flag: bool,
    pub max_bytes_per_pic_denom: u32,
    pub max_bits_per_mb_denom: u32,
    pub log2_max_mv_length_horizontal: u32,
    pub log2_max_mv_length_vertical: u32,
    pub max_num_reorder_frames: u32,
    pub max_dec_frame_buffering: u32,
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

impl Sps {
    /// Parse an SPS from its RBSP (payload after the NAL header, unescaped).
    ///
    /// # Errors
    /// Returns `BitstreamError::Truncated` if the payload ends early and
    /// `BitstreamError::Unsupported` for reserved syntax values.
    pub fn parse_rbsp(rbsp: &[u8]) -> Result<Self, BitstreamError> {
        let mut r = BitReader::new(rbsp);

        let profile_idc = r.read_u8(8)?;
        let mut constraint_set_flags = [false; 6];
        for flag in constraint_set_flags.iter_mut() {
            *flag = r.read_bit()?;
        }
        let reserved_zero_2bits = r.read_u8(2)?;
        let level_idc = r.read_u8(8)?;
        let seq_parameter_set_id = r.read_ue()?;

        let high_profile = if HIGH_PROFILES.contains(&profile_idc) {
            Some(read_high_profile(&mut r)?)
        } else {
            None
        };

        let log2_max_frame_num_minus4 = r.read_ue()?;
        let pic_order_cnt = match r.read_ue()? {
            0 => PicOrderCnt::Type0 {
                log2_max_pic_order_cnt_lsb_minus4: r.read_ue()?,
            },
            1 => {
                let delta_pic_order_always_zero_flag = r.read_bit()?;
                let offset_for_non_ref_pic = r.read_se()?;
                let offset_for_top_to_bottom_field = r.read_se()?;
                let cycle = r.read_ue()?;
                if cycle > 255 {
                    return Err(BitstreamError::Unsupported(format!(
                        "num_ref_frames_in_pic_order_cnt_cycle {cycle}"
                    )));
                }
                let offset_for_ref_frame = (0..cycle)
                    .map(|_| r.read_se())
                    .collect::<Result<Vec<_>, _>>()?;
                PicOrderCnt::Type1 {
                    delta_pic_order_always_zero_flag,
                    offset_for_non_ref_pic,
                    offset_for_top_to_bottom_field,
                    offset_for_ref_frame,
                }
            }
            2 => PicOrderCnt::Type2,
            other => {
                return Err(BitstreamError::Unsupported(format!(
                    "pic_order_cnt_type {other}"
                )))
            }
        };

        let max_num_ref_frames = r.read_ue()?;
        let gaps_in_frame_num_value_allowed_flag = r.read_bit()?;
        let pic_width_in_mbs_minus1 = r.read_ue()?;
        let pic_height_in_map_units_minus1 = r.read_ue()?;
        let frame_mbs_only_flag = r.read_bit()?;
        let mb_adaptive_frame_field_flag = if frame_mbs_only_flag {
            false
        } else {
            r.read_bit()?
        };
        let direct_8x8_inference_flag = r.read_bit()?;

        let frame_cropping = if r.read_bit()? {
            Some(FrameCropping {
                left: r.read_ue()?,
                right: r.read_ue()?,
                top: r.read_ue()?,
                bottom: r.read_ue()?,
            })
        } else {
            None
        };

        let vui = if r.read_bit()? {
            Some(read_vui(&mut r)?)
        } else {
            None
        };

        Ok(Sps {
            profile_idc,
            constraint_set_flags,
            reserved_zero_2bits,
            level_idc,
            seq_parameter_set_id,
            high_profile,
            log2_max_frame_num_minus4,
            pic_order_cnt,
            max_num_ref_frames,
            gaps_in_frame_num_value_allowed_flag,
            pic_width_in_mbs_minus1,
            pic_height_in_map_units_minus1,
            frame_mbs_only_flag,
            mb_adaptive_frame_field_flag,
            direct_8x8_inference_flag,
            frame_cropping,
            vui,
        })
    }

    /// Coded picture width in pixels, before cropping.
    pub fn coded_width(&self) -> u32 {
        (self.pic_width_in_mbs_minus1 + 1) * 16
    }

    /// Coded picture height in pixels, before cropping.
    pub fn coded_height(&self) -> u32 {
        let map_units = self.pic_height_in_map_units_minus1 + 1;
        let field_factor = if self.frame_mbs_only_flag { 1 } else { 2 };
        map_units * field_factor * 16
    }
}

fn read_high_profile(r: &mut BitReader<'_>) -> Result<HighProfileInfo, BitstreamError> {
    let chroma_format_idc = r.read_ue()?;
    let separate_colour_plane_flag = if chroma_format_idc == 3 {
        r.read_bit()?
    } else {
        false
    };
    let bit_depth_luma_minus8 = r.read_ue()?;
    let bit_depth_chroma_minus8 = r.read_ue()?;
    let qpprime_y_zero_transform_bypass_flag = r.read_bit()?;

    let scaling_matrix = if r.read_bit()? {
        let count = if chroma_format_idc == 3 { 12 } else { 8 };
        let mut lists = Vec::with_capacity(count);
        for i in 0..count {
            let list = if r.read_bit()? {
                let size = if i < 6 { 16 } else { 64 };
                Some(read_scaling_list(r, size)?)
            } else {
                None
            };
            lists.push(list);
        }
        Some(lists)
    } else {
        None
    };

    Ok(HighProfileInfo {
        chroma_format_idc,
        separate_colour_plane_flag,
        bit_depth_luma_minus8,
        bit_depth_chroma_minus8,
        qpprime_y_zero_transform_bypass_flag,
        scaling_matrix,
    })
}

fn read_scaling_list(r: &mut BitReader<'_>, size: usize) -> Result<ScalingList, BitstreamError> {
    let mut delta_scale = Vec::new();
    let mut last_scale = 8i32;
    let mut next_scale = 8i32;
    for _ in 0..size {
        if next_scale != 0 {
            let delta = r.read_se()?;
            delta_scale.push(delta);
            next_scale = (last_scale + delta + 256).rem_euclid(256);
        }
        if next_scale != 0 {
            last_scale = next_scale;
        }
    }
    Ok(ScalingList { delta_scale })
}

fn read_vui(r: &mut BitReader<'_>) -> Result<Vui, BitstreamError> {
    let aspect_ratio = if r.read_bit()? {
        let aspect_ratio_idc = r.read_u8(8)?;
        let (sar_width, sar_height) = if aspect_ratio_idc == EXTENDED_SAR {
            (r.read_bits(16)? as u16, r.read_bits(16)? as u16)
        } else {
            (0, 0)
        };
        Some(AspectRatio {
            aspect_ratio_idc,
            sar_width,
            sar_height,
        })
    } else {
        None
    };

    let overscan_appropriate = if r.read_bit()? {
        Some(r.read_bit()?)
    } else {
        None
    };

    let video_signal_type = if r.read_bit()? {
        let video_format = r.read_u8(3)?;
        let video_full_range_flag = r.read_bit()?;
        let colour_description = if r.read_bit()? {
            Some(ColourDescription {
                colour_primaries: r.read_u8(8)?,
                transfer_characteristics: r.read_u8(8)?,
                matrix_coefficients: r.read_u8(8)?,
            })
        } else {
            None
        };
        Some(VideoSignalType {
            video_format,
            video_full_range_flag,
            colour_description,
        })
    } else {
        None
    };

    let chroma_loc_info = if r.read_bit()? {
        Some(ChromaLocInfo {
            top_field: r.read_ue()?,
            bottom_field: r.read_ue()?,
        })
    } else {
        None
    };

    let timing_info = if r.read_bit()? {
        Some(TimingInfo {
            num_units_in_tick: r.read_bits(32)?,
            time_scale: r.read_bits(32)?,
            fixed_frame_rate_flag: r.read_bit()?,
        })
    } else {
        None
    };

    let nal_hrd = if r.read_bit()? {
        Some(read_hrd(r)?)
    } else {
        None
    };
    let vcl_hrd = if r.read_bit()? {
        Some(read_hrd(r)?)
    } else {
        None
    };
    let low_delay_hrd_flag = if nal_hrd.is_some() || vcl_hrd.is_some() {
        r.read_bit()?
    } else {
        false
    };
    let pic_struct_present_flag = r.read_bit()?;

    let bitstream_restriction = if r.read_bit()? {
        Some(BitstreamRestriction {
            motion_vectors_over_pic_boundaries_flag: r.read_bit()?,
            max_bytes_per_pic_denom: r.read_ue()?,
            max_bits_per_mb_denom: r.read_ue()?,
            log2_max_mv_length_horizontal: r.read_ue()?,
            log2_max_mv_length_vertical: r.read_ue()?,
            max_num_reorder_frames: r.read_ue()?,
            max_dec_frame_buffering: r.read_ue()?,
        })
    } else {
        None
    };

    Ok(Vui {
        aspect_ratio,
        overscan_appropriate,
        video_signal_type,
        chroma_loc_info,
        timing_info,
        nal_hrd,
        vcl_hrd,
        low_delay_hrd_flag,
        pic_struct_present_flag,
        bitstream_restriction,
    })
}

fn read_hrd(r: &mut BitReader<'_>) -> Result<HrdParameters, BitstreamError> {
    let cpb_cnt_minus1 = r.read_ue()?;
    if cpb_cnt_minus1 > 31 {
        return Err(BitstreamError::Unsupported(format!(
            "cpb_cnt_minus1 {cpb_cnt_minus1}"
        )));
    }
    let bit_rate_scale = r.read_u8(4)?;
    let cpb_size_scale = r.read_u8(4)?;
    let mut cpb = Vec::with_capacity(cpb_cnt_minus1 as usize + 1);
    for _ in 0..=cpb_cnt_minus1 {
        cpb.push(CpbSpec {
            bit_rate_value_minus1: r.read_ue()?,
            cpb_size_value_minus1: r.read_ue()?,
            cbr_flag: r.read_bit()?,
        });
    }
    Ok(HrdParameters {
        bit_rate_scale,
        cpb_size_scale,
        cpb,
        initial_cpb_removal_delay_length_minus1: r.read_u8(5)?,
        cpb_removal_delay_length_minus1: r.read_u8(5)?,
        dpb_output_delay_length_minus1: r.read_u8(5)?,
        time_offset_length: r.read_u8(5)?,
    })
}

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

impl Sps {
    /// Serialize to RBSP, including `rbsp_trailing_bits()`.
    ///
    /// The output has no emulation prevention; run it through
    /// [`escape_rbsp`](super::escape_rbsp) before placing it in a NAL.
    pub fn write_rbsp(&self) -> Vec<u8> {
        let mut w = BitWriter::new();

        w.write_bits(u32::from(self.profile_idc), 8);
        for &flag in &self.constraint_set_flags {
            w.write_bit(flag);
        }
        w.write_bits(u32::from(self.reserved_zero_2bits), 2);
        w.write_bits(u32::from(self.level_idc), 8);
        w.write_ue(self.seq_parameter_set_id);

        if HIGH_PROFILES.contains(&self.profile_idc) {
            let info = self.high_profile.clone().unwrap_or_else(|| HighProfileInfo {
                chroma_format_idc: 1,
                ..HighProfileInfo::default()
            });
            write_high_profile(&mut w, &info);
        }

        w.write_ue(self.log2_max_frame_num_minus4);
        match &self.pic_order_cnt {
            PicOrderCnt::Type0 {
                log2_max_pic_order_cnt_lsb_minus4,
            } => {
                w.write_ue(0);
                w.write_ue(*log2_max_pic_order_cnt_lsb_minus4);
            }
            PicOrderCnt::Type1 {
                delta_pic_order_always_zero_flag,
                offset_for_non_ref_pic,
                offset_for_top_to_bottom_field,
                offset_for_ref_frame,
            } => {
                w.write_ue(1);
                w.write_bit(*delta_pic_order_always_zero_flag);
                w.write_se(*offset_for_non_ref_pic);
                w.write_se(*offset_for_top_to_bottom_field);
                w.write_ue(offset_for_ref_frame.len() as u32);
                for &offset in offset_for_ref_frame {
                    w.write_se(offset);
                }
            }
            PicOrderCnt::Type2 => w.write_ue(2),
        }

        w.write_ue(self.max_num_ref_frames);
        w.write_bit(self.gaps_in_frame_num_value_allowed_flag);
        w.write_ue(self.pic_width_in_mbs_minus1);
        w.write_ue(self.pic_height_in_map_units_minus1);
        w.write_bit(self.frame_mbs_only_flag);
        if !self.frame_mbs_only_flag {
            w.write_bit(self.mb_adaptive_frame_field_flag);
        }
        w.write_bit(self.direct_8x8_inference_flag);

        match &self.frame_cropping {
            Some(crop) => {
                w.write_bit(true);
                w.write_ue(crop.left);
                w.write_ue(crop.right);
                w.write_ue(crop.top);
                w.write_ue(crop.bottom);
            }
            None => w.write_bit(false),
        }

        match &self.vui {
            Some(vui) => {
                w.write_bit(true);
                write_vui(&mut w, vui);
            }
            None => w.write_bit(false),
        }

        w.write_trailing_bits();
        w.into_bytes()
    }
}

fn write_high_profile(w: &mut BitWriter, info: &HighProfileInfo) {
    w.write_ue(info.chroma_format_idc);
    if info.chroma_format_idc == 3 {
        w.write_bit(info.separate_colour_plane_flag);
    }
    w.write_ue(info.bit_depth_luma_minus8);
    w.write_ue(info.bit_depth_chroma_minus8);
    w.write_bit(info.qpprime_y_zero_transform_bypass_flag);

    match &info.scaling_matrix {
        Some(lists) => {
            w.write_bit(true);
            let count = if info.chroma_format_idc == 3 { 12 } else { 8 };
            for i in 0..count {
                match lists.get(i).and_then(Option::as_ref) {
                    Some(list) => {
                        w.write_bit(true);
                        for &delta in &list.delta_scale {
                            w.write_se(delta);
                        }
                    }
                    None => w.write_bit(false),
                }
            }
        }
        None => w.write_bit(false),
    }
}

fn write_vui(w: &mut BitWriter, vui: &Vui) {
    match &vui.aspect_ratio {
        Some(ar) => {
            w.write_bit(true);
            w.write_bits(u32::from(ar.aspect_ratio_idc), 8);
            if ar.aspect_ratio_idc == EXTENDED_SAR {
                w.write_bits(u32::from(ar.sar_width), 16);
                w.write_bits(u32::from(ar.sar_height), 16);
            }
        }
        None => w.write_bit(false),
    }

    match vui.overscan_appropriate {
        Some(appropriate) => {
            w.write_bit(true);
            w.write_bit(appropriate);
        }
        None => w.write_bit(false),
    }

    match &vui.video_signal_type {
        Some(signal) => {
            w.write_bit(true);
            w.write_bits(u32::from(signal.video_format), 3);
            w.write_bit(signal.video_full_range_flag);
            match &signal.colour_description {
                Some(colour) => {
                    w.write_bit(true);
                    w.write_bits(u32::from(colour.colour_primaries), 8);
                    w.write_bits(u32::from(colour.transfer_characteristics), 8);
                    w.write_bits(u32::from(colour.matrix_coefficients), 8);
                }
                None => w.write_bit(false),
            }
        }
        None => w.write_bit(false),
    }

    match &vui.chroma_loc_info {
        Some(loc) => {
            w.write_bit(true);
            w.write_ue(loc.top_field);
            w.write_ue(loc.bottom_field);
        }
        None => w.write_bit(false),
    }

    match &vui.timing_info {
        Some(timing) => {
            w.write_bit(true);
            w.write_bits(timing.num_units_in_tick, 32);
            w.write_bits(timing.time_scale, 32);
            w.write_bit(timing.fixed_frame_rate_flag);
        }
        None => w.write_bit(false),
    }

    for hrd in [&vui.nal_hrd, &vui.vcl_hrd] {
        match hrd {
            Some(hrd) => {
                w.write_bit(true);
                write_hrd(w, hrd);
            }
            None => w.write_bit(false),
        }
    }
    if vui.nal_hrd.is_some() || vui.vcl_hrd.is_some() {
        w.write_bit(vui.low_delay_hrd_flag);
    }
    w.write_bit(vui.pic_struct_present_flag);

    match &vui.bitstream_restriction {
        Some(br) => {
            w.write_bit(true);
            w.write_bit(br.motion_vectors_over_pic_boundaries_flag);
            w.write_ue(br.max_bytes_per_pic_denom);
            w.write_ue(br.max_bits_per_mb_denom);
            w.write_ue(br.log2_max_mv_length_horizontal);
            w.write_ue(br.log2_max_mv_length_vertical);
            w.write_ue(br.max_num_reorder_frames);
            w.write_ue(br.max_dec_frame_buffering);
        }
        None => w.write_bit(false),
    }
}

fn write_hrd(w: &mut BitWriter, hrd: &HrdParameters) {
    w.write_ue(hrd.cpb.len().saturating_sub(1) as u32);
    w.write_bits(u32::from(hrd.bit_rate_scale), 4);
    w.write_bits(u32::from(hrd.cpb_size_scale), 4);
    for cpb in &hrd.cpb {
        w.write_ue(cpb.bit_rate_value_minus1);
        w.write_ue(cpb.cpb_size_value_minus1);
        w.write_bit(cpb.cbr_flag);
    }
    w.write_bits(u32::from(hrd.initial_cpb_removal_delay_length_minus1), 5);
    w.write_bits(u32::from(hrd.cpb_removal_delay_length_minus1), 5);
    w.write_bits(u32::from(hrd.dpb_output_delay_length_minus1), 5);
    w.write_bits(u32::from(hrd.time_offset_length), 5);
}
