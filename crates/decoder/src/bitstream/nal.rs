//! Annex-B framing helpers.

use sp_common::{BufferType, VideoCodec};

/// Length of the start code at the front of `nal` (3 or 4), if any.
pub fn start_code_len(nal: &[u8]) -> Option<usize> {
    match nal {
        [0, 0, 0, 1, ..] => Some(4),
        [0, 0, 1, ..] => Some(3),
        _ => None,
    }
}

/// Split an Annex-B byte stream into NAL units, each keeping its start code.
///
/// Bytes before the first start code are ignored.
pub fn split_annex_b(data: &[u8]) -> Vec<&[u8]> {
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            let begin = if i > 0 && data[i - 1] == 0 { i - 1 } else { i };
            starts.push(begin);
            i += 3;
        } else {
            i += 1;
        }
    }

    starts
        .iter()
        .enumerate()
        .map(|(n, &begin)| {
            let end = starts.get(n + 1).copied().unwrap_or(data.len());
            &data[begin..end]
        })
        .collect()
}

/// Decoded NAL header fields relevant to decode-unit classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NalHeader {
    pub nal_unit_type: u8,
    pub nal_ref_idc: u8,
}

impl NalHeader {
    /// Parse the header that follows the start code of `nal`.
    pub fn parse(codec: VideoCodec, nal: &[u8]) -> Option<Self> {
        let offset = start_code_len(nal)?;
        let byte = *nal.get(offset)?;
        let header = match codec {
            VideoCodec::H265 => NalHeader {
                nal_unit_type: (byte >> 1) & 0x3f,
                nal_ref_idc: 0,
            },
            _ => NalHeader {
                nal_unit_type: byte & 0x1f,
                nal_ref_idc: (byte >> 5) & 0x03,
            },
        };
        Some(header)
    }

    /// Map the NAL type to the tag the protocol engine would attach.
    pub fn buffer_type(&self, codec: VideoCodec) -> BufferType {
        match (codec, self.nal_unit_type) {
            (VideoCodec::H264, 7) => BufferType::Sps,
            (VideoCodec::H264, 8) => BufferType::Pps,
            (VideoCodec::H265, 32) => BufferType::Vps,
            (VideoCodec::H265, 33) => BufferType::Sps,
            (VideoCodec::H265, 34) => BufferType::Pps,
            _ => BufferType::PicData,
        }
    }

    /// True for slice NALs that begin a new picture (IDR or non-IDR slice).
    pub fn is_frame_start(&self, codec: VideoCodec) -> bool {
        match codec {
            VideoCodec::H264 => matches!(self.nal_unit_type, 1 | 5),
            VideoCodec::H265 => self.nal_unit_type <= 21,
            VideoCodec::Av1 => true,
        }
    }
}
