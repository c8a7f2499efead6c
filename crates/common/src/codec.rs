//! Codec identifiers and decode-unit classification.

use serde::{Deserialize, Serialize};

/// Compressed video codecs the pipeline can drive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    #[default]
    H264,
    H265,
    Av1,
}

impl VideoCodec {
    /// MIME type handed to the platform decoder at configure time.
    pub fn mime_type(self) -> &'static str {
        match self {
            VideoCodec::H264 => "video/avc",
            VideoCodec::H265 => "video/hevc",
            VideoCodec::Av1 => "video/av01",
        }
    }

    /// Human-readable name used in logs.
    pub fn display_name(self) -> &'static str {
        match self {
            VideoCodec::H264 => "H.264",
            VideoCodec::H265 => "H.265",
            VideoCodec::Av1 => "AV1",
        }
    }

    /// Whether SPS rewriting applies to this codec.
    pub fn patches_sps(self) -> bool {
        matches!(self, VideoCodec::H264)
    }
}

impl std::fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Kind of a decode unit as tagged by the upstream protocol engine.
///
/// The numeric values match the wire tags the protocol engine uses.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BufferType {
    PicData = 0,
    Sps = 1,
    Pps = 2,
    Vps = 3,
}

impl BufferType {
    pub fn is_parameter_set(self) -> bool {
        !matches!(self, BufferType::PicData)
    }
}

impl From<i32> for BufferType {
    fn from(v: i32) -> Self {
        match v {
            1 => BufferType::Sps,
            2 => BufferType::Pps,
            3 => BufferType::Vps,
            _ => BufferType::PicData,
        }
    }
}

/// Result of handing one decode unit to the pipeline.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DecodeStatus {
    /// Unit accepted (queued or cached).
    Ok = 0,
    /// The pipeline could not take the unit; the caller should request an IDR frame.
    NeedKeyframe = -1,
}

impl DecodeStatus {
    pub fn is_ok(self) -> bool {
        self == DecodeStatus::Ok
    }
}

/// Frame dimensions in pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const SD: Self = Self::new(720, 480);
    pub const HD: Self = Self::new(1280, 720);
    pub const FHD: Self = Self::new(1920, 1080);
    pub const UHD: Self = Self::new(3840, 2160);

    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// True when both dimensions fit inside `other`.
    pub fn fits_within(&self, other: Resolution) -> bool {
        self.width <= other.width && self.height <= other.height
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_type_from_wire_tag() {
        assert_eq!(BufferType::from(1), BufferType::Sps);
        assert_eq!(BufferType::from(2), BufferType::Pps);
        assert_eq!(BufferType::from(3), BufferType::Vps);
        assert_eq!(BufferType::from(0), BufferType::PicData);
        assert_eq!(BufferType::from(42), BufferType::PicData);
        assert!(BufferType::Vps.is_parameter_set());
        assert!(!BufferType::PicData.is_parameter_set());
    }

    #[test]
    fn decode_status_codes() {
        assert_eq!(DecodeStatus::Ok as i32, 0);
        assert_eq!(DecodeStatus::NeedKeyframe as i32, -1);
        assert!(DecodeStatus::Ok.is_ok());
    }

    #[test]
    fn resolution_display_and_fit() {
        assert_eq!(Resolution::FHD.to_string(), "1920x1080");
        assert!(Resolution::new(1280, 720).fits_within(Resolution::FHD));
        assert!(!Resolution::UHD.fits_within(Resolution::FHD));
    }

    #[test]
    fn codec_mime_types() {
        assert_eq!(VideoCodec::H264.mime_type(), "video/avc");
        assert_eq!(VideoCodec::H265.mime_type(), "video/hevc");
        assert!(VideoCodec::H264.patches_sps());
        assert!(!VideoCodec::Av1.patches_sps());
    }
}
