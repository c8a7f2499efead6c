//! H.264 bitstream handling for decoder compatibility.
//!
//! Hardware decoders are picky about the sequence parameter set they are fed.
//! This module parses an Annex-B SPS NAL into a structured [`Sps`], lets the
//! patcher rewrite the fields that drive decoder-side buffering, and writes
//! it back out with emulation prevention reinstated.
//!
//! ## Layout
//!
//! - [`bits`]: exp-Golomb bit reader/writer and emulation-prevention helpers
//! - [`sps`]: the SPS/VUI/HRD syntax model with parse and write
//! - [`patch`]: the deterministic rewrite applied before an SPS is cached
//! - [`nal`]: Annex-B start-code scanning and NAL header classification

pub mod bits;
pub mod nal;
pub mod patch;
pub mod sps;

use thiserror::Error;

pub use bits::{escape_rbsp, unescape_rbsp, BitReader, BitWriter};
pub use nal::{split_annex_b, NalHeader};
pub use patch::{
    apply_profile_constraints, level_for, patch_sps, replay_sps_nal, PatchedSps, SpsPatchOptions,
};
pub use sps::{BitstreamRestriction, Sps, Vui};

/// Annex-B start code preceding every NAL handed to the pipeline.
pub const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// NAL header byte of an H.264 SPS (`nal_ref_idc = 3`, `nal_unit_type = 7`).
pub const SPS_NAL_HEADER: u8 = 0x67;

/// Length of the start code plus NAL header prefix.
pub const NAL_PREFIX_LEN: usize = START_CODE.len() + 1;

/// Errors produced while parsing or rewriting a bitstream.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BitstreamError {
    #[error("NAL does not begin with a 4-byte Annex-B start code")]
    MissingStartCode,

    #[error("Expected SPS NAL header 0x67, found 0x{header:02x}")]
    NotSps { header: u8 },

    #[error("Bitstream truncated at bit {bit}")]
    Truncated { bit: usize },

    #[error("Exp-Golomb code exceeds 32 bits at bit {bit}")]
    ExpGolombOverflow { bit: usize },

    #[error("Unsupported SPS syntax: {0}")]
    Unsupported(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitstream_error_display() {
        let err = BitstreamError::NotSps { header: 0x68 };
        assert_eq!(err.to_string(), "Expected SPS NAL header 0x67, found 0x68");

        let err = BitstreamError::Truncated { bit: 77 };
        assert!(err.to_string().contains("77"));

        let err = BitstreamError::Unsupported("pic_order_cnt_type 5".into());
        assert!(err.to_string().contains("pic_order_cnt_type 5"));
    }
}
