//! `sp-common`: shared types for the streampace decode pipeline.
//!
//! This crate holds the small vocabulary that both the decoder crate and the
//! tooling speak:
//!
//! - **Codecs**: [`VideoCodec`] and its MIME type mapping
//! - **Decode units**: [`BufferType`] classification and [`DecodeStatus`]
//! - **Geometry**: [`Resolution`]
//! - **Errors**: [`DecodeError`] and [`CodecError`]

pub mod codec;
pub mod error;

pub use codec::{BufferType, DecodeStatus, Resolution, VideoCodec};
pub use error::{CodecError, DecodeError};
