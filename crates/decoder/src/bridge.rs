//! Process-wide entry points for C-style callers.
//!
//! Some protocol engines deliver decode units through plain function pointers
//! with no user-data argument. This module keeps one "current" session for
//! them to reach. Nothing inside the pipeline reads it; Rust callers should
//! hold their [`DecoderSession`] directly.

use std::sync::Arc;

use parking_lot::{const_mutex, Mutex};
use tracing::debug;

use sp_common::{BufferType, DecodeStatus};

use crate::session::DecoderSession;

static CURRENT: Mutex<Option<Arc<DecoderSession>>> = const_mutex(None);

/// Make `session` the target of [`submit_decode_unit`]. Returns the session
/// it replaces, if any.
pub fn install(session: Arc<DecoderSession>) -> Option<Arc<DecoderSession>> {
    debug!(decoder = session.decoder_name(), "Installing current decoder session");
    CURRENT.lock().replace(session)
}

/// Detach the current session.
pub fn clear() -> Option<Arc<DecoderSession>> {
    CURRENT.lock().take()
}

pub fn current() -> Option<Arc<DecoderSession>> {
    CURRENT.lock().clone()
}

/// Forward a decode unit to the current session.
///
/// `buffer_type` and the return value use the protocol engine's integer
/// codes. With no session installed the caller is asked for a keyframe.
pub fn submit_decode_unit(
    data: &[u8],
    buffer_type: i32,
    frame_number: u32,
    receive_time_ms: u64,
) -> i32 {
    let Some(session) = current() else {
        return DecodeStatus::NeedKeyframe as i32;
    };
    session.submit_decode_unit(data, BufferType::from(buffer_type), frame_number, receive_time_ms)
        as i32
}

/// Fill an overlay template from the current session.
pub fn format_info(template: &str) -> Option<String> {
    current().map(|session| session.format_info(template))
}
