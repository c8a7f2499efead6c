//! Parameter-set caching and codec-config assembly.
//!
//! VPS, SPS and PPS NAL units arrive as separate decode units. They are never
//! submitted one by one: the assembler caches them and decides, per PPS,
//! whether to emit a standalone codec-config buffer or to fuse the cached set
//! with the next picture. Cached sets are always replayed as VPS, SPS, PPS.

use tracing::{debug, trace};

use sp_common::{BufferType, VideoCodec};

use crate::bitstream::{patch_sps, replay_sps_nal, BitstreamError, Sps, SpsPatchOptions};
use crate::bitstream::{NAL_PREFIX_LEN, SPS_NAL_HEADER, START_CODE};

/// Most recent parameter sets, one buffer per kind.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParameterCache {
    pub vps: Option<Vec<u8>>,
    pub sps: Option<Vec<u8>>,
    pub pps: Option<Vec<u8>>,
    /// SPS as it was before the baseline hack, kept for the replay.
    pub saved_sps: Option<Sps>,
}

impl ParameterCache {
    /// Replace the cached buffer of `kind`. Picture data is ignored.
    pub fn store(&mut self, kind: BufferType, data: Vec<u8>) {
        match kind {
            BufferType::Vps => self.vps = Some(data),
            BufferType::Sps => self.sps = Some(data),
            BufferType::Pps => self.pps = Some(data),
            BufferType::PicData => {}
        }
    }

    pub fn get(&self, kind: BufferType) -> Option<&[u8]> {
        match kind {
            BufferType::Vps => self.vps.as_deref(),
            BufferType::Sps => self.sps.as_deref(),
            BufferType::Pps => self.pps.as_deref(),
            BufferType::PicData => None,
        }
    }

    /// Cached sets concatenated in VPS, SPS, PPS order.
    pub fn config_blob(&self) -> Vec<u8> {
        [&self.vps, &self.sps, &self.pps]
            .into_iter()
            .flatten()
            .flat_map(|buf| buf.iter().copied())
            .collect()
    }

    pub fn clear(&mut self) {
        *self = ParameterCache::default();
    }
}

/// What the session must submit for one decode unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Assembly {
    /// The unit was a parameter set and has been cached.
    Cached,
    /// Submit this blob as a standalone codec-config buffer.
    Config(Vec<u8>),
    /// Submit the picture, preceded in the same buffer by `prefix`.
    Picture { prefix: Option<Vec<u8>> },
}

/// Tracks cached parameter sets and when they must be sent.
#[derive(Debug)]
pub struct ParameterSetAssembler {
    codec: VideoCodec,
    adaptive: bool,
    patch: SpsPatchOptions,
    cache: ParameterCache,
    submitted_config: bool,
    prepend_next: bool,
    replay_pending: bool,
}

impl ParameterSetAssembler {
    /// # Arguments
    /// * `codec` - Stream codec; SPS patching only applies to H.264.
    /// * `adaptive` - The decoder supports adaptive playback, so later
    ///   parameter sets can ride along with the next picture.
    /// * `patch` - SPS rewrite switches for this decoder.
    pub fn new(codec: VideoCodec, adaptive: bool, patch: SpsPatchOptions) -> Self {
        let replay_pending = patch.baseline_hack;
        Self {
            codec,
            adaptive,
            patch,
            cache: ParameterCache::default(),
            submitted_config: false,
            prepend_next: false,
            replay_pending,
        }
    }

    pub fn cache(&self) -> &ParameterCache {
        &self.cache
    }

    pub fn submitted_config(&self) -> bool {
        self.submitted_config
    }

    pub fn prepend_pending(&self) -> bool {
        self.prepend_next
    }

    /// Classify one decode unit and update the cache.
    ///
    /// # Errors
    /// Returns a [`BitstreamError`] if an H.264 SPS cannot be patched; the
    /// cache is left unchanged in that case.
    pub fn accept(&mut self, kind: BufferType, data: &[u8]) -> Result<Assembly, BitstreamError> {
        match kind {
            BufferType::Sps => {
                let nal = if self.patches(data) {
                    let patched = patch_sps(data, &self.patch)?;
                    if patched.saved.is_some() {
                        self.cache.saved_sps = patched.saved;
                    }
                    trace!(before = data.len(), after = patched.nal.len(), "SPS patched");
                    patched.nal
                } else {
                    data.to_vec()
                };
                self.cache.store(kind, nal);
                Ok(Assembly::Cached)
            }
            BufferType::Vps => {
                self.cache.store(kind, data.to_vec());
                Ok(Assembly::Cached)
            }
            BufferType::Pps => {
                self.cache.store(kind, data.to_vec());
                if !self.submitted_config || !self.adaptive {
                    Ok(Assembly::Config(self.cache.config_blob()))
                } else {
                    debug!("Deferring parameter sets to the next picture");
                    self.prepend_next = true;
                    Ok(Assembly::Cached)
                }
            }
            BufferType::PicData => {
                let prefix = self.prepend_next.then(|| self.cache.config_blob());
                Ok(Assembly::Picture { prefix })
            }
        }
    }

    /// Record that a picture carrying the cached parameter sets reached the
    /// decoder. Until then every picture keeps getting the prefix.
    pub fn on_picture_submitted(&mut self) {
        if std::mem::take(&mut self.prepend_next) {
            trace!("Fused parameter sets delivered");
        }
    }

    /// Record that a codec-config buffer reached the decoder.
    ///
    /// Returns the SPS replay NAL the first time this is called while the
    /// baseline hack is pending.
    pub fn on_config_submitted(&mut self) -> Option<Vec<u8>> {
        self.submitted_config = true;
        if !self.replay_pending {
            return None;
        }
        let saved = self.cache.saved_sps.as_ref()?;
        self.replay_pending = false;
        debug!("Replaying pre-hack SPS");
        Some(replay_sps_nal(saved, self.patch.constrained_high_profile))
    }

    /// Forget every cached parameter set.
    pub fn clear_cache(&mut self) {
        self.cache.clear();
        self.prepend_next = false;
    }

    fn patches(&self, data: &[u8]) -> bool {
        self.codec.patches_sps()
            && data.len() >= NAL_PREFIX_LEN
            && data[..START_CODE.len()] == START_CODE
            && data[START_CODE.len()] == SPS_NAL_HEADER
    }
}
