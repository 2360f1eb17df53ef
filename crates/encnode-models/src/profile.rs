//! Encoding targets.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One rendition of the HLS ladder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EncodingProfile {
    /// Rendition name, also the output sub-directory (e.g. "720p")
    pub name: String,
    /// Output height in pixels (width follows the source aspect ratio)
    pub height: u32,
    /// Target video bitrate in kbit/s
    pub video_bitrate_kbps: u32,
    /// Target audio bitrate in kbit/s
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate_kbps: u32,
}

fn default_audio_bitrate() -> u32 {
    128
}

impl EncodingProfile {
    pub fn new(name: impl Into<String>, height: u32, video_bitrate_kbps: u32) -> Self {
        Self {
            name: name.into(),
            height,
            video_bitrate_kbps,
            audio_bitrate_kbps: default_audio_bitrate(),
        }
    }

    pub fn p1080() -> Self {
        Self::new("1080p", 1080, 4500)
    }

    pub fn p720() -> Self {
        Self::new("720p", 720, 2500)
    }

    pub fn p480() -> Self {
        Self::new("480p", 480, 1000)
    }

    /// Default ladder for gateway jobs, highest quality first.
    pub fn default_ladder() -> Vec<Self> {
        vec![Self::p1080(), Self::p720(), Self::p480()]
    }

    /// Stable hash of every field that influences the encoded bytes.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        hasher.update(self.height.to_be_bytes());
        hasher.update(self.video_bitrate_kbps.to_be_bytes());
        hasher.update(self.audio_bitrate_kbps.to_be_bytes());
        format!("{:x}", hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_depends_on_settings() {
        let a = EncodingProfile::p720();
        let mut b = EncodingProfile::p720();
        assert_eq!(a.fingerprint(), b.fingerprint());

        b.video_bitrate_kbps = 3000;
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_default_ladder_order() {
        let heights: Vec<u32> = EncodingProfile::default_ladder()
            .iter()
            .map(|p| p.height)
            .collect();
        assert_eq!(heights, vec![1080, 720, 480]);
    }
}
