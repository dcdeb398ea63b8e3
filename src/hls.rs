//! HLS master manifest model and writer.

use std::path::Path;

use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::config::ResolutionProfile;

/// One rendition entry in the master manifest.
#[derive(Clone, Debug, PartialEq)]
pub struct MasterManifestEntry {
    pub name: String,
    pub bandwidth: u64,
    pub width: u32,
    pub height: u32,
}

impl MasterManifestEntry {
    /// Bandwidth is the combined configured bitrate in bits per second;
    /// width assumes 16:9 sources, matching the encoder's scale filter.
    pub fn from_profile(profile: &ResolutionProfile) -> Self {
        Self {
            name: profile.name.clone(),
            bandwidth: u64::from(profile.video_kbps + profile.audio_kbps) * 1000,
            width: (f64::from(profile.height) * 16.0 / 9.0).round() as u32,
            height: profile.height,
        }
    }
}

/// Top-level adaptive manifest referencing one playlist per rendition.
/// Entries must already be in ascending height order — the same order the
/// renditions were encoded in.
pub struct MasterManifest {
    pub entries: Vec<MasterManifestEntry>,
}

impl MasterManifest {
    pub fn from_profiles(profiles: &[ResolutionProfile]) -> Self {
        Self {
            entries: profiles.iter().map(MasterManifestEntry::from_profile).collect(),
        }
    }

    /// Render the exact on-disk format. Existing players depend on this
    /// byte-for-byte, including the blank separator lines.
    pub fn render(&self) -> String {
        let mut out = String::from("#EXTM3U\n#EXT-X-VERSION:3\n\n");
        for entry in &self.entries {
            out.push_str(&format!(
                "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION={}x{}\n{}/playlist.m3u8\n\n",
                entry.bandwidth, entry.width, entry.height, entry.name
            ));
        }
        out
    }

    pub async fn write_to(&self, path: &Path) -> Result<(), std::io::Error> {
        let mut file = File::create(path).await?;
        file.write_all(self.render().as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
