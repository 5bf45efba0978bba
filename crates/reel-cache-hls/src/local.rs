//! Local playlist authoring.
//!
//! The generated manifest mixes local and remote references: a segment entry points at the
//! on-disk `segment_<i>.ts` only when that file exists with positive length, and at the
//! original remote URL otherwise. The player falls back to the network for uncached
//! segments and never has to wait for the cache to fill.
//!
//! The file is replaced via temp-write + rename so a concurrently reading player never
//! observes a torn manifest.

use std::io;
use std::path::{Path, PathBuf};

use crate::parser::MediaPlaylist;

/// File name of the generated manifest inside a per-URL HLS directory.
pub const LOCAL_PLAYLIST: &str = "playlist.m3u8";

/// File name of the cached segment at `index` (zero-based within the parsed playlist).
pub fn segment_file_name(index: usize) -> String {
    format!("segment_{index}.ts")
}

/// Path of the cached segment at `index` inside `dir`.
pub fn segment_path(dir: &Path, index: usize) -> PathBuf {
    dir.join(segment_file_name(index))
}

/// Whether a segment file is usable: present with positive length.
pub fn segment_is_cached(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}

/// Count cached segments on disk and find the first missing index.
pub fn scan_cached(dir: &Path, segment_count: usize) -> (usize, usize) {
    let mut cached = 0;
    let mut first_missing = segment_count;
    for index in 0..segment_count {
        if segment_is_cached(&segment_path(dir, index)) {
            cached += 1;
        } else if first_missing == segment_count {
            first_missing = index;
        }
    }
    (cached, first_missing)
}

/// Write the local manifest for `playlist` into `dir`, returning its path.
pub async fn write_local_playlist(dir: &Path, playlist: &MediaPlaylist) -> io::Result<PathBuf> {
    let mut out = String::new();
    out.push_str("#EXTM3U\n");
    out.push_str("#EXT-X-VERSION:3\n");
    out.push_str(&format!(
        "#EXT-X-TARGETDURATION:{}\n",
        playlist.target_duration
    ));
    out.push_str(&format!(
        "#EXT-X-MEDIA-SEQUENCE:{}\n",
        playlist.media_sequence
    ));

    for segment in &playlist.segments {
        out.push_str(&format!("#EXTINF:{},\n", segment.duration));
        let local = segment_path(dir, segment.index);
        if segment_is_cached(&local) {
            out.push_str(&local.to_string_lossy());
        } else {
            out.push_str(&segment.url);
        }
        out.push('\n');
    }

    if !playlist.is_live {
        out.push_str("#EXT-X-ENDLIST\n");
    }

    let path = dir.join(LOCAL_PLAYLIST);
    let tmp = dir.join(".playlist.m3u8.tmp");
    tokio::fs::write(&tmp, out.as_bytes()).await?;
    tokio::fs::rename(&tmp, &path).await?;
    Ok(path)
}
