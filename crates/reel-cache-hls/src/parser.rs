//! M3U8 playlist lexer.
//!
//! A small purpose-built parser rather than a strict-RFC crate: playlists in the wild drop
//! mandatory tags, and the cache needs lenient defaults plus zero-based segment indexes that
//! map directly onto `segment_<i>.ts` file names. URL resolution delegates to `url::Url`,
//! whose join semantics are exactly the required ones (absolute pass-through, leading slash
//! replaces the path, other relative forms resolve against the directory prefix).
//!
//! A body with any `#EXT-X-STREAM-INF` tag parses as a master playlist; everything else is a
//! media playlist. The first non-empty line must be `#EXTM3U`.

use url::Url;

use crate::error::{HlsError, HlsResult};

/// One quality variant from a master playlist.
#[derive(Debug, Clone, PartialEq)]
pub struct HlsVariant {
    /// Absolute media playlist URL.
    pub url: String,
    pub bandwidth: u64,
    pub resolution: Option<String>,
    pub codecs: Option<String>,
}

/// A master playlist: variants ordered by bandwidth, highest first.
#[derive(Debug, Clone, PartialEq)]
pub struct MasterPlaylist {
    pub variants: Vec<HlsVariant>,
}

impl MasterPlaylist {
    /// The highest-bandwidth variant.
    pub fn best_variant(&self) -> Option<&HlsVariant> {
        self.variants.first()
    }

    /// The variant whose bandwidth is closest to `target_bandwidth`.
    pub fn closest_to(&self, target_bandwidth: u64) -> Option<&HlsVariant> {
        self.variants
            .iter()
            .min_by_key(|v| v.bandwidth.abs_diff(target_bandwidth))
    }
}

/// One media segment, indexed by its zero-based position in the playlist.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaSegment {
    /// Absolute segment URL.
    pub url: String,
    /// Duration in seconds, from `#EXTINF`.
    pub duration: f64,
    pub index: usize,
}

/// A media playlist.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaPlaylist {
    pub segments: Vec<MediaSegment>,
    /// `#EXT-X-TARGETDURATION`, ceiled to whole seconds.
    pub target_duration: u64,
    /// `#EXT-X-MEDIA-SEQUENCE`, 0 when absent.
    pub media_sequence: u64,
    /// True unless the playlist carries `#EXT-X-ENDLIST`.
    pub is_live: bool,
}

/// Result of parsing a playlist body.
#[derive(Debug, Clone, PartialEq)]
pub enum HlsPlaylist {
    Master(MasterPlaylist),
    Media(MediaPlaylist),
}

/// Parse a playlist fetched from `base_url`.
pub fn parse_playlist(body: &str, base_url: &str) -> HlsResult<HlsPlaylist> {
    let first = body
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("");
    if !first.starts_with("#EXTM3U") {
        return Err(HlsError::format("missing #EXTM3U header"));
    }

    if body.contains("#EXT-X-STREAM-INF") {
        parse_master(body, base_url).map(HlsPlaylist::Master)
    } else {
        parse_media(body, base_url).map(HlsPlaylist::Media)
    }
}

fn parse_master(body: &str, base_url: &str) -> HlsResult<MasterPlaylist> {
    let mut variants = Vec::new();
    let mut lines = body.lines().map(str::trim).peekable();

    while let Some(line) = lines.next() {
        let Some(attr_text) = line.strip_prefix("#EXT-X-STREAM-INF:") else {
            continue;
        };
        let attrs = parse_attributes(attr_text);
        let Some(uri) = next_uri_line(&mut lines) else {
            continue;
        };

        let bandwidth = attrs
            .iter()
            .find(|(k, _)| k == "BANDWIDTH")
            .and_then(|(_, v)| v.parse::<u64>().ok())
            .unwrap_or(0);
        let attr = |key: &str| {
            attrs
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        };

        variants.push(HlsVariant {
            url: resolve_uri(base_url, uri)?,
            bandwidth,
            resolution: attr("RESOLUTION"),
            codecs: attr("CODECS"),
        });
    }

    variants.sort_by(|a, b| b.bandwidth.cmp(&a.bandwidth));
    Ok(MasterPlaylist { variants })
}

fn parse_media(body: &str, base_url: &str) -> HlsResult<MediaPlaylist> {
    let mut segments = Vec::new();
    let mut target_duration = 0u64;
    let mut media_sequence = 0u64;

    let mut lines = body.lines().map(str::trim).peekable();
    while let Some(line) = lines.next() {
        if let Some(value) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
            target_duration = value
                .trim()
                .parse::<f64>()
                .map(|v| v.ceil() as u64)
                .unwrap_or(0);
        } else if let Some(value) = line.strip_prefix("#EXT-X-MEDIA-SEQUENCE:") {
            media_sequence = value.trim().parse::<u64>().unwrap_or(0);
        } else if let Some(value) = line.strip_prefix("#EXTINF:") {
            let duration = value
                .split(',')
                .next()
                .and_then(|d| d.trim().parse::<f64>().ok())
                .unwrap_or(0.0);
            let Some(uri) = next_uri_line(&mut lines) else {
                continue;
            };
            segments.push(MediaSegment {
                url: resolve_uri(base_url, uri)?,
                duration,
                index: segments.len(),
            });
        }
    }

    Ok(MediaPlaylist {
        segments,
        target_duration,
        media_sequence,
        is_live: !body.contains("#EXT-X-ENDLIST"),
    })
}

/// Advance to the URI line following a segment or variant tag, skipping blanks and tags.
fn next_uri_line<'a, I>(lines: &mut std::iter::Peekable<I>) -> Option<&'a str>
where
    I: Iterator<Item = &'a str>,
{
    while let Some(&line) = lines.peek() {
        if line.is_empty() || line.starts_with('#') {
            lines.next();
            continue;
        }
        lines.next();
        return Some(line);
    }
    None
}

/// Resolve a playlist URI against the URL the playlist was fetched from.
pub fn resolve_uri(base_url: &str, uri: &str) -> HlsResult<String> {
    if uri.contains("://") {
        return Ok(uri.to_string());
    }
    let base = Url::parse(base_url)
        .map_err(|e| HlsError::format(format!("invalid base URL `{base_url}`: {e}")))?;
    let joined = base
        .join(uri)
        .map_err(|e| HlsError::format(format!("cannot resolve `{uri}`: {e}")))?;
    Ok(joined.to_string())
}

/// Parse a tag attribute list: `KEY=value` or `KEY="quoted value"`, comma-separated, keys
/// matching `[A-Z0-9-]+`. Quoted values may contain commas.
pub fn parse_attributes(input: &str) -> Vec<(String, String)> {
    let bytes = input.as_bytes();
    let mut attrs = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        while i < bytes.len() && (bytes[i] == b',' || bytes[i] == b' ') {
            i += 1;
        }

        let key_start = i;
        while i < bytes.len()
            && (bytes[i].is_ascii_uppercase() || bytes[i].is_ascii_digit() || bytes[i] == b'-')
        {
            i += 1;
        }
        if i == key_start || bytes.get(i) != Some(&b'=') {
            // Not an attribute token; skip to the next comma.
            while i < bytes.len() && bytes[i] != b',' {
                i += 1;
            }
            continue;
        }
        let key = &input[key_start..i];
        i += 1;

        let value = if bytes.get(i) == Some(&b'"') {
            i += 1;
            let value_start = i;
            while i < bytes.len() && bytes[i] != b'"' {
                i += 1;
            }
            let value = &input[value_start..i];
            if i < bytes.len() {
                i += 1;
            }
            value
        } else {
            let value_start = i;
            while i < bytes.len() && bytes[i] != b',' {
                i += 1;
            }
            &input[value_start..i]
        };

        attrs.push((key.to_string(), value.to_string()));
    }

    attrs
}
