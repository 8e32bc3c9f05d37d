//! ICY metadata and stream header parsing
//!
//! Pure parsing functions for Icecast/Shoutcast in-band metadata and the
//! response headers that describe a stream.

/// Parse ICY metadata string to extract the StreamTitle value.
///
/// ICY metadata format: `StreamTitle='Artist - Song';StreamUrl='...';`
pub fn parse_icy_metadata(metadata: &str) -> Option<String> {
    let start = metadata.find("StreamTitle='")? + "StreamTitle='".len();
    let end = metadata[start..]
        .find("';")
        .or_else(|| metadata[start..].rfind('\''))?;
    let title = metadata[start..start + end].trim();
    if title.is_empty() {
        None
    } else {
        Some(title.to_string())
    }
}

/// Extract the title from a raw metadata block.
///
/// Blocks are null-padded to a multiple of 16 bytes.
pub fn extract_icy_title(raw_block: &[u8]) -> Option<String> {
    let end = raw_block.iter().rposition(|&b| b != 0)? + 1;
    parse_icy_metadata(&String::from_utf8_lossy(&raw_block[..end]))
}

/// Human-readable codec name from a `Content-Type` header
pub fn codec_from_content_type(content_type: &str) -> Option<&'static str> {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    match mime.as_str() {
        "audio/mpeg" | "audio/mp3" | "audio/mpeg3" => Some("MP3"),
        "audio/aac" | "audio/aacp" | "audio/x-aac" => Some("AAC"),
        "audio/mp4" | "audio/m4a" | "audio/x-m4a" => Some("AAC (MP4)"),
        "audio/ogg" | "application/ogg" | "audio/vorbis" => Some("Ogg Vorbis"),
        "audio/opus" => Some("Opus"),
        "audio/flac" | "audio/x-flac" => Some("FLAC"),
        "audio/wav" | "audio/x-wav" | "audio/wave" => Some("WAV"),
        _ => None,
    }
}

/// Parse an `icy-br` value (kbps, sometimes a comma list) into bits per second
pub fn parse_icy_bitrate(value: &str) -> Option<u32> {
    let kbps: u32 = value.split(',').next()?.trim().parse().ok()?;
    if kbps == 0 {
        return None;
    }
    kbps.checked_mul(1000)
}
