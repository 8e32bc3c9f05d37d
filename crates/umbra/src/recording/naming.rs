//! Recording file names and container formats

use chrono::{DateTime, Local};

/// Container format of a recording, guessed from the stream URL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFormat {
    Mp3,
    Ogg,
    Opus,
    Aac,
    Flac,
    M4a,
}

impl StreamFormat {
    /// Guess from URL hints such as `.ogg` or `/aac`. Defaults to MP3.
    pub fn from_url(url: &str) -> Self {
        let url = url.to_ascii_lowercase();
        let hints = |ext: &str| url.contains(&format!(".{ext}")) || url.contains(&format!("/{ext}"));

        if hints("ogg") || url.contains("vorbis") {
            StreamFormat::Ogg
        } else if hints("opus") {
            StreamFormat::Opus
        } else if hints("aac") {
            StreamFormat::Aac
        } else if hints("flac") {
            StreamFormat::Flac
        } else if url.contains(".m4a") {
            StreamFormat::M4a
        } else {
            StreamFormat::Mp3
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            StreamFormat::Mp3 => "mp3",
            StreamFormat::Ogg => "ogg",
            StreamFormat::Opus => "opus",
            StreamFormat::Aac => "aac",
            StreamFormat::Flac => "flac",
            StreamFormat::M4a => "m4a",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            StreamFormat::Mp3 => "audio/mpeg",
            StreamFormat::Ogg => "audio/ogg",
            StreamFormat::Opus => "audio/opus",
            StreamFormat::Aac => "audio/aac",
            StreamFormat::Flac => "audio/flac",
            StreamFormat::M4a => "audio/mp4",
        }
    }
}

/// Keep ASCII letters, digits and whitespace; whitespace runs become `_`
pub fn sanitize_station_name(name: &str) -> String {
    let kept: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || c.is_whitespace())
        .collect();

    let mut out = String::with_capacity(kept.len());
    let mut in_space = false;
    for c in kept.chars() {
        if c.is_whitespace() {
            if !in_space {
                out.push('_');
            }
            in_space = true;
        } else {
            out.push(c);
            in_space = false;
        }
    }
    out
}

/// `{station}_{YYYYMMDD_HHMMSS}.{ext}`
pub fn recording_file_name(station: &str, format: StreamFormat, at: DateTime<Local>) -> String {
    let mut name = sanitize_station_name(station);
    if name.is_empty() {
        name.push_str("recording");
    }
    format!("{name}_{}.{}", at.format("%Y%m%d_%H%M%S"), format.extension())
}
