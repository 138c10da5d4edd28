//! Playback statistics parsed from the player's log lines.
//!
//! The player logs its output format on every track change, e.g.
//!
//! ```text
//! 2024-03-01 21:14:07.123 Df Music[812:1a2b] [com.apple.Music:Player] audioCapabilities: asbdSampleRate = 96.0 kHz, sdBitDepth = 24 bit
//! ```
//!
//! Only lines that carry both a leading timestamp and an `asbdSampleRate`
//! field produce a [`PlaybackStat`]; everything else is skipped.

use std::sync::OnceLock;

use chrono::NaiveDateTime;
use regex::Regex;

/// One observation of the player's output format.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackStat {
    pub sample_rate_hz: f64,
    pub bit_depth: Option<u32>,
    pub observed_at: NaiveDateTime,
    /// Source line, kept for diagnostics.
    pub raw: String,
}

fn line_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^(?P<ts>\d{4}-\d{2}-\d{2}[ T]\d{2}:\d{2}:\d{2}(?:\.\d+)?)\S*\s.*?\basbdSampleRate\s*=\s*(?P<rate>\d+(?:\.\d+)?)\s*kHz(?:.*?\bsdBitDepth\s*=\s*(?P<depth>\d+)\s*bit)?",
        )
        .expect("static pattern compiles")
    })
}

fn parse_timestamp(ts: &str) -> Option<NaiveDateTime> {
    let normalized = ts.replacen('T', " ", 1);
    NaiveDateTime::parse_from_str(&normalized, "%Y-%m-%d %H:%M:%S%.f").ok()
}

/// Parse a single log line.  Returns `None` for anything that does not fully
/// match the expected shape.
pub fn parse_line(line: &str) -> Option<PlaybackStat> {
    let caps = line_pattern().captures(line.trim())?;
    let observed_at = parse_timestamp(caps.name("ts")?.as_str())?;
    let khz: f64 = caps.name("rate")?.as_str().parse().ok()?;
    let sample_rate_hz = khz * 1000.0;
    if !sample_rate_hz.is_finite() || sample_rate_hz <= 0.0 {
        return None;
    }
    let bit_depth = caps.name("depth").and_then(|d| d.as_str().parse().ok());

    Some(PlaybackStat {
        sample_rate_hz,
        bit_depth,
        observed_at,
        raw: line.to_string(),
    })
}

/// Lazily parse `lines` (most recent first) into stats, preserving order.
///
/// The returned iterator is single-pass; each detection cycle parses afresh.
pub fn parse_playback_stats<'a, I>(lines: I) -> impl Iterator<Item = PlaybackStat> + 'a
where
    I: IntoIterator<Item = &'a str>,
    I::IntoIter: 'a,
{
    lines.into_iter().filter_map(parse_line)
}
