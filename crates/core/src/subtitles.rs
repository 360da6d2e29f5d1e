//! ASS subtitle generation for blinded segment payloads.
//!
//! Each blind label gets its own style in its own colour and vertical
//! position, so both outputs can be burned into one video without naming
//! either producer.

use std::fmt::Write as _;

use crate::blinding::BlindLabel;
use crate::output::Segment;

const ASS_HEADER: &str = "[Script Info]
Title: Blind Comparison Subtitles
ScriptType: v4.00+
Collisions: Normal
PlayDepth: 0

[V4+ Styles]
Format: Name, Fontname, Fontsize, PrimaryColour, SecondaryColour, OutlineColour, BackColour, Bold, Italic, Underline, StrikeOut, ScaleX, ScaleY, Spacing, Angle, BorderStyle, Outline, Shadow, Alignment, MarginL, MarginR, MarginV, Encoding
";

const EVENTS_HEADER: &str = "
[Events]
Format: Layer, Start, End, Style, Name, MarginL, MarginR, MarginV, Effect, Text
";

/// Style name for a label (`Red`, `Yellow`).
pub fn style_name(label: BlindLabel) -> &'static str {
    match label {
        BlindLabel::Red => "Red",
        BlindLabel::Yellow => "Yellow",
    }
}

/// Bottom margin per label, so the two tracks never overlap.
fn margin_v(label: BlindLabel) -> u32 {
    match label {
        BlindLabel::Red => 50,
        BlindLabel::Yellow => 90,
    }
}

/// Format seconds as ASS `H:MM:SS.CC`.
pub fn to_ass_time(seconds: f64) -> String {
    let centis = (seconds.max(0.0) * 100.0).round() as u64;
    let (h, rem) = (centis / 360_000, centis % 360_000);
    let (m, rem) = (rem / 6_000, rem % 6_000);
    let (s, cs) = (rem / 100, rem % 100);
    format!("{h}:{m:02}:{s:02}.{cs:02}")
}

/// Dialogue text: newlines become `\N`, braces would open override tags.
fn escape_text(text: &str) -> String {
    text.replace("\r\n", "\\N")
        .replace('\n', "\\N")
        .replace('{', "(")
        .replace('}', ")")
}

/// Build a complete ASS document with one track per label.
///
/// Segments whose times do not parse, or that end before they start, are
/// skipped and counted in the returned total.
pub fn build_ass(tracks: &[(BlindLabel, &[Segment])]) -> (String, usize) {
    let mut out = String::from(ASS_HEADER);
    for label in BlindLabel::ALL {
        writeln!(
            out,
            "Style: {},Arial,14,{},&H000000FF,&H00000000,&H80000000,0,0,0,0,100,100,0,0,1,2,1,2,10,10,{},1",
            style_name(label),
            label.ass_colour(),
            margin_v(label),
        )
        .ok();
    }
    out.push_str(EVENTS_HEADER);

    let mut skipped = 0;
    for (label, segments) in tracks {
        for segment in segments.iter() {
            let (Some(start), Some(end)) = (segment.start_secs(), segment.end_secs()) else {
                skipped += 1;
                continue;
            };
            if end < start {
                skipped += 1;
                continue;
            }
            writeln!(
                out,
                "Dialogue: 0,{},{},{},,0,0,0,,{}",
                to_ass_time(start),
                to_ass_time(end),
                style_name(*label),
                escape_text(&segment.description),
            )
            .ok();
        }
    }
    (out, skipped)
}
