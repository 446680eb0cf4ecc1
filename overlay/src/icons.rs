//! Symbolic icon names resolved to font glyphs.
//!
//! Names follow the freedesktop icon naming spec where a matching Unicode
//! symbol exists. Any single character is accepted verbatim as its own glyph.

use phf::phf_map;

/// Icon name -> glyph lookup table
pub static ICON_GLYPHS: phf::Map<&'static str, char> = phf_map! {
    // ═══════════════════════════════════════════════════════════════════════════
    // Audio
    // ═══════════════════════════════════════════════════════════════════════════
    "audio-volume-high" => '\u{1F50A}',
    "audio-volume-medium" => '\u{1F509}',
    "audio-volume-low" => '\u{1F508}',
    "audio-volume-muted" => '\u{1F507}',
    "microphone" => '\u{1F3A4}',
    "audio-headphones" => '\u{1F3A7}',

    // ═══════════════════════════════════════════════════════════════════════════
    // Display / power
    // ═══════════════════════════════════════════════════════════════════════════
    "display-brightness" => '\u{2600}',
    "display-brightness-low" => '\u{263C}',
    "battery" => '\u{1F50B}',
    "ac-adapter" => '\u{1F50C}',
    "system-shutdown" => '\u{23FB}',

    // ═══════════════════════════════════════════════════════════════════════════
    // Media
    // ═══════════════════════════════════════════════════════════════════════════
    "media-playback-start" => '\u{25B6}',
    "media-playback-pause" => '\u{23F8}',
    "media-playback-stop" => '\u{23F9}',
    "media-skip-forward" => '\u{23ED}',
    "media-skip-backward" => '\u{23EE}',

    // ═══════════════════════════════════════════════════════════════════════════
    // Input / status
    // ═══════════════════════════════════════════════════════════════════════════
    "input-keyboard" => '\u{2328}',
    "caps-lock" => '\u{21EA}',
    "network-wireless" => '\u{1F4F6}',
    "dialog-information" => '\u{2139}',
    "dialog-warning" => '\u{26A0}',
    "emblem-ok" => '\u{2714}',
};

/// Resolve an icon name to the glyph that draws it
pub fn glyph_for(name: &str) -> Option<char> {
    let mut chars = name.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Some(c),
        _ => ICON_GLYPHS.get(name).copied(),
    }
}
