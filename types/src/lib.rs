//! Shared types for wlosd
//!
//! Request payloads (`DrawingSpec` and its parts) and the on-disk
//! configuration (`OsdConfig`, `Style`). Everything here is plain serde data;
//! validation and layout live in `wlosd-overlay`.

use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Color Type
// ─────────────────────────────────────────────────────────────────────────────

/// RGBA color as [r, g, b, a] bytes (straight alpha)
pub type Color = [u8; 4];

pub mod osd_colors {
    use super::Color;

    pub const WHITE: Color = [255, 255, 255, 255];
    pub const TRANSPARENT: Color = [0, 0, 0, 0];
    pub const PANEL_BG: Color = [24, 24, 28, 215];
    pub const BAR_FILL: Color = [235, 235, 235, 255];
    pub const BAR_TRACK: Color = [90, 90, 96, 200];
}

// ─────────────────────────────────────────────────────────────────────────────
// Placement
// ─────────────────────────────────────────────────────────────────────────────

/// One anchor directive. An empty anchor list means centered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnchorEdge {
    Top,
    Bottom,
    Left,
    Right,
    Center,
}

/// Size policy of an overlay surface (logical pixels)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy")]
pub enum SizeSpec {
    /// Grow to fit the content plus padding
    #[default]
    ContentFit,
    Fixed { width: u32, height: u32 },
}

/// Horizontal alignment of a text row inside the panel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Align {
    Left,
    #[default]
    Center,
    Right,
}

// ─────────────────────────────────────────────────────────────────────────────
// Drawing Spec (request payload)
// ─────────────────────────────────────────────────────────────────────────────

/// A single drawable element as requested by a client.
///
/// Optional fields fall back to the active [`Style`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ItemSpec {
    Text {
        text: String,
        #[serde(default)]
        font_family: Option<String>,
        #[serde(default)]
        font_size: Option<f32>,
        #[serde(default)]
        color: Option<Color>,
        #[serde(default)]
        align: Option<Align>,
    },
    Bar {
        /// Fill fraction, must be within [0, 1]
        fraction: f32,
        #[serde(default)]
        fill: Option<Color>,
        #[serde(default)]
        background: Option<Color>,
    },
    Icon {
        /// Symbolic name (`audio-volume-high`) or a single literal glyph
        name: String,
        #[serde(default)]
        color: Option<Color>,
    },
}

impl ItemSpec {
    /// Plain text row with style defaults
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            font_family: None,
            font_size: None,
            color: None,
            align: None,
        }
    }

    /// Progress bar with style colors
    pub fn bar(fraction: f32) -> Self {
        Self::Bar {
            fraction,
            fill: None,
            background: None,
        }
    }

    pub fn icon(name: impl Into<String>) -> Self {
        Self::Icon {
            name: name.into(),
            color: None,
        }
    }
}

/// Everything a client asks to be shown on one channel.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DrawingSpec {
    pub items: Vec<ItemSpec>,
    #[serde(default)]
    pub anchor: Vec<AnchorEdge>,
    /// Distance from anchored edges; `None` uses the style margin
    #[serde(default)]
    pub margin: Option<i32>,
    #[serde(default)]
    pub size: SizeSpec,
    /// Seconds until the overlay hides itself; `None` uses the configured default
    #[serde(default)]
    pub timeout_secs: Option<f32>,
    /// Output connector name (`DP-1`); `None` shows on every output
    #[serde(default)]
    pub output: Option<String>,
}

impl DrawingSpec {
    pub fn new(items: Vec<ItemSpec>) -> Self {
        Self {
            items,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, secs: f32) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_anchor(mut self, anchor: &[AnchorEdge]) -> Self {
        self.anchor = anchor.to_vec();
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Style
// ─────────────────────────────────────────────────────────────────────────────

/// Visual defaults applied to every overlay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Style {
    pub font_family: String,
    pub font_size: f32,
    pub text_color: Color,
    pub background: Color,
    pub bar_fill: Color,
    pub bar_background: Color,
    /// Inner padding around the content, logical pixels
    pub padding: f32,
    /// Vertical gap between stacked items
    pub spacing: f32,
    pub corner_radius: f32,
    pub bar_width: f32,
    pub bar_height: f32,
    pub margin: i32,
}

impl Default for Style {
    fn default() -> Self {
        Self {
            font_family: "Sans".to_string(),
            font_size: 18.0,
            text_color: osd_colors::WHITE,
            background: osd_colors::PANEL_BG,
            bar_fill: osd_colors::BAR_FILL,
            bar_background: osd_colors::BAR_TRACK,
            padding: 14.0,
            spacing: 8.0,
            corner_radius: 10.0,
            bar_width: 240.0,
            bar_height: 10.0,
            margin: 24,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Config File
// ─────────────────────────────────────────────────────────────────────────────

/// Contents of `wlosd.toml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OsdConfig {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Applied to requests without a timeout; `None` keeps them until hidden
    #[serde(default)]
    pub default_timeout_secs: Option<f32>,
    /// Upper bound on how long one loop wait may block
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub style: Style,
}

fn default_namespace() -> String {
    "wlosd".to_string()
}
fn default_poll_interval_ms() -> u64 {
    50
}

impl Default for OsdConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            default_timeout_secs: None,
            poll_interval_ms: default_poll_interval_ms(),
            style: Style::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_keeps_defaults() {
        let cfg: OsdConfig = toml::from_str(
            r#"
            default_timeout_secs = 1.5
            [style]
            font_size = 24.0
            "#,
        )
        .unwrap();

        assert_eq!(cfg.namespace, "wlosd");
        assert_eq!(cfg.default_timeout_secs, Some(1.5));
        assert_eq!(cfg.style.font_size, 24.0);
        assert_eq!(cfg.style.padding, Style::default().padding);
    }

    #[test]
    fn drawing_spec_from_toml() {
        let spec: DrawingSpec = toml::from_str(
            r#"
            anchor = ["top", "right"]
            timeout_secs = 2.0
            size = { policy = "fixed", width = 300, height = 80 }

            [[items]]
            kind = "icon"
            name = "audio-volume-high"

            [[items]]
            kind = "bar"
            fraction = 0.4
            "#,
        )
        .unwrap();

        assert_eq!(spec.anchor, vec![AnchorEdge::Top, AnchorEdge::Right]);
        assert_eq!(
            spec.size,
            SizeSpec::Fixed {
                width: 300,
                height: 80
            }
        );
        assert_eq!(spec.items[1], ItemSpec::bar(0.4));
        assert!(spec.output.is_none());
    }
}
