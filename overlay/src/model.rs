//! Drawing model: validated, output-independent description of an overlay.
//!
//! A [`DrawingModel`] is built once from a client [`DrawingSpec`] plus the
//! active [`Style`] and never mutated afterwards. Layout is pure math over
//! the model and a [`TextMeasure`] implementation.

use std::time::Duration;

use wlosd_types::{Align, AnchorEdge, Color, DrawingSpec, ItemSpec, SizeSpec, Style};

use crate::error::OsdError;
use crate::icons;
use crate::output::OutputGeometry;

/// Icons are drawn larger than the surrounding text
const ICON_SCALE: f32 = 1.5;

/// Larger margins are clamped to this, logical pixels
pub const MAX_MARGIN: i32 = 16384;

#[derive(Debug, Clone, PartialEq)]
pub struct FontSpec {
    pub family: String,
    pub size: f32,
}

/// One drawable element, all style defaults resolved
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    Text {
        text: String,
        font: FontSpec,
        color: Color,
        align: Align,
    },
    Bar {
        fraction: f32,
        fill: Color,
        background: Color,
    },
    Icon {
        glyph: char,
        font: FontSpec,
        color: Color,
    },
}

/// Edges the surface is anchored to. No edge at all means centered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Anchor {
    pub top: bool,
    pub bottom: bool,
    pub left: bool,
    pub right: bool,
}

impl Anchor {
    pub fn from_edges(edges: &[AnchorEdge]) -> Result<Self, OsdError> {
        let mut anchor = Anchor::default();
        let mut center = false;
        for edge in edges {
            match edge {
                AnchorEdge::Top => anchor.top = true,
                AnchorEdge::Bottom => anchor.bottom = true,
                AnchorEdge::Left => anchor.left = true,
                AnchorEdge::Right => anchor.right = true,
                AnchorEdge::Center => center = true,
            }
        }

        if anchor.top && anchor.bottom {
            return Err(OsdError::invalid("anchor cannot combine top and bottom"));
        }
        if anchor.left && anchor.right {
            return Err(OsdError::invalid("anchor cannot combine left and right"));
        }
        if center && !anchor.is_centered() {
            return Err(OsdError::invalid("anchor cannot combine center with an edge"));
        }
        Ok(anchor)
    }

    pub fn is_centered(&self) -> bool {
        !(self.top || self.bottom || self.left || self.right)
    }
}

/// Where and how large the surface should be
#[derive(Debug, Clone, PartialEq)]
pub struct Placement {
    pub anchor: Anchor,
    /// Distance from each anchored edge, logical pixels
    pub margin: i32,
    pub size: SizeSpec,
}

impl Placement {
    /// Logical room left on an output once margins on anchored edges are taken
    pub fn available(&self, geometry: &OutputGeometry) -> (u32, u32) {
        let margin = self.margin_on((geometry.width, geometry.height)).unsigned_abs();
        let horizontal = margin * (self.anchor.left as u32 + self.anchor.right as u32);
        let vertical = margin * (self.anchor.top as u32 + self.anchor.bottom as u32);
        (
            geometry.width.saturating_sub(horizontal).max(1),
            geometry.height.saturating_sub(vertical).max(1),
        )
    }

    /// Top-left corner of a `size` surface, relative to the output origin
    pub fn position(&self, output: (u32, u32), size: (u32, u32)) -> (i32, i32) {
        let margin = i64::from(self.margin_on(output));
        let axis = |start: bool, end: bool, out: u32, len: u32| -> i32 {
            let (out, len) = (i64::from(out), i64::from(len));
            let pos = if start {
                margin
            } else if end {
                out - len - margin
            } else {
                (out - len) / 2
            };
            pos.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
        };
        (
            axis(self.anchor.left, self.anchor.right, output.0, size.0),
            axis(self.anchor.top, self.anchor.bottom, output.1, size.1),
        )
    }

    /// Margin actually applied on an output: never more than its shorter side
    pub fn margin_on(&self, output: (u32, u32)) -> i32 {
        let extent = i32::try_from(output.0.min(output.1)).unwrap_or(i32::MAX);
        self.margin.clamp(0, extent)
    }
}

/// Background panel and bar geometry taken from the style
#[derive(Debug, Clone, PartialEq)]
pub struct Panel {
    pub background: Color,
    pub padding: f32,
    pub spacing: f32,
    pub corner_radius: f32,
    pub bar_width: f32,
    pub bar_height: f32,
}

/// Font metrics provider used by layout
pub trait TextMeasure {
    /// Logical (width, height) of `text` set in `font`
    fn measure_text(&mut self, text: &str, font: &FontSpec) -> (f32, f32);
}

/// Axis-aligned rectangle in logical pixels, relative to the surface
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// Result of laying a model out: surface size plus one rect per item
#[derive(Debug, Clone, PartialEq)]
pub struct Layout {
    pub width: u32,
    pub height: u32,
    pub rows: Vec<Rect>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DrawingModel {
    items: Vec<Item>,
    placement: Placement,
    panel: Panel,
    timeout: Option<Duration>,
    output: Option<String>,
}

impl DrawingModel {
    /// Validate `spec` and resolve every default against `style`
    pub fn build(spec: &DrawingSpec, style: &Style) -> Result<Self, OsdError> {
        if spec.items.is_empty() {
            return Err(OsdError::invalid("drawing spec has no items"));
        }
        check_font_size(style.font_size)?;

        let items = spec
            .items
            .iter()
            .map(|item| resolve_item(item, style))
            .collect::<Result<Vec<_>, _>>()?;

        let anchor = Anchor::from_edges(&spec.anchor)?;

        let margin = spec.margin.unwrap_or(style.margin);
        if margin < 0 {
            return Err(OsdError::invalid(format!("negative margin {margin}")));
        }
        let margin = margin.min(MAX_MARGIN);

        if let SizeSpec::Fixed { width, height } = spec.size
            && (width == 0 || height == 0)
        {
            return Err(OsdError::invalid(format!(
                "fixed size {width}x{height} has a zero dimension"
            )));
        }

        let timeout = spec
            .timeout_secs
            .map(|secs| {
                if !secs.is_finite() || secs < 0.0 {
                    return Err(OsdError::invalid(format!("invalid timeout {secs}")));
                }
                Duration::try_from_secs_f32(secs)
                    .map_err(|e| OsdError::invalid(format!("invalid timeout {secs}: {e}")))
            })
            .transpose()?;

        Ok(Self {
            items,
            placement: Placement {
                anchor,
                margin,
                size: spec.size,
            },
            panel: Panel {
                background: style.background,
                padding: style.padding.max(0.0),
                spacing: style.spacing.max(0.0),
                corner_radius: style.corner_radius.max(0.0),
                bar_width: style.bar_width.max(1.0),
                bar_height: style.bar_height.max(1.0),
            },
            timeout,
            output: spec.output.clone(),
        })
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn placement(&self) -> &Placement {
        &self.placement
    }

    pub fn panel(&self) -> &Panel {
        &self.panel
    }

    /// Timeout requested by the client, if any
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Connector name the overlay is restricted to
    pub fn output(&self) -> Option<&str> {
        self.output.as_deref()
    }

    /// Pixel size the overlay needs within `available` logical pixels
    pub fn measure(&self, available: (u32, u32), metrics: &mut impl TextMeasure) -> (u32, u32) {
        let layout = self.layout(available, metrics);
        (layout.width, layout.height)
    }

    /// Items stacked top to bottom inside the padded panel
    pub fn layout(&self, available: (u32, u32), metrics: &mut impl TextMeasure) -> Layout {
        let panel = &self.panel;
        let natural: Vec<(f32, f32)> = self
            .items
            .iter()
            .map(|item| match item {
                Item::Text { text, font, .. } => metrics.measure_text(text, font),
                Item::Bar { .. } => (panel.bar_width, panel.bar_height),
                Item::Icon { glyph, font, .. } => {
                    let mut buf = [0u8; 4];
                    metrics.measure_text(glyph.encode_utf8(&mut buf), font)
                }
            })
            .collect();

        let gaps = panel.spacing * natural.len().saturating_sub(1) as f32;
        let content_w = natural.iter().fold(0.0f32, |acc, (w, _)| acc.max(*w));
        let content_h = natural.iter().map(|(_, h)| h).sum::<f32>() + gaps;

        let (width, height) = match self.placement.size {
            SizeSpec::ContentFit => (
                (content_w + 2.0 * panel.padding).ceil() as u32,
                (content_h + 2.0 * panel.padding).ceil() as u32,
            ),
            SizeSpec::Fixed { width, height } => (width, height),
        };
        let width = width.min(available.0).max(1);
        let height = height.min(available.1).max(1);

        let inner_w = (width as f32 - 2.0 * panel.padding).max(0.0);
        let inner_h = (height as f32 - 2.0 * panel.padding).max(0.0);

        let mut y = panel.padding + ((inner_h - content_h) / 2.0).max(0.0);
        let mut rows = Vec::with_capacity(self.items.len());
        for (item, (w, h)) in self.items.iter().zip(natural) {
            let (x, row_w) = match item {
                Item::Bar { .. } => (panel.padding, inner_w),
                Item::Text { align, .. } => {
                    let row_w = w.min(inner_w);
                    let x = match align {
                        Align::Left => panel.padding,
                        Align::Center => panel.padding + (inner_w - row_w) / 2.0,
                        Align::Right => panel.padding + inner_w - row_w,
                    };
                    (x, row_w)
                }
                Item::Icon { .. } => {
                    let row_w = w.min(inner_w);
                    (panel.padding + (inner_w - row_w) / 2.0, row_w)
                }
            };
            rows.push(Rect {
                x,
                y,
                width: row_w,
                height: h,
            });
            y += h + panel.spacing;
        }

        Layout {
            width,
            height,
            rows,
        }
    }
}

fn check_font_size(size: f32) -> Result<(), OsdError> {
    if size.is_finite() && size > 0.0 {
        Ok(())
    } else {
        Err(OsdError::invalid(format!("invalid font size {size}")))
    }
}

fn resolve_item(item: &ItemSpec, style: &Style) -> Result<Item, OsdError> {
    match item {
        ItemSpec::Text {
            text,
            font_family,
            font_size,
            color,
            align,
        } => {
            let size = font_size.unwrap_or(style.font_size);
            check_font_size(size)?;
            Ok(Item::Text {
                text: text.clone(),
                font: FontSpec {
                    family: font_family.clone().unwrap_or_else(|| style.font_family.clone()),
                    size,
                },
                color: color.unwrap_or(style.text_color),
                align: align.unwrap_or_default(),
            })
        }
        ItemSpec::Bar {
            fraction,
            fill,
            background,
        } => {
            if !(0.0..=1.0).contains(fraction) {
                return Err(OsdError::invalid(format!(
                    "bar fraction {fraction} is outside [0, 1]"
                )));
            }
            Ok(Item::Bar {
                fraction: *fraction,
                fill: fill.unwrap_or(style.bar_fill),
                background: background.unwrap_or(style.bar_background),
            })
        }
        ItemSpec::Icon { name, color } => {
            let glyph = icons::glyph_for(name)
                .ok_or_else(|| OsdError::invalid(format!("unknown icon '{name}'")))?;
            Ok(Item::Icon {
                glyph,
                font: FontSpec {
                    family: style.font_family.clone(),
                    size: style.font_size * ICON_SCALE,
                },
                color: color.unwrap_or(style.text_color),
            })
        }
    }
}
