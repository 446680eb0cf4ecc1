//! Software renderer using tiny-skia and cosmic-text
//!
//! Rasterizes a [`DrawingModel`] into a surface's RGBA pixel buffer. All
//! rendering is done on the CPU; the same model and output geometry always
//! produce the same pixels.
#![allow(clippy::too_many_arguments)]
use std::collections::HashMap;

use cosmic_text::{
    Attrs, Buffer, Color as CosmicColor, Family, FontSystem, LayoutGlyph, Metrics, Shaping,
    SwashCache,
};
use tiny_skia::{Color, FillRule, Paint, PathBuilder, PixmapMut, Rect, Transform};
use tracing::{debug, warn};
use wlosd_types::Color as Rgba;

use crate::error::OsdError;
use crate::model::{DrawingModel, FontSpec, Item, Layout, TextMeasure};
use crate::output::OutputGeometry;
use crate::platform::{MAX_BUFFER_DIMENSION, OverlaySurface, SurfaceFrame};

/// Maximum entries in the text shaping cache (LRU eviction when exceeded)
const TEXT_CACHE_MAX_ENTRIES: usize = 512;

/// Line height as a multiple of font size
const LINE_HEIGHT: f32 = 1.2;

/// Average advance used to estimate text width when no font is installed
const FALLBACK_ADVANCE: f32 = 0.6;

/// Cached result of text shaping
struct CachedText {
    /// Pre-shaped glyphs with the baseline of their line
    glyphs: Vec<(LayoutGlyph, f32)>,
    width: f32,
    height: f32,
    /// LRU tracking: incremented on each access
    last_used: u64,
}

/// Key for text cache: (text content, font family, font size rounded to tenths)
type TextCacheKey = (String, String, u32);

/// A software renderer for overlay content
pub struct Renderer {
    font_system: FontSystem,
    swash_cache: SwashCache,
    /// False when the font database is empty; text is then measured by estimate and not drawn
    has_fonts: bool,
    /// Cache of shaped text to avoid re-shaping every frame
    text_cache: HashMap<TextCacheKey, CachedText>,
    /// Counter for LRU tracking
    cache_access_counter: u64,
}

impl Renderer {
    /// Create a renderer backed by the system fonts
    pub fn new() -> Self {
        let mut db = fontdb::Database::new();
        db.load_system_fonts();
        Self::with_font_db(db)
    }

    /// Create a renderer with no fonts at all. Text still takes up layout
    /// space but is not drawn, which keeps pixel output independent of the host.
    pub fn without_fonts() -> Self {
        Self::with_font_db(fontdb::Database::new())
    }

    fn with_font_db(db: fontdb::Database) -> Self {
        let locale = sys_locale::get_locale().unwrap_or_else(|| "en-US".to_string());
        let has_fonts = db.faces().next().is_some();
        if !has_fonts {
            warn!("No fonts available, text will not be drawn");
        }
        Self {
            font_system: FontSystem::new_with_locale_and_db(locale, db),
            swash_cache: SwashCache::new(),
            has_fonts,
            text_cache: HashMap::with_capacity(256),
            cache_access_counter: 0,
        }
    }

    /// Draw `model` onto `surface` for an output with the given geometry and commit it.
    ///
    /// Returns the frame that was presented.
    pub fn render<S: OverlaySurface>(
        &mut self,
        surface: &mut S,
        model: &DrawingModel,
        geometry: &OutputGeometry,
    ) -> Result<SurfaceFrame, OsdError> {
        let output = surface.output();
        if geometry.is_empty() {
            return Err(OsdError::surface(output, "zero-size output"));
        }
        if !(geometry.scale.is_finite() && geometry.scale > 0.0) {
            return Err(OsdError::surface(
                output,
                format!("invalid scale factor {}", geometry.scale),
            ));
        }

        let placement = model.placement();
        let layout = model.layout(placement.available(geometry), self);
        let (x, y) = placement.position(
            (geometry.width, geometry.height),
            (layout.width, layout.height),
        );

        let frame = SurfaceFrame {
            anchor: placement.anchor,
            margin: placement.margin_on((geometry.width, geometry.height)),
            x,
            y,
            width: layout.width,
            height: layout.height,
            scale: geometry.scale,
            buffer_width: to_physical(layout.width, geometry.scale),
            buffer_height: to_physical(layout.height, geometry.scale),
        };
        if frame.buffer_width > MAX_BUFFER_DIMENSION || frame.buffer_height > MAX_BUFFER_DIMENSION
        {
            return Err(OsdError::surface(
                output,
                format!(
                    "buffer {}x{} exceeds {MAX_BUFFER_DIMENSION}",
                    frame.buffer_width, frame.buffer_height
                ),
            ));
        }

        surface.configure(&frame)?;
        let buffer = surface.pixel_buffer();
        if buffer.len() != frame.buffer_len() {
            return Err(OsdError::surface(
                output,
                format!(
                    "pixel buffer holds {} bytes, frame needs {}",
                    buffer.len(),
                    frame.buffer_len()
                ),
            ));
        }
        self.paint(buffer, &frame, model, &layout);
        surface.commit()?;

        debug!(
            output = %output,
            width = frame.width,
            height = frame.height,
            x = frame.x,
            y = frame.y,
            "Frame committed"
        );
        Ok(frame)
    }

    /// Clear and paint every item in list order (later items on top)
    fn paint(&mut self, buffer: &mut [u8], frame: &SurfaceFrame, model: &DrawingModel, layout: &Layout) {
        let (bw, bh) = (frame.buffer_width, frame.buffer_height);
        let scale = frame.scale as f32;
        let panel = model.panel();

        self.clear(buffer, bw, bh, Color::TRANSPARENT);
        self.fill_rounded_rect(
            buffer,
            bw,
            bh,
            0.0,
            0.0,
            bw as f32,
            bh as f32,
            panel.corner_radius * scale,
            color_from_rgba(panel.background),
        );

        for (item, row) in model.items().iter().zip(&layout.rows) {
            let x = (row.x * scale).round();
            let y = (row.y * scale).round();
            let w = (row.width * scale).round();
            let h = (row.height * scale).round();

            match item {
                Item::Text {
                    text, font, color, ..
                } => {
                    let font = scaled_font(font, scale);
                    self.draw_text(buffer, bw, bh, text, x, y, &font, color_from_rgba(*color));
                }
                Item::Icon { glyph, font, color } => {
                    let font = scaled_font(font, scale);
                    let mut utf8 = [0u8; 4];
                    let text = glyph.encode_utf8(&mut utf8);
                    self.draw_text(buffer, bw, bh, text, x, y, &font, color_from_rgba(*color));
                }
                Item::Bar {
                    fraction,
                    fill,
                    background,
                } => {
                    let radius = h / 2.0;
                    self.fill_rounded_rect(
                        buffer,
                        bw,
                        bh,
                        x,
                        y,
                        w,
                        h,
                        radius,
                        color_from_rgba(*background),
                    );
                    let filled = bar_fill_px(*fraction, w as u32);
                    if filled > 0 {
                        self.fill_rounded_rect(
                            buffer,
                            bw,
                            bh,
                            x,
                            y,
                            filled as f32,
                            h,
                            radius,
                            color_from_rgba(*fill),
                        );
                    }
                }
            }
        }
    }

    /// Evict least recently used entries if cache is too large
    fn evict_lru_if_needed(&mut self) {
        if self.text_cache.len() <= TEXT_CACHE_MAX_ENTRIES {
            return;
        }

        // Find the oldest entries to remove (remove ~25% of cache)
        let target_size = TEXT_CACHE_MAX_ENTRIES * 3 / 4;
        let mut entries: Vec<_> = self
            .text_cache
            .iter()
            .map(|(k, v)| (k.clone(), v.last_used))
            .collect();
        entries.sort_by_key(|(_, last_used)| *last_used);

        for (key, _) in entries
            .into_iter()
            .take(self.text_cache.len() - target_size)
        {
            self.text_cache.remove(&key);
        }
    }

    /// Find cached entry by borrowed key (avoids String allocation on hit)
    fn find_cached(&mut self, text: &str, family: &str, size_key: u32) -> Option<&mut CachedText> {
        // Overlays carry a handful of strings, a linear scan beats allocating a key
        self.text_cache
            .iter_mut()
            .find(|(k, _)| k.0 == text && k.1 == family && k.2 == size_key)
            .map(|(_, v)| v)
    }

    /// Ensure text is cached, shaping if needed. Returns (width, height).
    fn ensure_cached(&mut self, text: &str, font: &FontSpec) -> (f32, f32) {
        let size_key = (font.size * 10.0).round() as u32;

        self.cache_access_counter += 1;
        let current_access = self.cache_access_counter;

        if let Some(cached) = self.find_cached(text, &font.family, size_key) {
            cached.last_used = current_access;
            return (cached.width, cached.height);
        }

        let metrics = Metrics::new(font.size, font.size * LINE_HEIGHT);
        let mut text_buffer = Buffer::new(&mut self.font_system, metrics);

        let attrs = Attrs::new().family(family(&font.family));
        text_buffer.set_text(&mut self.font_system, text, &attrs, Shaping::Advanced, None);
        text_buffer.shape_until_scroll(&mut self.font_system, false);

        let mut glyphs = Vec::new();
        let mut width = 0.0f32;
        let mut height = 0.0f32;

        for run in text_buffer.layout_runs() {
            width = width.max(run.line_w);
            height += run.line_height;

            for glyph in run.glyphs.iter() {
                glyphs.push((glyph.clone(), run.line_y));
            }
        }

        let cached = CachedText {
            glyphs,
            width,
            height,
            last_used: current_access,
        };

        let cache_key = (text.to_string(), font.family.clone(), size_key);
        self.text_cache.insert(cache_key, cached);
        self.evict_lru_if_needed();

        (width, height)
    }

    /// Get cached glyphs for drawing. Must call ensure_cached first.
    fn get_cached_glyphs(&mut self, text: &str, font: &FontSpec) -> Vec<(LayoutGlyph, f32)> {
        let size_key = (font.size * 10.0).round() as u32;
        self.find_cached(text, &font.family, size_key)
            .map(|c| c.glyphs.clone())
            .unwrap_or_default()
    }

    /// Clear a pixel buffer with a color
    pub fn clear(&self, buffer: &mut [u8], width: u32, height: u32, color: Color) {
        if let Some(mut pixmap) = PixmapMut::from_bytes(buffer, width, height) {
            pixmap.fill(color);
        }
    }

    /// Draw a filled rectangle
    pub fn fill_rect(
        &self,
        buffer: &mut [u8],
        width: u32,
        height: u32,
        x: f32,
        y: f32,
        w: f32,
        h: f32,
        color: Color,
    ) {
        let Some(mut pixmap) = PixmapMut::from_bytes(buffer, width, height) else {
            return;
        };

        let Some(rect) = Rect::from_xywh(x, y, w, h) else {
            return;
        };

        let mut paint = Paint::default();
        paint.set_color(color);
        paint.anti_alias = true;

        pixmap.fill_rect(rect, &paint, Transform::identity(), None);
    }

    /// Draw a rounded rectangle (filled)
    pub fn fill_rounded_rect(
        &self,
        buffer: &mut [u8],
        width: u32,
        height: u32,
        x: f32,
        y: f32,
        w: f32,
        h: f32,
        radius: f32,
        color: Color,
    ) {
        if radius <= 0.0 {
            self.fill_rect(buffer, width, height, x, y, w, h, color);
            return;
        }

        let Some(mut pixmap) = PixmapMut::from_bytes(buffer, width, height) else {
            return;
        };

        let Some(path) = create_rounded_rect_path(x, y, w, h, radius) else {
            return;
        };

        let mut paint = Paint::default();
        paint.set_color(color);
        paint.anti_alias = true;

        pixmap.fill_path(
            &path,
            &paint,
            FillRule::Winding,
            Transform::identity(),
            None,
        );
    }

    /// Draw text with its top-left corner at (x, y) (uses shaping cache)
    pub fn draw_text(
        &mut self,
        buffer: &mut [u8],
        buf_width: u32,
        buf_height: u32,
        text: &str,
        x: f32,
        y: f32,
        font: &FontSpec,
        color: Color,
    ) {
        if !self.has_fonts || text.is_empty() {
            return;
        }

        let Some(mut pixmap) = PixmapMut::from_bytes(buffer, buf_width, buf_height) else {
            return;
        };

        let _ = self.ensure_cached(text, font);

        // Still need a clone: swash_cache needs &mut self while glyphs are borrowed
        let glyphs = self.get_cached_glyphs(text, font);

        let text_color = CosmicColor::rgba(
            (color.red() * 255.0) as u8,
            (color.green() * 255.0) as u8,
            (color.blue() * 255.0) as u8,
            (color.alpha() * 255.0) as u8,
        );

        for (glyph, line_y) in &glyphs {
            let physical_glyph = glyph.physical((x, y + line_y), 1.0);

            if let Some(image) = self
                .swash_cache
                .get_image(&mut self.font_system, physical_glyph.cache_key)
            {
                let glyph_x = physical_glyph.x + image.placement.left;
                let glyph_y = physical_glyph.y - image.placement.top;

                draw_glyph_to_pixmap(
                    &mut pixmap,
                    &image.data,
                    image.placement.width,
                    image.placement.height,
                    glyph_x,
                    glyph_y,
                    text_color,
                );
            }
        }
    }
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new()
    }
}

impl TextMeasure for Renderer {
    fn measure_text(&mut self, text: &str, font: &FontSpec) -> (f32, f32) {
        if self.has_fonts {
            return self.ensure_cached(text, font);
        }
        let widest = text.lines().map(|l| l.chars().count()).max().unwrap_or(0);
        let lines = text.lines().count().max(1);
        (
            widest as f32 * font.size * FALLBACK_ADVANCE,
            lines as f32 * font.size * LINE_HEIGHT,
        )
    }
}

/// Filled pixels of a bar `width_px` wide. Ties round away from zero.
pub fn bar_fill_px(fraction: f32, width_px: u32) -> u32 {
    let filled = (f64::from(fraction.clamp(0.0, 1.0)) * f64::from(width_px)).round();
    (filled as u32).min(width_px)
}

/// Logical length to buffer pixels, never below one pixel
fn to_physical(logical: u32, scale: f64) -> u32 {
    (f64::from(logical) * scale).round().max(1.0) as u32
}

/// Convert [u8; 4] RGBA array to tiny_skia Color
#[inline]
pub fn color_from_rgba(rgba: Rgba) -> Color {
    Color::from_rgba8(rgba[0], rgba[1], rgba[2], rgba[3])
}

fn scaled_font(font: &FontSpec, scale: f32) -> FontSpec {
    FontSpec {
        family: font.family.clone(),
        size: font.size * scale,
    }
}

/// Generic CSS family names map to fontdb's generic families
fn family(name: &str) -> Family<'_> {
    match name.to_ascii_lowercase().as_str() {
        "sans" | "sans-serif" => Family::SansSerif,
        "serif" => Family::Serif,
        "mono" | "monospace" => Family::Monospace,
        _ => Family::Name(name),
    }
}

/// Create a rounded rectangle path
fn create_rounded_rect_path(x: f32, y: f32, w: f32, h: f32, r: f32) -> Option<tiny_skia::Path> {
    let r = r.min(w / 2.0).min(h / 2.0);

    let mut pb = PathBuilder::new();

    // Start at top-left, after the corner
    pb.move_to(x + r, y);

    // Top edge and top-right corner
    pb.line_to(x + w - r, y);
    pb.quad_to(x + w, y, x + w, y + r);

    // Right edge and bottom-right corner
    pb.line_to(x + w, y + h - r);
    pb.quad_to(x + w, y + h, x + w - r, y + h);

    // Bottom edge and bottom-left corner
    pb.line_to(x + r, y + h);
    pb.quad_to(x, y + h, x, y + h - r);

    // Left edge and top-left corner
    pb.line_to(x, y + r);
    pb.quad_to(x, y, x + r, y);

    pb.close();
    pb.finish()
}

/// Draw a glyph image onto a pixmap with alpha blending
fn draw_glyph_to_pixmap(
    pixmap: &mut PixmapMut,
    glyph_data: &[u8],
    glyph_width: u32,
    glyph_height: u32,
    dest_x: i32,
    dest_y: i32,
    color: CosmicColor,
) {
    let pixmap_width = pixmap.width() as i32;
    let pixmap_height = pixmap.height() as i32;
    let data = pixmap.data_mut();

    for gy in 0..glyph_height as i32 {
        let py = dest_y + gy;
        if py < 0 || py >= pixmap_height {
            continue;
        }

        for gx in 0..glyph_width as i32 {
            let px = dest_x + gx;
            if px < 0 || px >= pixmap_width {
                continue;
            }

            let glyph_idx = (gy as u32 * glyph_width + gx as u32) as usize;
            let Some(&alpha) = glyph_data.get(glyph_idx) else {
                continue;
            };
            if alpha == 0 {
                continue;
            }

            let pixel_idx = ((py as u32 * pixmap_width as u32 + px as u32) * 4) as usize;
            if pixel_idx + 3 >= data.len() {
                continue;
            }

            // Premultiplied source-over
            let src_a = (alpha as u32 * color.a() as u32) / 255;
            let inv_a = 255 - src_a;

            data[pixel_idx] =
                ((color.r() as u32 * src_a + data[pixel_idx] as u32 * inv_a) / 255) as u8;
            data[pixel_idx + 1] =
                ((color.g() as u32 * src_a + data[pixel_idx + 1] as u32 * inv_a) / 255) as u8;
            data[pixel_idx + 2] =
                ((color.b() as u32 * src_a + data[pixel_idx + 2] as u32 * inv_a) / 255) as u8;
            data[pixel_idx + 3] = (src_a + (data[pixel_idx + 3] as u32 * inv_a) / 255) as u8;
        }
    }
}
