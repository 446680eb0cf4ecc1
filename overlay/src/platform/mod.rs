//! Platform abstraction for overlay surfaces
//!
//! The engine only ever talks to a [`Backend`]: it provisions one surface per
//! (session, output) pair and reports output hotplug. `wayland` is the real
//! layer-shell backend; `headless` keeps everything in memory.

use std::time::Duration;

use crate::error::OsdError;
use crate::model::{Anchor, Placement};
use crate::output::{Output, OutputEvent, OutputId};

pub mod headless;

#[cfg(all(feature = "wayland", unix, not(target_os = "macos")))]
pub mod wayland;

/// Largest buffer edge a surface may request, physical pixels
pub const MAX_BUFFER_DIMENSION: u32 = 16384;

/// Fully resolved geometry of one rendered frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SurfaceFrame {
    pub anchor: Anchor,
    pub margin: i32,
    /// Output-relative position, logical pixels
    pub x: i32,
    pub y: i32,
    /// Logical size requested from the compositor
    pub width: u32,
    pub height: u32,
    pub scale: f64,
    /// Pixel buffer size after scale rounding
    pub buffer_width: u32,
    pub buffer_height: u32,
}

impl SurfaceFrame {
    /// Bytes in an RGBA buffer of this frame
    pub fn buffer_len(&self) -> usize {
        self.buffer_width as usize * self.buffer_height as usize * 4
    }
}

/// A live, non-interactive overlay surface on one output.
///
/// Dropping the surface destroys it on the compositor side.
pub trait OverlaySurface {
    fn output(&self) -> OutputId;

    /// Apply geometry for the next frame and size the pixel buffer to match
    fn configure(&mut self, frame: &SurfaceFrame) -> Result<(), OsdError>;

    /// Premultiplied RGBA pixels of the configured frame
    fn pixel_buffer(&mut self) -> &mut [u8];

    /// Present the pixel buffer
    fn commit(&mut self) -> Result<(), OsdError>;
}

/// Source of overlay surfaces (compositor binding)
pub trait SurfaceProvider {
    type Surface: OverlaySurface;

    /// Create a surface on `output`. Fails with `SurfaceUnavailable`.
    fn create_surface(
        &mut self,
        output: &Output,
        placement: &Placement,
    ) -> Result<Self::Surface, OsdError>;
}

/// A provider that is also the event source for output changes
pub trait Backend: SurfaceProvider {
    /// Wait up to `timeout` for compositor traffic and return the output
    /// changes it produced, in delivery order.
    fn dispatch(&mut self, timeout: Duration) -> Result<Vec<OutputEvent>, OsdError>;
}
