//! wlosd overlay engine
//!
//! Transient on-screen-display overlays (volume, brightness, notifications)
//! drawn as layer-shell surfaces, one session per channel.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    event_loop                        │
//! │     output events → requests → timers → renders      │
//! │          (single-threaded turn scheduler)            │
//! ├─────────────────────────────────────────────────────┤
//! │                    manager                           │
//! │                 SessionManager                       │
//! │   (channel registry, timer queue, render queue)      │
//! ├─────────────────────────────────────────────────────┤
//! │                    session                           │
//! │                 OverlaySession                       │
//! │      (state machine, one surface per output)         │
//! ├──────────────────────────┬──────────────────────────┤
//! │      model               │      renderer            │
//! │   DrawingModel, layout   │  tiny-skia + cosmic-text │
//! ├──────────────────────────┴──────────────────────────┤
//! │            output              platform/             │
//! │        OutputTracker      wayland, headless          │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod clock;
pub mod error;
pub mod event_loop;
pub mod icons;
pub mod manager;
pub mod model;
pub mod output;
pub mod platform;
pub mod renderer;
pub mod session;
pub mod timer;

#[cfg(test)]
mod manager_tests;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::OsdError;
pub use event_loop::{EventLoop, Request, TurnOutcome};
pub use manager::{ClosedSession, SessionManager};
pub use model::DrawingModel;
pub use output::{Output, OutputEvent, OutputGeometry, OutputId, OutputTracker};
pub use platform::headless::HeadlessBackend;
pub use platform::{Backend, OverlaySurface, SurfaceProvider};
pub use renderer::Renderer;
pub use session::{CloseReason, Deadline, SessionId, SessionState};

#[cfg(all(feature = "wayland", unix, not(target_os = "macos")))]
pub use platform::wayland::WaylandBackend;
