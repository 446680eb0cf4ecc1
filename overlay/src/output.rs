//! Output (monitor) tracking
//!
//! The tracker is the only writer of the output set. Backends feed it
//! [`OutputEvent`]s; everybody else reads geometry by [`OutputId`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};

use tracing::{debug, info};

/// Compositor-assigned output identifier (the registry global name on Wayland)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutputId(pub u32);

impl fmt::Display for OutputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Logical geometry of an output in the global compositor space
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutputGeometry {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    /// Pixels per logical unit
    pub scale: f64,
}

impl OutputGeometry {
    /// Unscaled output at the origin
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
            scale: 1.0,
        }
    }

    pub fn at(mut self, x: i32, y: i32) -> Self {
        self.x = x;
        self.y = y;
        self
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// A connected display output
#[derive(Debug, Clone, PartialEq)]
pub struct Output {
    pub id: OutputId,
    /// Connector name, e.g. `DP-1`
    pub name: String,
    /// Human-readable description, may be empty
    pub description: String,
    pub geometry: OutputGeometry,
}

impl Output {
    pub fn new(id: OutputId, name: impl Into<String>, geometry: OutputGeometry) -> Self {
        Self {
            id,
            name: name.into(),
            description: String::new(),
            geometry,
        }
    }
}

/// Output set change as reported by the compositor
#[derive(Debug, Clone, PartialEq)]
pub enum OutputEvent {
    Added(Output),
    Removed(OutputId),
    GeometryChanged(OutputId, OutputGeometry),
}

impl OutputEvent {
    pub fn output_id(&self) -> OutputId {
        match self {
            Self::Added(output) => output.id,
            Self::Removed(id) | Self::GeometryChanged(id, _) => *id,
        }
    }
}

/// Receiving end of [`OutputTracker::subscribe`].
///
/// Yields every change applied after the subscription was taken, in order.
/// The stream never ends on its own; it is not restartable.
#[derive(Debug)]
pub struct OutputSubscription {
    rx: Receiver<OutputEvent>,
}

impl OutputSubscription {
    /// Next queued change, if any
    pub fn try_next(&self) -> Option<OutputEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// All changes queued so far
    pub fn drain(&self) -> impl Iterator<Item = OutputEvent> + '_ {
        self.rx.try_iter()
    }
}

/// Authoritative view of connected outputs
#[derive(Debug, Default)]
pub struct OutputTracker {
    outputs: BTreeMap<OutputId, Output>,
    subscribers: Vec<Sender<OutputEvent>>,
}

impl OutputTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a compositor report. Returns false for events that changed nothing
    /// (removal of an unknown output, geometry of an unknown output, identical geometry).
    pub fn apply(&mut self, event: OutputEvent) -> bool {
        let changed = match &event {
            OutputEvent::Added(output) => {
                info!(
                    output = %output.id,
                    name = %output.name,
                    width = output.geometry.width,
                    height = output.geometry.height,
                    scale = output.geometry.scale,
                    "Output added"
                );
                self.outputs.insert(output.id, output.clone());
                true
            }
            OutputEvent::Removed(id) => {
                let removed = self.outputs.remove(id);
                if let Some(output) = &removed {
                    info!(output = %id, name = %output.name, "Output removed");
                } else {
                    debug!(output = %id, "Removal of unknown output ignored");
                }
                removed.is_some()
            }
            OutputEvent::GeometryChanged(id, geometry) => match self.outputs.get_mut(id) {
                Some(output) if output.geometry != *geometry => {
                    info!(output = %id, ?geometry, "Output geometry changed");
                    output.geometry = *geometry;
                    true
                }
                Some(_) => false,
                None => {
                    debug!(output = %id, "Geometry change for unknown output ignored");
                    false
                }
            },
        };

        if changed {
            self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
        changed
    }

    /// Connected outputs ordered by id
    pub fn list_outputs(&self) -> Vec<&Output> {
        self.outputs.values().collect()
    }

    pub fn get(&self, id: OutputId) -> Option<&Output> {
        self.outputs.get(&id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Output> {
        self.outputs.values().find(|o| o.name == name)
    }

    /// The output at the global origin, or the oldest one
    pub fn primary(&self) -> Option<&Output> {
        self.outputs
            .values()
            .find(|o| o.geometry.x == 0 && o.geometry.y == 0)
            .or_else(|| self.outputs.values().next())
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    /// Subscribe to future changes
    pub fn subscribe(&mut self) -> OutputSubscription {
        let (tx, rx) = mpsc::channel();
        self.subscribers.push(tx);
        OutputSubscription { rx }
    }
}
