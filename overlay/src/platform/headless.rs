//! In-memory backend
//!
//! Surfaces are plain pixel buffers. Outputs are added and removed by hand,
//! and per-output failures can be injected. Used by `--headless` and by the
//! engine tests.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::rc::Rc;
use std::time::Duration;

use tracing::debug;

use super::{Backend, OverlaySurface, SurfaceFrame, SurfaceProvider};
use crate::error::OsdError;
use crate::model::Placement;
use crate::output::{Output, OutputEvent, OutputGeometry, OutputId};

/// Surface bookkeeping shared between the backend and its surfaces
#[derive(Debug, Default)]
struct Registry {
    /// Live surface count per output
    live: BTreeMap<OutputId, usize>,
    created: usize,
    destroyed: usize,
    failing_commits: HashSet<OutputId>,
}

/// Backend with virtual outputs
#[derive(Debug, Default)]
pub struct HeadlessBackend {
    next_id: u32,
    outputs: BTreeMap<OutputId, Output>,
    pending: VecDeque<OutputEvent>,
    failing_outputs: HashSet<OutputId>,
    registry: Rc<RefCell<Registry>>,
}

impl HeadlessBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend with a single output named `HEADLESS-1`
    pub fn with_output(width: u32, height: u32) -> Self {
        let mut backend = Self::new();
        backend.add_output("HEADLESS-1", OutputGeometry::new(width, height));
        backend
    }

    /// Connect a virtual output; reported on the next dispatch
    pub fn add_output(&mut self, name: &str, geometry: OutputGeometry) -> OutputId {
        self.next_id += 1;
        let id = OutputId(self.next_id);
        let output = Output::new(id, name, geometry);
        self.outputs.insert(id, output.clone());
        self.pending.push_back(OutputEvent::Added(output));
        id
    }

    pub fn remove_output(&mut self, id: OutputId) {
        if self.outputs.remove(&id).is_some() {
            self.pending.push_back(OutputEvent::Removed(id));
        }
    }

    pub fn set_geometry(&mut self, id: OutputId, geometry: OutputGeometry) {
        if let Some(output) = self.outputs.get_mut(&id) {
            output.geometry = geometry;
            self.pending.push_back(OutputEvent::GeometryChanged(id, geometry));
        }
    }

    /// Make surface creation on `id` fail
    pub fn fail_output(&mut self, id: OutputId) {
        self.failing_outputs.insert(id);
    }

    /// Make commits of surfaces on `id` fail
    pub fn fail_commits(&mut self, id: OutputId) {
        self.registry.borrow_mut().failing_commits.insert(id);
    }

    pub fn heal(&mut self, id: OutputId) {
        self.failing_outputs.remove(&id);
        self.registry.borrow_mut().failing_commits.remove(&id);
    }

    /// Surfaces currently alive across all outputs
    pub fn live_surfaces(&self) -> usize {
        self.registry.borrow().live.values().sum()
    }

    pub fn live_surfaces_on(&self, id: OutputId) -> usize {
        self.registry.borrow().live.get(&id).copied().unwrap_or(0)
    }

    pub fn created_surfaces(&self) -> usize {
        self.registry.borrow().created
    }

    pub fn destroyed_surfaces(&self) -> usize {
        self.registry.borrow().destroyed
    }
}

impl SurfaceProvider for HeadlessBackend {
    type Surface = HeadlessSurface;

    fn create_surface(
        &mut self,
        output: &Output,
        _placement: &Placement,
    ) -> Result<HeadlessSurface, OsdError> {
        if !self.outputs.contains_key(&output.id) {
            return Err(OsdError::surface(output.id, "output is not connected"));
        }
        if self.failing_outputs.contains(&output.id) {
            return Err(OsdError::surface(output.id, "layer surface refused"));
        }
        if output.geometry.is_empty() {
            return Err(OsdError::surface(output.id, "zero-size output"));
        }

        {
            let mut registry = self.registry.borrow_mut();
            registry.created += 1;
            *registry.live.entry(output.id).or_default() += 1;
        }
        debug!(output = %output.id, "Headless surface created");
        Ok(HeadlessSurface {
            output: output.id,
            frame: None,
            pixels: Vec::new(),
            commits: 0,
            registry: Some(Rc::clone(&self.registry)),
        })
    }
}

impl Backend for HeadlessBackend {
    fn dispatch(&mut self, timeout: Duration) -> Result<Vec<OutputEvent>, OsdError> {
        if self.pending.is_empty() && !timeout.is_zero() {
            std::thread::sleep(timeout);
        }
        Ok(self.pending.drain(..).collect())
    }
}

/// A pixel buffer standing in for a layer surface
#[derive(Debug)]
pub struct HeadlessSurface {
    output: OutputId,
    frame: Option<SurfaceFrame>,
    pixels: Vec<u8>,
    commits: usize,
    registry: Option<Rc<RefCell<Registry>>>,
}

impl HeadlessSurface {
    /// Surface not tracked by any backend
    pub fn detached(output: OutputId) -> Self {
        Self {
            output,
            frame: None,
            pixels: Vec::new(),
            commits: 0,
            registry: None,
        }
    }

    /// Frame of the last `configure`
    pub fn frame(&self) -> Option<&SurfaceFrame> {
        self.frame.as_ref()
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn commits(&self) -> usize {
        self.commits
    }
}

impl OverlaySurface for HeadlessSurface {
    fn output(&self) -> OutputId {
        self.output
    }

    fn configure(&mut self, frame: &SurfaceFrame) -> Result<(), OsdError> {
        self.pixels.resize(frame.buffer_len(), 0);
        self.frame = Some(*frame);
        Ok(())
    }

    fn pixel_buffer(&mut self) -> &mut [u8] {
        &mut self.pixels
    }

    fn commit(&mut self) -> Result<(), OsdError> {
        if let Some(registry) = &self.registry
            && registry.borrow().failing_commits.contains(&self.output)
        {
            return Err(OsdError::surface(self.output, "commit rejected"));
        }
        self.commits += 1;
        Ok(())
    }
}

impl Drop for HeadlessSurface {
    fn drop(&mut self) {
        if let Some(registry) = &self.registry {
            let mut registry = registry.borrow_mut();
            registry.destroyed += 1;
            if let Some(live) = registry.live.get_mut(&self.output) {
                *live = live.saturating_sub(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Anchor;
    use wlosd_types::SizeSpec;

    fn placement() -> Placement {
        Placement {
            anchor: Anchor::default(),
            margin: 0,
            size: SizeSpec::ContentFit,
        }
    }

    #[test]
    fn hotplug_is_reported_in_order() {
        let mut backend = HeadlessBackend::new();
        let a = backend.add_output("DP-1", OutputGeometry::new(1920, 1080));
        let b = backend.add_output("DP-2", OutputGeometry::new(1280, 1024));
        backend.remove_output(a);

        let events = backend.dispatch(Duration::ZERO).unwrap();
        let ids: Vec<OutputId> = events.iter().map(OutputEvent::output_id).collect();
        assert_eq!(ids, vec![a, b, a]);
        assert!(matches!(events[2], OutputEvent::Removed(_)));
        assert!(backend.dispatch(Duration::ZERO).unwrap().is_empty());
    }

    #[test]
    fn surfaces_are_counted_until_dropped() {
        let mut backend = HeadlessBackend::with_output(800, 600);
        let output = match backend.dispatch(Duration::ZERO).unwrap().remove(0) {
            OutputEvent::Added(output) => output,
            other => panic!("unexpected {other:?}"),
        };

        let first = backend.create_surface(&output, &placement()).unwrap();
        let second = backend.create_surface(&output, &placement()).unwrap();
        assert_eq!(backend.live_surfaces_on(output.id), 2);

        drop(first);
        assert_eq!(backend.live_surfaces(), 1);
        drop(second);
        assert_eq!(backend.live_surfaces(), 0);
        assert_eq!(backend.destroyed_surfaces(), 2);
    }

    #[test]
    fn injected_failures() {
        let mut backend = HeadlessBackend::with_output(800, 600);
        let output = backend.outputs.values().next().cloned().unwrap();

        backend.fail_output(output.id);
        assert!(backend.create_surface(&output, &placement()).is_err());

        backend.heal(output.id);
        let mut surface = backend.create_surface(&output, &placement()).unwrap();
        backend.fail_commits(output.id);
        assert!(surface.commit().is_err());
        assert_eq!(surface.commits(), 0);
    }
}
