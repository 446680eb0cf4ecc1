//! Wayland backend using the wlr-layer-shell protocol
//!
//! Works on compositors that implement `zwlr_layer_shell_v1` (wlroots-based
//! ones like Sway and Hyprland, KDE, ...). Every overlay is a non-interactive
//! layer surface on the `overlay` layer with an empty input region.
//!
//! Outputs are identified by their registry global name, which stays stable
//! for as long as the output is connected.

use std::fs::File;
use std::os::fd::AsFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use memmap2::MmapMut;
use rustix::event::{PollFd, PollFlags};
use rustix::fs::{MemfdFlags, memfd_create};
use rustix::time::Timespec;
use tracing::{debug, error, info, warn};
use wayland_client::globals::{GlobalListContents, registry_queue_init};
use wayland_client::protocol::wl_buffer::{self, WlBuffer};
use wayland_client::protocol::wl_compositor::WlCompositor;
use wayland_client::protocol::wl_output::{self, WlOutput};
use wayland_client::protocol::wl_region::WlRegion;
use wayland_client::protocol::wl_registry::{self, WlRegistry};
use wayland_client::protocol::wl_shm::{Format, WlShm};
use wayland_client::protocol::wl_shm_pool::WlShmPool;
use wayland_client::protocol::wl_surface::WlSurface;
use wayland_client::{Connection, Dispatch, EventQueue, Proxy, QueueHandle, WEnum};
use wayland_protocols::xdg::xdg_output::zv1::client::{
    zxdg_output_manager_v1::ZxdgOutputManagerV1,
    zxdg_output_v1::{self, ZxdgOutputV1},
};
use wayland_protocols_wlr::layer_shell::v1::client::{
    zwlr_layer_shell_v1::{Layer, ZwlrLayerShellV1},
    zwlr_layer_surface_v1::{self, Anchor as LayerAnchor, KeyboardInteractivity, ZwlrLayerSurfaceV1},
};

use super::{Backend, OverlaySurface, SurfaceFrame, SurfaceProvider};
use crate::error::OsdError;
use crate::model::{Anchor, Placement};
use crate::output::{Output, OutputEvent, OutputGeometry, OutputId};

/// Roundtrips allowed for a new layer surface to receive its first configure
const CONFIGURE_ROUNDTRIPS: usize = 4;

fn protocol(e: impl std::fmt::Display) -> OsdError {
    OsdError::ProtocolFailure(e.to_string())
}

// ─────────────────────────────────────────────────────────────────────────────
// Output bookkeeping
// ─────────────────────────────────────────────────────────────────────────────

/// Partial output info (built up from events before done)
#[derive(Debug, Clone, Default)]
struct OutputInfo {
    /// Connector name from wl_output or xdg-output (e.g. "HDMI-A-1")
    connector_name: String,
    /// Model from wl_output::Geometry, used when no connector name arrives
    model: String,
    description: String,
    /// Position in global coordinate space (from xdg-output if available, else wl_output)
    x: i32,
    y: i32,
    physical_width: i32,
    physical_height: i32,
    /// Logical dimensions from xdg-output (more accurate than physical/scale)
    xdg_logical_width: i32,
    xdg_logical_height: i32,
    scale: i32,
    wl_done: bool,
    /// Whether xdg_output done event received (or not using xdg-output)
    xdg_done: bool,
}

impl OutputInfo {
    fn is_ready(&self) -> bool {
        self.wl_done && self.xdg_done
    }

    fn name(&self, global: u32) -> String {
        if !self.connector_name.is_empty() {
            self.connector_name.clone()
        } else if !self.model.is_empty() {
            self.model.clone()
        } else {
            format!("output-{global}")
        }
    }

    /// Prefer xdg-output value, fall back to physical/scale
    fn logical_width(&self) -> i32 {
        if self.xdg_logical_width > 0 {
            self.xdg_logical_width
        } else {
            self.physical_width / self.scale.max(1)
        }
    }

    fn logical_height(&self) -> i32 {
        if self.xdg_logical_height > 0 {
            self.xdg_logical_height
        } else {
            self.physical_height / self.scale.max(1)
        }
    }

    fn geometry(&self) -> OutputGeometry {
        OutputGeometry::new(
            self.logical_width().max(0) as u32,
            self.logical_height().max(0) as u32,
        )
        .at(self.x, self.y)
        .with_scale(f64::from(self.scale.max(1)))
    }
}

struct OutputEntry {
    global: u32,
    wl_output: WlOutput,
    xdg_output: Option<ZxdgOutputV1>,
    info: OutputInfo,
    /// Geometry last reported to the engine, `None` until announced
    announced: Option<OutputGeometry>,
}

/// Dispatch state shared by every object on the queue
struct WaylandState {
    xdg_output_manager: Option<ZxdgOutputManagerV1>,
    outputs: Vec<OutputEntry>,
    /// Output changes not yet handed to the engine
    events: Vec<OutputEvent>,
}

impl WaylandState {
    fn add_output(&mut self, registry: &WlRegistry, global: u32, version: u32, qh: &QueueHandle<Self>) {
        let wl_output: WlOutput = registry.bind(global, version.min(4), qh, global);
        let xdg_output = self
            .xdg_output_manager
            .as_ref()
            .map(|manager| manager.get_xdg_output(&wl_output, qh, global));
        let info = OutputInfo {
            // No xdg-output support, consider that half done
            xdg_done: xdg_output.is_none(),
            ..Default::default()
        };
        self.outputs.push(OutputEntry {
            global,
            wl_output,
            xdg_output,
            info,
            announced: None,
        });
    }

    fn remove_output(&mut self, global: u32) {
        let Some(index) = self.outputs.iter().position(|entry| entry.global == global) else {
            return;
        };
        let entry = self.outputs.remove(index);
        if let Some(xdg_output) = entry.xdg_output {
            xdg_output.destroy();
        }
        if entry.wl_output.version() >= 3 {
            entry.wl_output.release();
        }
        if entry.announced.is_some() {
            self.events.push(OutputEvent::Removed(OutputId(global)));
        }
    }

    fn entry_mut(&mut self, global: u32) -> Option<&mut OutputEntry> {
        self.outputs.iter_mut().find(|entry| entry.global == global)
    }

    /// Report an output once its info is complete, and geometry changes after that
    fn publish(&mut self, global: u32) {
        let Some(entry) = self.outputs.iter_mut().find(|entry| entry.global == global) else {
            return;
        };
        if !entry.info.is_ready() {
            return;
        }
        let geometry = entry.info.geometry();
        let id = OutputId(global);
        match entry.announced {
            None => {
                let mut output = Output::new(id, entry.info.name(global), geometry);
                output.description = entry.info.description.clone();
                self.events.push(OutputEvent::Added(output));
            }
            Some(previous) if previous != geometry => {
                self.events.push(OutputEvent::GeometryChanged(id, geometry));
            }
            Some(_) => return,
        }
        entry.announced = Some(geometry);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Backend
// ─────────────────────────────────────────────────────────────────────────────

pub struct WaylandBackend {
    connection: Connection,
    event_queue: EventQueue<WaylandState>,
    qh: QueueHandle<WaylandState>,
    state: WaylandState,
    compositor: WlCompositor,
    layer_shell: ZwlrLayerShellV1,
    shm: WlShm,
    namespace: String,
}

impl WaylandBackend {
    /// Connect to the compositor named by the environment and bind the
    /// globals overlays need. Outputs are reported by the first dispatch.
    pub fn connect(namespace: &str) -> Result<Self, OsdError> {
        let connection = Connection::connect_to_env().map_err(protocol)?;
        let (globals, mut event_queue) =
            registry_queue_init::<WaylandState>(&connection).map_err(protocol)?;
        let qh = event_queue.handle();

        let compositor: WlCompositor = globals
            .bind(&qh, 4..=6, ())
            .map_err(|e| protocol(format!("wl_compositor: {e}")))?;
        let layer_shell: ZwlrLayerShellV1 = globals
            .bind(&qh, 1..=4, ())
            .map_err(|e| protocol(format!("zwlr_layer_shell_v1: {e}")))?;
        let shm: WlShm = globals
            .bind(&qh, 1..=1, ())
            .map_err(|e| protocol(format!("wl_shm: {e}")))?;

        let mut state = WaylandState {
            // Optional, gives accurate logical positions and sizes
            xdg_output_manager: globals
                .bind::<ZxdgOutputManagerV1, _, _>(&qh, 1..=3, ())
                .ok(),
            outputs: Vec::new(),
            events: Vec::new(),
        };

        for global in globals.contents().clone_list() {
            if global.interface == WlOutput::interface().name {
                state.add_output(globals.registry(), global.name, global.version, &qh);
            }
        }

        // wl_output and xdg_output info, then their done events
        for _ in 0..2 {
            event_queue.roundtrip(&mut state).map_err(protocol)?;
        }
        info!(
            outputs = state.outputs.len(),
            xdg_output = state.xdg_output_manager.is_some(),
            "Connected to Wayland compositor"
        );

        Ok(Self {
            connection,
            event_queue,
            qh,
            state,
            compositor,
            layer_shell,
            shm,
            namespace: namespace.to_string(),
        })
    }
}

impl SurfaceProvider for WaylandBackend {
    type Surface = WaylandSurface;

    fn create_surface(
        &mut self,
        output: &Output,
        placement: &Placement,
    ) -> Result<WaylandSurface, OsdError> {
        let Some(entry) = self.state.outputs.iter().find(|entry| entry.global == output.id.0) else {
            return Err(OsdError::surface(output.id, "output is not connected"));
        };

        let surface = self.compositor.create_surface(&self.qh, ());
        let data = Arc::new(LayerSurfaceData::default());
        let layer_surface = self.layer_shell.get_layer_surface(
            &surface,
            Some(&entry.wl_output),
            Layer::Overlay,
            self.namespace.clone(),
            &self.qh,
            Arc::clone(&data),
        );

        // Click-through: empty input region, never takes keyboard focus
        let region = self.compositor.create_region(&self.qh, ());
        surface.set_input_region(Some(&region));
        region.destroy();
        layer_surface.set_keyboard_interactivity(KeyboardInteractivity::None);
        layer_surface.set_anchor(layer_anchor(placement.anchor));
        let margin = placement.margin;
        layer_surface.set_margin(margin, margin, margin, margin);
        layer_surface.set_size(1, 1);
        surface.commit();

        let mut surface = WaylandSurface {
            output: output.id,
            connection: self.connection.clone(),
            qh: self.qh.clone(),
            shm: self.shm.clone(),
            surface,
            layer_surface,
            data,
            frame: None,
            pixels: Vec::new(),
            buffers: Vec::new(),
        };

        for _ in 0..CONFIGURE_ROUNDTRIPS {
            if surface.data.configured.load(Ordering::Acquire) {
                break;
            }
            self.event_queue
                .roundtrip(&mut self.state)
                .map_err(protocol)?;
        }
        if surface.data.closed.load(Ordering::Acquire) {
            return Err(OsdError::surface(output.id, "layer surface closed by compositor"));
        }
        if !surface.data.configured.load(Ordering::Acquire) {
            return Err(OsdError::surface(output.id, "layer surface was never configured"));
        }

        debug!(output = %output.id, name = %output.name, "Layer surface created");
        Ok(surface)
    }
}

impl Backend for WaylandBackend {
    fn dispatch(&mut self, timeout: Duration) -> Result<Vec<OutputEvent>, OsdError> {
        self.connection.flush().map_err(protocol)?;
        self.event_queue
            .dispatch_pending(&mut self.state)
            .map_err(protocol)?;

        if self.state.events.is_empty()
            && let Some(guard) = self.event_queue.prepare_read()
        {
            let ready = {
                let fd = guard.connection_fd();
                let mut fds = [PollFd::new(&fd, PollFlags::IN | PollFlags::ERR)];
                let timespec = Timespec {
                    tv_sec: timeout.as_secs() as _,
                    tv_nsec: timeout.subsec_nanos() as _,
                };
                match rustix::event::poll(&mut fds, Some(&timespec)) {
                    Ok(count) => count > 0,
                    Err(rustix::io::Errno::INTR) => false,
                    Err(e) => return Err(protocol(e)),
                }
            };
            if ready {
                match guard.read() {
                    Ok(_) => {}
                    Err(wayland_client::backend::WaylandError::Io(e))
                        if e.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(e) => {
                        error!(error = %e, "Lost connection to compositor");
                        return Err(protocol(e));
                    }
                }
            }
            self.event_queue
                .dispatch_pending(&mut self.state)
                .map_err(protocol)?;
        }

        Ok(std::mem::take(&mut self.state.events))
    }
}

fn layer_anchor(anchor: Anchor) -> LayerAnchor {
    let mut edges = LayerAnchor::empty();
    if anchor.top {
        edges |= LayerAnchor::Top;
    }
    if anchor.bottom {
        edges |= LayerAnchor::Bottom;
    }
    if anchor.left {
        edges |= LayerAnchor::Left;
    }
    if anchor.right {
        edges |= LayerAnchor::Right;
    }
    edges
}

// ─────────────────────────────────────────────────────────────────────────────
// Surfaces
// ─────────────────────────────────────────────────────────────────────────────

/// Configure/close state of one layer surface, written by dispatch
#[derive(Debug, Default)]
pub struct LayerSurfaceData {
    configured: AtomicBool,
    closed: AtomicBool,
}

/// Memfd-backed wl_buffer
struct ShmBuffer {
    pool: WlShmPool,
    buffer: WlBuffer,
    map: MmapMut,
    width: u32,
    height: u32,
    /// Held by the compositor until it sends release
    busy: Arc<AtomicBool>,
}

impl ShmBuffer {
    fn new(
        shm: &WlShm,
        qh: &QueueHandle<WaylandState>,
        width: u32,
        height: u32,
    ) -> std::io::Result<Self> {
        let stride = width * 4;
        let size = stride as usize * height as usize;

        let fd = memfd_create(c"wlosd-buffer", MemfdFlags::CLOEXEC)?;
        rustix::fs::ftruncate(&fd, size as u64)?;
        let file = File::from(fd);
        // SAFETY: the memfd is private to this process; the compositor only reads it
        let map = unsafe { MmapMut::map_mut(&file)? };

        let pool = shm.create_pool(file.as_fd(), size as i32, qh, ());
        let busy = Arc::new(AtomicBool::new(false));
        let buffer = pool.create_buffer(
            0,
            width as i32,
            height as i32,
            stride as i32,
            Format::Argb8888,
            qh,
            Arc::clone(&busy),
        );
        Ok(Self {
            pool,
            buffer,
            map,
            width,
            height,
            busy,
        })
    }

    fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    fn destroy(self) {
        self.buffer.destroy();
        self.pool.destroy();
    }
}

pub struct WaylandSurface {
    output: OutputId,
    connection: Connection,
    qh: QueueHandle<WaylandState>,
    shm: WlShm,
    surface: WlSurface,
    layer_surface: ZwlrLayerSurfaceV1,
    data: Arc<LayerSurfaceData>,
    frame: Option<SurfaceFrame>,
    /// RGBA render target, converted to ARGB on commit
    pixels: Vec<u8>,
    buffers: Vec<ShmBuffer>,
}

impl WaylandSurface {
    /// Index of an idle buffer of the given size, allocating one if needed
    fn acquire_buffer(&mut self, width: u32, height: u32) -> Result<usize, OsdError> {
        let mut i = 0;
        while i < self.buffers.len() {
            let buffer = &self.buffers[i];
            if !buffer.is_busy() && (buffer.width, buffer.height) != (width, height) {
                self.buffers.swap_remove(i).destroy();
            } else {
                i += 1;
            }
        }

        if let Some(index) = self
            .buffers
            .iter()
            .position(|b| !b.is_busy() && (b.width, b.height) == (width, height))
        {
            return Ok(index);
        }

        let buffer = ShmBuffer::new(&self.shm, &self.qh, width, height)
            .map_err(|e| OsdError::surface(self.output, format!("shm buffer: {e}")))?;
        self.buffers.push(buffer);
        Ok(self.buffers.len() - 1)
    }
}

impl OverlaySurface for WaylandSurface {
    fn output(&self) -> OutputId {
        self.output
    }

    fn configure(&mut self, frame: &SurfaceFrame) -> Result<(), OsdError> {
        if self.data.closed.load(Ordering::Acquire) {
            return Err(OsdError::surface(self.output, "layer surface closed by compositor"));
        }
        self.layer_surface.set_anchor(layer_anchor(frame.anchor));
        self.layer_surface
            .set_margin(frame.margin, frame.margin, frame.margin, frame.margin);
        self.layer_surface.set_size(frame.width, frame.height);
        self.pixels.resize(frame.buffer_len(), 0);
        self.frame = Some(*frame);
        Ok(())
    }

    fn pixel_buffer(&mut self) -> &mut [u8] {
        &mut self.pixels
    }

    fn commit(&mut self) -> Result<(), OsdError> {
        let Some(frame) = self.frame else {
            return Err(OsdError::surface(self.output, "commit before configure"));
        };
        if self.data.closed.load(Ordering::Acquire) {
            return Err(OsdError::surface(self.output, "layer surface closed by compositor"));
        }

        let index = self.acquire_buffer(frame.buffer_width, frame.buffer_height)?;
        let buffer = &mut self.buffers[index];
        // ARGB8888 is BGRA in little-endian memory
        for (dst, src) in buffer.map.chunks_exact_mut(4).zip(self.pixels.chunks_exact(4)) {
            dst[0] = src[2];
            dst[1] = src[1];
            dst[2] = src[0];
            dst[3] = src[3];
        }

        self.surface
            .set_buffer_scale(frame.scale.round().max(1.0) as i32);
        self.surface.attach(Some(&buffer.buffer), 0, 0);
        self.surface.damage_buffer(
            0,
            0,
            frame.buffer_width as i32,
            frame.buffer_height as i32,
        );
        self.surface.commit();
        buffer.busy.store(true, Ordering::Release);
        self.connection.flush().map_err(protocol)
    }
}

impl Drop for WaylandSurface {
    fn drop(&mut self) {
        self.layer_surface.destroy();
        self.surface.destroy();
        for buffer in self.buffers.drain(..) {
            buffer.destroy();
        }
        if let Err(e) = self.connection.flush() {
            warn!(output = %self.output, error = %e, "Flush after surface destroy failed");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Dispatch implementations
// ─────────────────────────────────────────────────────────────────────────────

/// Macro to implement empty Dispatch for protocols that don't need event handling
macro_rules! impl_empty_dispatch {
    ($proxy:ty, $data:ty, $state:ty) => {
        impl Dispatch<$proxy, $data> for $state {
            fn event(
                _: &mut Self,
                _: &$proxy,
                _: <$proxy as wayland_client::Proxy>::Event,
                _: &$data,
                _: &Connection,
                _: &QueueHandle<Self>,
            ) {
            }
        }
    };
}

impl_empty_dispatch!(WlCompositor, (), WaylandState);
impl_empty_dispatch!(WlSurface, (), WaylandState);
impl_empty_dispatch!(WlRegion, (), WaylandState);
impl_empty_dispatch!(WlShm, (), WaylandState);
impl_empty_dispatch!(WlShmPool, (), WaylandState);
impl_empty_dispatch!(ZwlrLayerShellV1, (), WaylandState);
impl_empty_dispatch!(ZxdgOutputManagerV1, (), WaylandState);

/// Output hotplug after startup
impl Dispatch<WlRegistry, GlobalListContents> for WaylandState {
    fn event(
        state: &mut Self,
        registry: &WlRegistry,
        event: wl_registry::Event,
        _data: &GlobalListContents,
        _conn: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        match event {
            wl_registry::Event::Global {
                name,
                interface,
                version,
            } if interface == WlOutput::interface().name => {
                debug!(global = name, "Output global announced");
                state.add_output(registry, name, version, qh);
            }
            wl_registry::Event::GlobalRemove { name } => {
                state.remove_output(name);
            }
            _ => {}
        }
    }
}

/// WlOutput dispatch - data contains the global name (u32)
impl Dispatch<WlOutput, u32> for WaylandState {
    fn event(
        state: &mut Self,
        _proxy: &WlOutput,
        event: wl_output::Event,
        global: &u32,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        let Some(entry) = state.entry_mut(*global) else {
            return;
        };
        let info = &mut entry.info;

        match event {
            wl_output::Event::Geometry { x, y, model, .. } => {
                // xdg-output position wins when present
                if info.xdg_logical_width == 0 {
                    info.x = x;
                    info.y = y;
                }
                info.model = model;
            }
            wl_output::Event::Mode {
                flags,
                width,
                height,
                ..
            } => {
                if let WEnum::Value(mode_flags) = flags
                    && mode_flags.contains(wl_output::Mode::Current)
                {
                    info.physical_width = width;
                    info.physical_height = height;
                }
            }
            wl_output::Event::Scale { factor } => {
                info.scale = factor;
            }
            wl_output::Event::Name { name } => {
                info.connector_name = name;
            }
            wl_output::Event::Description { description } => {
                if info.description.is_empty() {
                    info.description = description;
                }
            }
            wl_output::Event::Done => {
                if info.scale == 0 {
                    info.scale = 1;
                }
                info.wl_done = true;
                // xdg-output v3+ piggybacks on wl_output.done
                if info.xdg_logical_width > 0 {
                    info.xdg_done = true;
                }
                state.publish(*global);
            }
            _ => {}
        }
    }
}

/// xdg_output events - data contains the global name of the associated wl_output
impl Dispatch<ZxdgOutputV1, u32> for WaylandState {
    fn event(
        state: &mut Self,
        _proxy: &ZxdgOutputV1,
        event: zxdg_output_v1::Event,
        global: &u32,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        let Some(entry) = state.entry_mut(*global) else {
            return;
        };
        let info = &mut entry.info;

        match event {
            zxdg_output_v1::Event::LogicalPosition { x, y } => {
                info.x = x;
                info.y = y;
            }
            zxdg_output_v1::Event::LogicalSize { width, height } => {
                info.xdg_logical_width = width;
                info.xdg_logical_height = height;
            }
            zxdg_output_v1::Event::Name { name } => {
                if !name.is_empty() {
                    info.connector_name = name;
                }
            }
            zxdg_output_v1::Event::Description { description } => {
                info.description = description;
            }
            zxdg_output_v1::Event::Done => {
                info.xdg_done = true;
                state.publish(*global);
            }
            _ => {}
        }
    }
}

impl Dispatch<WlBuffer, Arc<AtomicBool>> for WaylandState {
    fn event(
        _state: &mut Self,
        _proxy: &WlBuffer,
        event: wl_buffer::Event,
        busy: &Arc<AtomicBool>,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let wl_buffer::Event::Release = event {
            busy.store(false, Ordering::Release);
        }
    }
}

impl Dispatch<ZwlrLayerSurfaceV1, Arc<LayerSurfaceData>> for WaylandState {
    fn event(
        _state: &mut Self,
        proxy: &ZwlrLayerSurfaceV1,
        event: zwlr_layer_surface_v1::Event,
        data: &Arc<LayerSurfaceData>,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        match event {
            zwlr_layer_surface_v1::Event::Configure { serial, .. } => {
                proxy.ack_configure(serial);
                data.configured.store(true, Ordering::Release);
            }
            zwlr_layer_surface_v1::Event::Closed => {
                debug!("Layer surface closed by compositor");
                data.closed.store(true, Ordering::Release);
            }
            _ => {}
        }
    }
}
