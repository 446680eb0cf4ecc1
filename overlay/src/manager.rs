//! Session registry and scheduling
//!
//! The manager owns every live [`OverlaySession`], keyed by channel, along
//! with the output tracker, the timer queue and the render queue. It is the
//! only place sessions are created or removed.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use wlosd_types::{DrawingSpec, Style};

use crate::clock::{Clock, SystemClock};
use crate::error::OsdError;
use crate::model::DrawingModel;
use crate::output::{OutputEvent, OutputTracker};
use crate::platform::SurfaceProvider;
use crate::renderer::Renderer;
use crate::session::{CloseReason, Deadline, OverlaySession, SessionId};
use crate::timer::{TimerQueue, TimerToken};

/// How many closed sessions are remembered for inspection
const CLOSED_HISTORY: usize = 32;

/// A session that has left the registry
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedSession {
    pub channel: String,
    pub id: SessionId,
    pub reason: CloseReason,
    pub at: Instant,
}

/// Which session armed a timer, and in which epoch
#[derive(Debug, Clone)]
struct TimerOwner {
    channel: String,
    epoch: u64,
}

pub struct SessionManager<P: SurfaceProvider, C: Clock = SystemClock> {
    sessions: HashMap<String, OverlaySession<P::Surface>>,
    tracker: OutputTracker,
    renderer: Renderer,
    provider: P,
    clock: C,
    timers: TimerQueue,
    timer_owners: HashMap<TimerToken, TimerOwner>,
    /// Channels with a pending render, each at most once
    render_queue: VecDeque<String>,
    style: Style,
    default_timeout: Option<Duration>,
    next_session_id: u64,
    closed: VecDeque<ClosedSession>,
}

impl<P: SurfaceProvider, C: Clock> SessionManager<P, C> {
    pub fn new(provider: P, renderer: Renderer, clock: C) -> Self {
        Self {
            sessions: HashMap::new(),
            tracker: OutputTracker::new(),
            renderer,
            provider,
            clock,
            timers: TimerQueue::new(),
            timer_owners: HashMap::new(),
            render_queue: VecDeque::new(),
            style: Style::default(),
            default_timeout: None,
            next_session_id: 0,
            closed: VecDeque::with_capacity(CLOSED_HISTORY),
        }
    }

    pub fn with_style(mut self, style: Style) -> Self {
        self.style = style;
        self
    }

    /// Timeout for specs that carry none; `None` keeps such overlays up until dismissed
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Requests
    // ─────────────────────────────────────────────────────────────────────────

    /// Show or update the overlay on `channel`.
    ///
    /// `spec` is validated before anything changes; a rejected spec leaves
    /// the existing session untouched. Drawing happens on the next
    /// [`run_render_tasks`](Self::run_render_tasks).
    pub fn submit(&mut self, channel: &str, spec: &DrawingSpec) -> Result<SessionId, OsdError> {
        let model = match DrawingModel::build(spec, &self.style) {
            Ok(model) => model,
            Err(e) => {
                warn!(channel, error = %e, "Rejected overlay update");
                return Err(e);
            }
        };

        let now = self.clock.now();
        let deadline = Deadline::after(now, model.timeout().or(self.default_timeout));

        let id = match self.sessions.get_mut(channel) {
            Some(session) => {
                if session.update(model, deadline) {
                    arm_timer(&mut self.timers, &mut self.timer_owners, session);
                }
                debug!(channel, session = %session.id(), "Session updated");
                session.id()
            }
            None => {
                self.next_session_id += 1;
                let id = SessionId(self.next_session_id);
                let mut session = OverlaySession::new(id, channel, model, deadline);
                arm_timer(&mut self.timers, &mut self.timer_owners, &mut session);
                self.sessions.insert(channel.to_string(), session);
                info!(channel, session = %id, "Session opened");
                id
            }
        };

        self.queue_render(channel);
        Ok(id)
    }

    /// Close the overlay on `channel`. Returns false if there was none.
    pub fn dismiss(&mut self, channel: &str) -> bool {
        if !self.sessions.contains_key(channel) {
            debug!(channel, "Dismiss for unknown channel ignored");
            return false;
        }
        self.close(channel, CloseReason::Dismissed);
        true
    }

    /// Close every overlay whose channel matches; returns the closed channels
    pub fn dismiss_matching(&mut self, matches: impl Fn(&str) -> bool) -> Vec<String> {
        let doomed: Vec<String> = self
            .channels()
            .into_iter()
            .filter(|channel| matches(channel))
            .collect();
        for channel in &doomed {
            self.close(channel, CloseReason::Dismissed);
        }
        doomed
    }

    /// Style applied to specs submitted from now on
    pub fn set_style(&mut self, style: Style) {
        self.style = style;
    }

    pub fn style(&self) -> &Style {
        &self.style
    }

    pub fn set_default_timeout(&mut self, timeout: Option<Duration>) {
        self.default_timeout = timeout;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Event sources
    // ─────────────────────────────────────────────────────────────────────────

    /// Apply an output change and schedule whatever it affects
    pub fn handle_output_event(&mut self, event: OutputEvent) {
        if !self.tracker.apply(event.clone()) {
            return;
        }

        match event {
            OutputEvent::Added(output) => {
                for channel in self.channels() {
                    if self
                        .sessions
                        .get(&channel)
                        .is_some_and(|session| session.wants_output(&output))
                    {
                        self.queue_render(&channel);
                    }
                }
            }
            OutputEvent::Removed(id) => {
                let mut stranded = Vec::new();
                let mut orphaned = Vec::new();
                for channel in self.channels() {
                    let Some(session) = self.sessions.get_mut(&channel) else {
                        continue;
                    };
                    if !session.drop_output(id) {
                        continue;
                    }
                    if session.has_targets(&self.tracker) {
                        stranded.push(channel);
                    } else {
                        orphaned.push(channel);
                    }
                }
                for channel in stranded {
                    debug!(channel = %channel, output = %id, "Last surface lost, redrawing on remaining outputs");
                    self.queue_render(&channel);
                }
                for channel in orphaned {
                    warn!(channel = %channel, output = %id, "Last output of session removed");
                    self.close(&channel, CloseReason::NoOutput);
                }
            }
            OutputEvent::GeometryChanged(id, _) => {
                for channel in self.channels() {
                    if self
                        .sessions
                        .get(&channel)
                        .is_some_and(|session| session.surface(id).is_some())
                    {
                        self.queue_render(&channel);
                    }
                }
            }
        }
    }

    /// Close every session whose current timer has expired. Returns how many closed.
    pub fn fire_timers(&mut self) -> usize {
        let now = self.clock.now();
        let mut closed = 0;
        for token in self.timers.expired(now) {
            let Some(owner) = self.timer_owners.remove(&token) else {
                continue;
            };
            let current = self
                .sessions
                .get(&owner.channel)
                .is_some_and(|session| session.accepts_timer(token, owner.epoch));
            if !current {
                debug!(channel = %owner.channel, "Stale timer ignored");
                continue;
            }
            self.close(&owner.channel, CloseReason::Expired);
            closed += 1;
        }
        closed
    }

    /// Render every queued channel once. Returns how many sessions drew something.
    pub fn run_render_tasks(&mut self) -> usize {
        let mut rendered = 0;
        while let Some(channel) = self.render_queue.pop_front() {
            let Some(session) = self.sessions.get_mut(&channel) else {
                continue;
            };
            match session.render(&self.tracker, &mut self.provider, &mut self.renderer) {
                Ok(outputs) => {
                    debug!(channel = %channel, outputs, "Session rendered");
                    rendered += 1;
                }
                Err(e) => {
                    warn!(channel = %channel, error = %e, "Closing session");
                    self.close(&channel, CloseReason::NoOutput);
                }
            }
        }
        rendered
    }

    /// Close everything and release every surface
    pub fn shutdown(&mut self) {
        for channel in self.channels() {
            self.close(&channel, CloseReason::Shutdown);
        }
        self.render_queue.clear();
        self.timers.clear();
        self.timer_owners.clear();
        info!("All overlay sessions closed");
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// Live channels, sorted
    pub fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.sessions.keys().cloned().collect();
        channels.sort();
        channels
    }

    pub fn session(&self, channel: &str) -> Option<&OverlaySession<P::Surface>> {
        self.sessions.get(channel)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Earliest armed expiry
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    pub fn has_pending_renders(&self) -> bool {
        !self.render_queue.is_empty()
    }

    /// Most recently closed sessions, oldest first
    pub fn recently_closed(&self) -> impl Iterator<Item = &ClosedSession> {
        self.closed.iter()
    }

    pub fn tracker(&self) -> &OutputTracker {
        &self.tracker
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn provider_mut(&mut self) -> &mut P {
        &mut self.provider
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────────────────

    fn queue_render(&mut self, channel: &str) {
        if !self.render_queue.iter().any(|queued| queued == channel) {
            self.render_queue.push_back(channel.to_string());
        }
    }

    /// The only path that removes a session from the registry
    fn close(&mut self, channel: &str, reason: CloseReason) {
        let Some(mut session) = self.sessions.remove(channel) else {
            return;
        };
        if let Some(token) = session.begin_close() {
            self.timers.cancel(token);
            self.timer_owners.remove(&token);
        }
        let surfaces = session.finish_close();
        self.render_queue.retain(|queued| queued != channel);

        info!(channel, session = %session.id(), ?reason, surfaces, "Session closed");
        if self.closed.len() == CLOSED_HISTORY {
            self.closed.pop_front();
        }
        self.closed.push_back(ClosedSession {
            channel: channel.to_string(),
            id: session.id(),
            reason,
            at: self.clock.now(),
        });
    }
}

/// Replace a session's timer with one for its current deadline
fn arm_timer<S>(
    timers: &mut TimerQueue,
    owners: &mut HashMap<TimerToken, TimerOwner>,
    session: &mut OverlaySession<S>,
) where
    S: crate::platform::OverlaySurface,
{
    if let Some(old) = session.replace_timer(None) {
        timers.cancel(old);
        owners.remove(&old);
    }
    if let Deadline::At(at) = session.deadline() {
        let token = timers.arm_at(at);
        owners.insert(
            token,
            TimerOwner {
                channel: session.channel().to_string(),
                epoch: session.epoch(),
            },
        );
        session.replace_timer(Some(token));
    }
}
