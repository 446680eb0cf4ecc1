//! Overlay session: one channel's overlay across its outputs
//!
//! ```text
//! Pending ──render ok──▶ Visible ◀──render ok── Updating
//!    │                     │  ▲                    ▲
//!    │                     │  └──── update ────────┘
//!    │ no output           │ expiry / dismiss / last output lost
//!    ▼                     ▼
//! Closing ───────────────▶ Closed
//! ```
//!
//! Sessions never remove themselves from the registry; the manager drives
//! every transition into `Closing` and `Closed`.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::error::OsdError;
use crate::model::DrawingModel;
use crate::output::{Output, OutputId, OutputTracker};
use crate::platform::{OverlaySurface, SurfaceProvider};
use crate::renderer::Renderer;
use crate::timer::TimerToken;

/// Identity of one session instance; a new session on the same channel gets a new id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, nothing drawn yet
    Pending,
    Visible,
    /// New content accepted, re-render queued
    Updating,
    Closing,
    Closed,
}

/// When a session expires. `Never` sorts after every instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Deadline {
    At(Instant),
    Never,
}

impl Deadline {
    /// `now + timeout`. A timeout past the end of representable time never expires.
    pub fn after(now: Instant, timeout: Option<Duration>) -> Self {
        match timeout.and_then(|timeout| now.checked_add(timeout)) {
            Some(at) => Self::At(at),
            None => Self::Never,
        }
    }

    pub fn instant(&self) -> Option<Instant> {
        match self {
            Self::At(at) => Some(*at),
            Self::Never => None,
        }
    }
}

/// Which outputs a session draws on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    AllOutputs,
    /// One output by connector name; the primary output stands in while it is absent
    Named(String),
}

impl Target {
    fn of(model: &DrawingModel) -> Self {
        match model.output() {
            Some(name) => Self::Named(name.to_string()),
            None => Self::AllOutputs,
        }
    }
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Expired,
    Dismissed,
    /// Nothing could be drawn, or the last output went away
    NoOutput,
    Shutdown,
}

pub struct OverlaySession<S> {
    id: SessionId,
    channel: String,
    state: SessionState,
    model: DrawingModel,
    target: Target,
    surfaces: BTreeMap<OutputId, S>,
    deadline: Deadline,
    /// Bumped whenever the deadline moves or the session starts closing
    epoch: u64,
    timer: Option<TimerToken>,
}

impl<S: OverlaySurface> OverlaySession<S> {
    pub(crate) fn new(id: SessionId, channel: &str, model: DrawingModel, deadline: Deadline) -> Self {
        Self {
            id,
            channel: channel.to_string(),
            state: SessionState::Pending,
            target: Target::of(&model),
            model,
            surfaces: BTreeMap::new(),
            deadline,
            epoch: 0,
            timer: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn model(&self) -> &DrawingModel {
        &self.model
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn timer(&self) -> Option<TimerToken> {
        self.timer
    }

    /// Outputs that currently hold a surface of this session
    pub fn outputs(&self) -> Vec<OutputId> {
        self.surfaces.keys().copied().collect()
    }

    pub fn surface(&self, output: OutputId) -> Option<&S> {
        self.surfaces.get(&output)
    }

    pub fn is_live(&self) -> bool {
        !matches!(self.state, SessionState::Closing | SessionState::Closed)
    }

    /// Replace the model and extend the deadline. Returns true if the deadline moved.
    pub(crate) fn update(&mut self, model: DrawingModel, deadline: Deadline) -> bool {
        if self.state == SessionState::Visible {
            self.state = SessionState::Updating;
        }
        self.target = Target::of(&model);
        self.model = model;

        let extended = self.deadline.max(deadline);
        let moved = extended != self.deadline;
        if moved {
            self.deadline = extended;
            self.epoch += 1;
        }
        moved
    }

    /// Swap the armed timer, returning the previous one
    pub(crate) fn replace_timer(&mut self, timer: Option<TimerToken>) -> Option<TimerToken> {
        std::mem::replace(&mut self.timer, timer)
    }

    /// An expiry only counts if it is the current timer of the current epoch
    pub(crate) fn accepts_timer(&self, token: TimerToken, epoch: u64) -> bool {
        self.is_live() && self.timer == Some(token) && self.epoch == epoch
    }

    /// Whether a newly connected output should trigger a re-render
    pub(crate) fn wants_output(&self, output: &Output) -> bool {
        match &self.target {
            Target::AllOutputs => true,
            Target::Named(name) => *name == output.name || self.surfaces.is_empty(),
        }
    }

    /// Whether a connected output could still show this session
    pub(crate) fn has_targets(&self, tracker: &OutputTracker) -> bool {
        match &self.target {
            Target::AllOutputs => !tracker.is_empty(),
            Target::Named(name) => tracker.find_by_name(name).is_some() || tracker.primary().is_some(),
        }
    }

    fn targets(&self, tracker: &OutputTracker) -> Vec<Output> {
        match &self.target {
            Target::AllOutputs => tracker.list_outputs().into_iter().cloned().collect(),
            Target::Named(name) => match tracker.find_by_name(name) {
                Some(output) => vec![output.clone()],
                None => {
                    let primary = tracker.primary().cloned();
                    warn!(
                        channel = %self.channel,
                        output = %name,
                        fallback = ?primary.as_ref().map(|o| &o.name),
                        "Requested output not found, using primary output"
                    );
                    primary.into_iter().collect()
                }
            },
        }
    }

    /// Draw the current model on every targeted output.
    ///
    /// Per-output failures are logged and skipped. Fails with
    /// `NoOutputAvailable` when nothing could be drawn at all.
    pub(crate) fn render<P>(
        &mut self,
        tracker: &OutputTracker,
        provider: &mut P,
        renderer: &mut Renderer,
    ) -> Result<usize, OsdError>
    where
        P: SurfaceProvider<Surface = S>,
    {
        let targets = self.targets(tracker);
        self.surfaces
            .retain(|id, _| targets.iter().any(|output| output.id == *id));

        let mut rendered = 0;
        for output in &targets {
            if !self.surfaces.contains_key(&output.id) {
                match provider.create_surface(output, self.model.placement()) {
                    Ok(surface) => {
                        self.surfaces.insert(output.id, surface);
                    }
                    Err(e) => {
                        warn!(channel = %self.channel, error = %e, "Skipping output");
                        continue;
                    }
                }
            }
            let Some(surface) = self.surfaces.get_mut(&output.id) else {
                continue;
            };
            match renderer.render(surface, &self.model, &output.geometry) {
                Ok(_) => rendered += 1,
                Err(e) => {
                    warn!(channel = %self.channel, error = %e, "Skipping output");
                    self.surfaces.remove(&output.id);
                }
            }
        }

        if rendered == 0 {
            return Err(OsdError::NoOutputAvailable {
                channel: self.channel.clone(),
            });
        }
        self.state = SessionState::Visible;
        Ok(rendered)
    }

    /// Destroy the surface on a vanished output. Returns true when that was
    /// the last surface of a shown session; the caller redraws it elsewhere
    /// or closes it.
    pub(crate) fn drop_output(&mut self, output: OutputId) -> bool {
        let dropped = self.surfaces.remove(&output).is_some();
        dropped
            && self.surfaces.is_empty()
            && matches!(self.state, SessionState::Visible | SessionState::Updating)
    }

    /// Enter `Closing`, handing back the armed timer for cancellation
    pub(crate) fn begin_close(&mut self) -> Option<TimerToken> {
        self.state = SessionState::Closing;
        self.epoch += 1;
        self.timer.take()
    }

    /// Destroy every surface and enter `Closed`. Returns how many were destroyed.
    pub(crate) fn finish_close(&mut self) -> usize {
        let destroyed = self.surfaces.len();
        self.surfaces.clear();
        self.state = SessionState::Closed;
        destroyed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::Backend;
    use crate::platform::headless::{HeadlessBackend, HeadlessSurface};
    use crate::output::{OutputEvent, OutputGeometry};
    use crate::timer::TimerQueue;
    use wlosd_types::{DrawingSpec, ItemSpec, Style};

    fn model(fraction: f32, output: Option<&str>) -> DrawingModel {
        let mut spec = DrawingSpec::new(vec![ItemSpec::bar(fraction)]);
        spec.output = output.map(str::to_string);
        DrawingModel::build(&spec, &Style::default()).unwrap()
    }

    fn setup(outputs: &[&str]) -> (HeadlessBackend, OutputTracker, Vec<OutputId>) {
        let mut backend = HeadlessBackend::new();
        let mut ids = Vec::new();
        for (i, name) in outputs.iter().enumerate() {
            let geometry = OutputGeometry::new(1920, 1080).at(1920 * i as i32, 0);
            ids.push(backend.add_output(name, geometry));
        }
        let mut tracker = OutputTracker::new();
        for event in backend.dispatch(Duration::ZERO).unwrap() {
            tracker.apply(event);
        }
        (backend, tracker, ids)
    }

    #[test]
    fn deadline_ordering() {
        let now = Instant::now();
        let soon = Deadline::after(now, Some(Duration::from_secs(1)));
        let later = Deadline::after(now, Some(Duration::from_secs(2)));
        assert!(soon < later);
        assert!(later < Deadline::Never);
        assert_eq!(Deadline::after(now, None), Deadline::Never);
    }

    #[test]
    fn unrepresentable_deadline_never_expires() {
        let now = Instant::now();
        assert_eq!(Deadline::after(now, Some(Duration::MAX)), Deadline::Never);
        assert_eq!(
            Deadline::after(now, Some(Duration::from_secs_f32(1e19))),
            Deadline::Never
        );
    }

    #[test]
    fn deadline_never_moves_backwards() {
        let now = Instant::now();
        let mut session: OverlaySession<HeadlessSurface> = OverlaySession::new(
            SessionId(1),
            "volume",
            model(0.4, None),
            Deadline::after(now, Some(Duration::from_secs(5))),
        );

        let shorter = Deadline::after(now, Some(Duration::from_secs(1)));
        assert!(!session.update(model(0.5, None), shorter));
        assert_eq!(session.epoch(), 0);
        assert_eq!(session.model(), &model(0.5, None));

        let longer = Deadline::after(now, Some(Duration::from_secs(9)));
        assert!(session.update(model(0.6, None), longer));
        assert_eq!(session.deadline(), longer);
        assert_eq!(session.epoch(), 1);
    }

    #[test]
    fn renders_on_every_output() {
        let (mut backend, tracker, ids) = setup(&["DP-1", "DP-2"]);
        let mut renderer = Renderer::without_fonts();
        let mut session =
            OverlaySession::new(SessionId(1), "volume", model(0.4, None), Deadline::Never);

        assert_eq!(session.state(), SessionState::Pending);
        assert_eq!(session.render(&tracker, &mut backend, &mut renderer), Ok(2));
        assert_eq!(session.state(), SessionState::Visible);
        assert_eq!(session.outputs(), ids);
    }

    #[test]
    fn partial_failure_is_not_fatal() {
        let (mut backend, tracker, ids) = setup(&["DP-1", "DP-2"]);
        backend.fail_output(ids[0]);
        let mut renderer = Renderer::without_fonts();
        let mut session =
            OverlaySession::new(SessionId(1), "volume", model(0.4, None), Deadline::Never);

        assert_eq!(session.render(&tracker, &mut backend, &mut renderer), Ok(1));
        assert_eq!(session.outputs(), vec![ids[1]]);
    }

    #[test]
    fn total_failure_reports_no_output() {
        let (mut backend, tracker, ids) = setup(&["DP-1"]);
        backend.fail_commits(ids[0]);
        let mut renderer = Renderer::without_fonts();
        let mut session =
            OverlaySession::new(SessionId(1), "volume", model(0.4, None), Deadline::Never);

        let err = session
            .render(&tracker, &mut backend, &mut renderer)
            .unwrap_err();
        assert_eq!(
            err,
            OsdError::NoOutputAvailable {
                channel: "volume".into()
            }
        );
        assert_eq!(session.state(), SessionState::Pending);
        assert_eq!(backend.live_surfaces(), 0);
    }

    #[test]
    fn named_output_with_primary_fallback() {
        let (mut backend, mut tracker, ids) = setup(&["DP-1", "HDMI-A-1"]);
        let mut renderer = Renderer::without_fonts();

        let mut named =
            OverlaySession::new(SessionId(1), "vol", model(0.4, Some("HDMI-A-1")), Deadline::Never);
        named.render(&tracker, &mut backend, &mut renderer).unwrap();
        assert_eq!(named.outputs(), vec![ids[1]]);

        let mut missing =
            OverlaySession::new(SessionId(2), "bri", model(0.4, Some("DP-9")), Deadline::Never);
        missing.render(&tracker, &mut backend, &mut renderer).unwrap();
        assert_eq!(missing.outputs(), vec![ids[0]]);

        // The named output shows up: the session moves there
        let late = Output::new(OutputId(99), "DP-9", OutputGeometry::new(800, 600).at(-800, 0));
        assert!(missing.wants_output(&late));
        tracker.apply(OutputEvent::Added(late));
        // Backend does not know id 99, so the move fails and nothing is left
        assert!(missing.render(&tracker, &mut backend, &mut renderer).is_err());
        assert!(missing.outputs().is_empty());
    }

    #[test]
    fn losing_the_last_surface_requests_close() {
        let (mut backend, tracker, ids) = setup(&["DP-1", "DP-2"]);
        let mut renderer = Renderer::without_fonts();
        let mut session =
            OverlaySession::new(SessionId(1), "volume", model(0.4, None), Deadline::Never);
        session.render(&tracker, &mut backend, &mut renderer).unwrap();

        assert!(!session.drop_output(ids[0]));
        assert_eq!(backend.live_surfaces(), 1);
        assert!(session.drop_output(ids[1]));
        assert_eq!(backend.live_surfaces(), 0);
        assert!(!session.drop_output(ids[1]));
    }

    #[test]
    fn targets_survive_while_any_output_is_connected() {
        let (_, mut tracker, ids) = setup(&["DP-1", "DP-2"]);
        let all: OverlaySession<HeadlessSurface> =
            OverlaySession::new(SessionId(1), "volume", model(0.4, None), Deadline::Never);
        let named: OverlaySession<HeadlessSurface> =
            OverlaySession::new(SessionId(2), "bri", model(0.4, Some("DP-1")), Deadline::Never);

        tracker.apply(OutputEvent::Removed(ids[0]));
        assert!(all.has_targets(&tracker));
        assert!(named.has_targets(&tracker));

        tracker.apply(OutputEvent::Removed(ids[1]));
        assert!(!all.has_targets(&tracker));
        assert!(!named.has_targets(&tracker));
    }

    #[test]
    fn closing_invalidates_the_timer() {
        let mut timers = TimerQueue::new();
        let now = Instant::now();
        let mut session: OverlaySession<HeadlessSurface> = OverlaySession::new(
            SessionId(1),
            "volume",
            model(0.4, None),
            Deadline::after(now, Some(Duration::from_secs(2))),
        );
        let token = timers.arm(now, Duration::from_secs(2)).unwrap();
        session.replace_timer(Some(token));
        assert!(session.accepts_timer(token, 0));

        assert_eq!(session.begin_close(), Some(token));
        assert!(!session.accepts_timer(token, 0));
        assert!(!session.accepts_timer(token, session.epoch()));
        assert_eq!(session.finish_close(), 0);
        assert_eq!(session.state(), SessionState::Closed);
    }
}
