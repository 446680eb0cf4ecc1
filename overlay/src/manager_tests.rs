//! Tests for SessionManager lifecycle and scheduling
//!
//! Verifies that:
//! - Submissions create, coalesce and re-render sessions per channel
//! - Deadlines only ever move forward and fire exactly once
//! - Output hotplug and surface failures degrade per output
//! - Shutdown releases every surface

use std::time::Duration;

use wlosd_types::{AnchorEdge, DrawingSpec, ItemSpec, Style};

use crate::clock::{Clock, ManualClock};
use crate::error::OsdError;
use crate::model::DrawingModel;
use crate::output::{OutputGeometry, OutputId};
use crate::platform::Backend;
use crate::platform::headless::HeadlessBackend;
use crate::renderer::Renderer;
use crate::session::{CloseReason, Deadline, SessionState};

use super::SessionManager;

// ═══════════════════════════════════════════════════════════════════════════
// Test Helpers
// ═══════════════════════════════════════════════════════════════════════════

type TestManager = SessionManager<HeadlessBackend, ManualClock>;

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

/// Manager with the named 1920x1080 outputs, laid out side by side
fn manager_with_outputs(names: &[&str]) -> (TestManager, Vec<OutputId>) {
    let mut backend = HeadlessBackend::new();
    let ids = names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            backend.add_output(name, OutputGeometry::new(1920, 1080).at(1920 * i as i32, 0))
        })
        .collect();
    let mut manager = SessionManager::new(backend, Renderer::without_fonts(), ManualClock::new());
    pump(&mut manager);
    (manager, ids)
}

/// Deliver pending backend output events to the manager
fn pump(manager: &mut TestManager) {
    let events = manager.provider_mut().dispatch(Duration::ZERO).unwrap();
    for event in events {
        manager.handle_output_event(event);
    }
}

/// One loop turn after time has moved: timers, then renders
fn tick(manager: &mut TestManager, by: Duration) {
    manager.clock().advance(by);
    pump(manager);
    manager.fire_timers();
    manager.run_render_tasks();
}

fn bar(fraction: f32, timeout: f32) -> DrawingSpec {
    DrawingSpec::new(vec![ItemSpec::bar(fraction)]).with_timeout(timeout)
}

fn shown_fraction(manager: &TestManager, channel: &str) -> Option<f32> {
    let session = manager.session(channel)?;
    session.model().items().iter().find_map(|item| match item {
        crate::model::Item::Bar { fraction, .. } => Some(*fraction),
        _ => None,
    })
}

// ═══════════════════════════════════════════════════════════════════════════
// Lifecycle
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn volume_bar_shows_then_expires() {
    let (mut manager, ids) = manager_with_outputs(&["DP-1", "DP-2"]);

    manager.submit("volume", &bar(0.4, 2.0)).unwrap();
    assert_eq!(
        manager.session("volume").map(|s| s.state()),
        Some(SessionState::Pending)
    );

    manager.run_render_tasks();
    let session = manager.session("volume").unwrap();
    assert_eq!(session.state(), SessionState::Visible);
    assert_eq!(session.outputs(), ids);
    assert_eq!(shown_fraction(&manager, "volume"), Some(0.4));
    assert_eq!(manager.provider().live_surfaces(), 2);

    tick(&mut manager, ms(1999));
    assert!(manager.session("volume").is_some());

    tick(&mut manager, ms(1));
    assert!(manager.session("volume").is_none());
    assert_eq!(manager.provider().live_surfaces(), 0);
    let closed: Vec<_> = manager.recently_closed().collect();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].reason, CloseReason::Expired);
}

#[test]
fn update_extends_the_same_session() {
    let (mut manager, _) = manager_with_outputs(&["DP-1"]);
    let start = manager.clock().now();

    let first = manager.submit("volume", &bar(0.4, 2.0)).unwrap();
    manager.run_render_tasks();

    tick(&mut manager, ms(500));
    let second = manager.submit("volume", &bar(0.6, 2.0)).unwrap();
    assert_eq!(first, second);
    assert_eq!(
        manager.session("volume").map(|s| s.state()),
        Some(SessionState::Updating)
    );
    manager.run_render_tasks();
    assert_eq!(shown_fraction(&manager, "volume"), Some(0.6));
    assert_eq!(
        manager.session("volume").map(|s| s.deadline()),
        Some(Deadline::At(start + ms(2500)))
    );

    // The first deadline passes without effect
    tick(&mut manager, ms(1500));
    assert_eq!(
        manager.session("volume").map(|s| s.state()),
        Some(SessionState::Visible)
    );

    tick(&mut manager, ms(500));
    assert!(manager.session("volume").is_none());
    // One surface for the whole session lifetime
    assert_eq!(manager.provider().created_surfaces(), 1);
}

#[test]
fn channels_are_independent() {
    let (mut manager, _) = manager_with_outputs(&["DP-1"]);

    let volume = manager.submit("volume", &bar(0.4, 1.0)).unwrap();
    let brightness = manager.submit("brightness", &bar(0.8, 3.0)).unwrap();
    assert_ne!(volume, brightness);
    manager.run_render_tasks();
    assert_eq!(manager.channels(), vec!["brightness", "volume"]);
    assert_eq!(manager.provider().live_surfaces(), 2);

    tick(&mut manager, ms(1000));
    assert_eq!(manager.channels(), vec!["brightness"]);
    assert_eq!(shown_fraction(&manager, "brightness"), Some(0.8));
    assert_eq!(manager.provider().live_surfaces(), 1);
}

#[test]
fn invalid_spec_changes_nothing() {
    let (mut manager, _) = manager_with_outputs(&["DP-1"]);

    let err = manager.submit("volume", &bar(1.4, 2.0)).unwrap_err();
    assert!(matches!(err, OsdError::InvalidSpec { .. }));
    assert!(manager.is_empty());
    assert!(!manager.has_pending_renders());

    manager.submit("volume", &bar(0.4, 2.0)).unwrap();
    manager.run_render_tasks();
    let before = manager.session("volume").map(|s| (s.id(), s.deadline(), s.epoch()));

    assert!(manager.submit("volume", &bar(-0.1, 9.0)).is_err());
    let after = manager.session("volume").map(|s| (s.id(), s.deadline(), s.epoch()));
    assert_eq!(before, after);
    assert_eq!(shown_fraction(&manager, "volume"), Some(0.4));
}

#[test]
fn huge_timeout_never_expires() {
    let (mut manager, _) = manager_with_outputs(&["DP-1"]);
    manager.submit("volume", &bar(0.4, 1e19)).unwrap();
    manager.run_render_tasks();

    assert_eq!(manager.session("volume").map(|s| s.deadline()), Some(Deadline::Never));
    assert_eq!(manager.next_deadline(), None);

    tick(&mut manager, Duration::from_secs(3600));
    assert_eq!(manager.channels(), vec!["volume".to_string()]);
}

#[test]
fn rapid_updates_coalesce_to_the_last() {
    let (mut manager, _) = manager_with_outputs(&["DP-1"]);
    let start = manager.clock().now();

    let fractions = [0.1, 0.2, 0.3, 0.4, 0.5];
    for (i, fraction) in fractions.iter().enumerate() {
        manager.clock().set(start + ms(100 * i as u64));
        manager.submit("volume", &bar(*fraction, 1.0)).unwrap();
    }
    assert_eq!(manager.provider().created_surfaces(), 0);
    assert_eq!(manager.run_render_tasks(), 1);

    let last = bar(0.5, 1.0);
    let session = manager.session("volume").unwrap();
    assert_eq!(
        session.model(),
        &DrawingModel::build(&last, &Style::default()).unwrap()
    );
    assert_eq!(
        session.deadline(),
        Deadline::At(start + ms(400) + ms(1000))
    );
}

#[test]
fn shorter_timeout_does_not_shorten_deadline() {
    let (mut manager, _) = manager_with_outputs(&["DP-1"]);
    let start = manager.clock().now();

    manager.submit("volume", &bar(0.4, 5.0)).unwrap();
    manager.submit("volume", &bar(0.5, 1.0)).unwrap();
    manager.run_render_tasks();
    assert_eq!(
        manager.session("volume").map(|s| s.deadline()),
        Some(Deadline::At(start + ms(5000)))
    );

    tick(&mut manager, ms(1000));
    assert!(manager.session("volume").is_some());
}

#[test]
fn no_timeout_stays_until_dismissed() {
    let (mut manager, _) = manager_with_outputs(&["DP-1"]);

    manager
        .submit("caps", &DrawingSpec::new(vec![ItemSpec::icon("caps-lock")]))
        .unwrap();
    manager.run_render_tasks();
    assert_eq!(manager.next_deadline(), None);

    tick(&mut manager, Duration::from_secs(3600));
    assert!(manager.session("caps").is_some());

    assert!(manager.dismiss("caps"));
    assert!(manager.is_empty());
    assert_eq!(manager.provider().live_surfaces(), 0);
}

#[test]
fn default_timeout_applies_to_specs_without_one() {
    let (manager, _) = manager_with_outputs(&["DP-1"]);
    let mut manager = manager.with_default_timeout(Some(ms(3000)));

    manager
        .submit("volume", &DrawingSpec::new(vec![ItemSpec::bar(0.3)]))
        .unwrap();
    manager.run_render_tasks();

    tick(&mut manager, ms(3000));
    assert!(manager.is_empty());
}

#[test]
fn dismiss_unknown_channel_is_a_no_op() {
    let (mut manager, _) = manager_with_outputs(&["DP-1"]);
    manager.submit("volume", &bar(0.4, 2.0)).unwrap();

    assert!(!manager.dismiss("brightness"));
    assert_eq!(manager.channels(), vec!["volume"]);
    assert_eq!(manager.recently_closed().count(), 0);
}

#[test]
fn dismiss_matching_closes_a_group() {
    let (mut manager, _) = manager_with_outputs(&["DP-1"]);
    for channel in ["media.title", "media.artist", "volume"] {
        manager.submit(channel, &bar(0.4, 2.0)).unwrap();
    }
    manager.run_render_tasks();

    let closed = manager.dismiss_matching(|channel| channel.starts_with("media."));
    assert_eq!(closed, vec!["media.artist", "media.title"]);
    assert_eq!(manager.channels(), vec!["volume"]);
    assert_eq!(manager.provider().live_surfaces(), 1);
}

#[test]
fn dismiss_before_first_render_drops_the_render() {
    let (mut manager, _) = manager_with_outputs(&["DP-1"]);
    manager.submit("volume", &bar(0.4, 2.0)).unwrap();
    manager.dismiss("volume");

    assert!(!manager.has_pending_renders());
    assert_eq!(manager.run_render_tasks(), 0);
    assert_eq!(manager.provider().created_surfaces(), 0);
}

#[test]
fn timer_fires_exactly_once() {
    let (mut manager, _) = manager_with_outputs(&["DP-1"]);
    manager.submit("volume", &bar(0.4, 1.0)).unwrap();
    manager.run_render_tasks();

    manager.clock().advance(ms(1000));
    assert_eq!(manager.fire_timers(), 1);
    assert_eq!(manager.fire_timers(), 0);

    // A new session on the same channel is a fresh instance with its own timer
    let reopened = manager.submit("volume", &bar(0.4, 1.0)).unwrap();
    assert_ne!(Some(reopened), manager.recently_closed().last().map(|c| c.id));
    assert_eq!(manager.fire_timers(), 0);
}

#[test]
fn update_in_the_same_turn_as_the_deadline_wins() {
    let (mut manager, _) = manager_with_outputs(&["DP-1"]);
    manager.submit("volume", &bar(0.4, 1.0)).unwrap();
    manager.run_render_tasks();

    // Requests are handled before expired timers within a turn
    manager.clock().advance(ms(1000));
    manager.submit("volume", &bar(0.7, 1.0)).unwrap();
    assert_eq!(manager.fire_timers(), 0);
    manager.run_render_tasks();
    assert_eq!(shown_fraction(&manager, "volume"), Some(0.7));
}

// ═══════════════════════════════════════════════════════════════════════════
// Outputs
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn new_output_gets_existing_overlays() {
    let (mut manager, ids) = manager_with_outputs(&["DP-1"]);
    manager.submit("volume", &bar(0.4, 5.0)).unwrap();
    manager.run_render_tasks();

    let second = manager
        .provider_mut()
        .add_output("DP-2", OutputGeometry::new(2560, 1440).at(1920, 0));
    tick(&mut manager, Duration::ZERO);

    assert_eq!(
        manager.session("volume").map(|s| s.outputs()),
        Some(vec![ids[0], second])
    );
    assert_eq!(manager.provider().live_surfaces_on(second), 1);
}

#[test]
fn losing_one_output_keeps_the_session() {
    let (mut manager, ids) = manager_with_outputs(&["DP-1", "DP-2"]);
    manager.submit("volume", &bar(0.4, 5.0)).unwrap();
    manager.run_render_tasks();

    manager.provider_mut().remove_output(ids[0]);
    tick(&mut manager, Duration::ZERO);

    let session = manager.session("volume").unwrap();
    assert_eq!(session.state(), SessionState::Visible);
    assert_eq!(session.outputs(), vec![ids[1]]);
    assert_eq!(manager.provider().live_surfaces_on(ids[0]), 0);
}

#[test]
fn losing_every_output_closes_the_session() {
    let (mut manager, ids) = manager_with_outputs(&["DP-1"]);
    manager.submit("volume", &bar(0.4, 5.0)).unwrap();
    manager.run_render_tasks();

    manager.provider_mut().remove_output(ids[0]);
    tick(&mut manager, Duration::ZERO);

    assert!(manager.is_empty());
    assert_eq!(manager.next_deadline(), None);
    assert_eq!(
        manager.recently_closed().last().map(|c| c.reason),
        Some(CloseReason::NoOutput)
    );
    assert_eq!(manager.provider().live_surfaces(), 0);
}

#[test]
fn losing_the_drawn_output_moves_to_a_healed_one() {
    let (mut manager, ids) = manager_with_outputs(&["DP-1", "DP-2"]);
    manager.provider_mut().fail_output(ids[1]);
    let id = manager.submit("volume", &bar(0.4, 5.0)).unwrap();
    manager.run_render_tasks();
    assert_eq!(manager.session("volume").map(|s| s.outputs()), Some(vec![ids[0]]));

    manager.provider_mut().heal(ids[1]);
    manager.provider_mut().remove_output(ids[0]);
    tick(&mut manager, Duration::ZERO);

    let session = manager.session("volume").unwrap();
    assert_eq!(session.id(), id);
    assert_eq!(session.state(), SessionState::Visible);
    assert_eq!(session.outputs(), vec![ids[1]]);
    assert_eq!(manager.recently_closed().count(), 0);
}

#[test]
fn primary_fallback_follows_a_new_primary() {
    let (mut manager, ids) = manager_with_outputs(&["DP-1", "DP-2"]);
    let mut spec = bar(0.4, 5.0);
    spec.output = Some("HDMI-A-9".into());
    let id = manager.submit("volume", &spec).unwrap();
    manager.run_render_tasks();
    assert_eq!(manager.session("volume").map(|s| s.outputs()), Some(vec![ids[0]]));

    manager.provider_mut().remove_output(ids[0]);
    tick(&mut manager, Duration::ZERO);

    let session = manager.session("volume").unwrap();
    assert_eq!(session.id(), id);
    assert_eq!(session.outputs(), vec![ids[1]]);
}

#[test]
fn output_loss_leaves_other_channels_alone() {
    let (mut manager, ids) = manager_with_outputs(&["DP-1", "DP-2"]);
    let mut left = bar(0.4, 5.0);
    left.output = Some("DP-1".into());
    let mut right = bar(0.7, 5.0);
    right.output = Some("DP-2".into());
    manager.submit("volume", &left).unwrap();
    manager.submit("brightness", &right).unwrap();
    manager.run_render_tasks();
    let before = manager
        .session("brightness")
        .map(|s| (s.id(), s.deadline(), s.outputs()));

    // Volume loses its only output and cannot move to DP-2
    manager.provider_mut().fail_output(ids[1]);
    manager.provider_mut().remove_output(ids[0]);
    tick(&mut manager, Duration::ZERO);

    assert_eq!(manager.channels(), vec!["brightness".to_string()]);
    assert_eq!(
        manager.recently_closed().last().map(|c| (c.channel.as_str(), c.reason)),
        Some(("volume", CloseReason::NoOutput))
    );
    let session = manager.session("brightness").unwrap();
    assert_eq!(session.state(), SessionState::Visible);
    assert_eq!(
        Some((session.id(), session.deadline(), session.outputs())),
        before
    );
    assert_eq!(shown_fraction(&manager, "brightness"), Some(0.7));
    assert_eq!(manager.provider().live_surfaces_on(ids[1]), 1);
}

#[test]
fn geometry_change_rerenders_in_place() {
    let (mut manager, ids) = manager_with_outputs(&["DP-1"]);
    manager.submit("volume", &bar(0.4, 5.0)).unwrap();
    manager.run_render_tasks();

    manager
        .provider_mut()
        .set_geometry(ids[0], OutputGeometry::new(1920, 1080).with_scale(2.0));
    pump(&mut manager);
    assert!(manager.has_pending_renders());
    manager.run_render_tasks();

    let session = manager.session("volume").unwrap();
    let frame = session.surface(ids[0]).and_then(|s| s.frame()).copied().unwrap();
    assert_eq!(frame.buffer_width, frame.width * 2);
    assert_eq!(manager.provider().created_surfaces(), 1);
}

#[test]
fn geometry_change_and_expiry_in_one_turn() {
    let (mut manager, ids) = manager_with_outputs(&["DP-1"]);
    manager.submit("volume", &bar(0.4, 1.0)).unwrap();
    manager.run_render_tasks();

    manager
        .provider_mut()
        .set_geometry(ids[0], OutputGeometry::new(1280, 720));
    tick(&mut manager, ms(1000));

    assert!(manager.is_empty());
    assert!(!manager.has_pending_renders());
    assert_eq!(manager.provider().live_surfaces(), 0);
}

#[test]
fn failing_output_is_skipped() {
    let (mut manager, ids) = manager_with_outputs(&["DP-1", "DP-2"]);
    manager.provider_mut().fail_output(ids[1]);

    manager.submit("volume", &bar(0.4, 2.0)).unwrap();
    manager.run_render_tasks();

    let session = manager.session("volume").unwrap();
    assert_eq!(session.state(), SessionState::Visible);
    assert_eq!(session.outputs(), vec![ids[0]]);
}

#[test]
fn no_usable_output_closes_the_session() {
    let (mut manager, ids) = manager_with_outputs(&["DP-1"]);
    manager.provider_mut().fail_output(ids[0]);

    // Accepted, then fails at render time
    manager.submit("volume", &bar(0.4, 2.0)).unwrap();
    manager.run_render_tasks();

    assert!(manager.is_empty());
    assert_eq!(manager.next_deadline(), None);
    assert_eq!(
        manager.recently_closed().last().map(|c| c.reason),
        Some(CloseReason::NoOutput)
    );
}

#[test]
fn no_outputs_at_all() {
    let mut manager =
        SessionManager::new(HeadlessBackend::new(), Renderer::without_fonts(), ManualClock::new());

    manager.submit("volume", &bar(0.4, 2.0)).unwrap();
    assert_eq!(manager.run_render_tasks(), 0);
    assert!(manager.is_empty());
}

#[test]
fn named_output_only() {
    let (mut manager, ids) = manager_with_outputs(&["DP-1", "HDMI-A-1"]);
    let mut spec = bar(0.4, 2.0).with_anchor(&[AnchorEdge::Bottom]);
    spec.output = Some("HDMI-A-1".into());

    manager.submit("volume", &spec).unwrap();
    manager.run_render_tasks();
    assert_eq!(
        manager.session("volume").map(|s| s.outputs()),
        Some(vec![ids[1]])
    );
}

// ═══════════════════════════════════════════════════════════════════════════
// Shutdown
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn shutdown_releases_everything() {
    let (mut manager, _) = manager_with_outputs(&["DP-1", "DP-2"]);
    manager.submit("volume", &bar(0.4, 2.0)).unwrap();
    manager
        .submit("caps", &DrawingSpec::new(vec![ItemSpec::icon("caps-lock")]))
        .unwrap();
    manager.run_render_tasks();
    manager.submit("brightness", &bar(0.2, 2.0)).unwrap();
    assert_eq!(manager.provider().live_surfaces(), 4);

    manager.shutdown();

    assert!(manager.is_empty());
    assert!(!manager.has_pending_renders());
    assert_eq!(manager.next_deadline(), None);
    assert_eq!(manager.provider().live_surfaces(), 0);
    assert!(
        manager
            .recently_closed()
            .all(|closed| closed.reason == CloseReason::Shutdown)
    );
}
