//! Single-threaded driver tying the backend, requests and timers together
//!
//! Each [`turn`](EventLoop::turn) processes, in order:
//! 1. output events from the backend, in delivery order
//! 2. queued requests, in submission order
//! 3. expired timers
//! 4. queued renders, at most one per channel
//!
//! The only blocking point is the backend wait at the start of a turn.

use std::fmt;
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::time::Duration;

use tracing::{debug, error, info, warn};
use wlosd_types::{DrawingSpec, Style};

use crate::clock::{Clock, SystemClock};
use crate::error::OsdError;
use crate::manager::SessionManager;
use crate::platform::Backend;

/// Channel predicate used by [`Request::DismissMatching`]
pub type ChannelFilter = Box<dyn Fn(&str) -> bool + Send>;

/// Work handed to the loop by a request source
pub enum Request {
    Submit { channel: String, spec: DrawingSpec },
    Dismiss { channel: String },
    DismissMatching(ChannelFilter),
    SetStyle(Style),
    /// Reply with the sorted live channels
    ListChannels(Sender<Vec<String>>),
    Shutdown,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Submit { channel, spec } => f
                .debug_struct("Submit")
                .field("channel", channel)
                .field("spec", spec)
                .finish(),
            Self::Dismiss { channel } => f.debug_struct("Dismiss").field("channel", channel).finish(),
            Self::DismissMatching(_) => f.write_str("DismissMatching(..)"),
            Self::SetStyle(style) => f.debug_tuple("SetStyle").field(style).finish(),
            Self::ListChannels(_) => f.write_str("ListChannels(..)"),
            Self::Shutdown => f.write_str("Shutdown"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Continue,
    Shutdown,
}

pub struct EventLoop<B: Backend, C: Clock = SystemClock> {
    manager: SessionManager<B, C>,
    requests: Receiver<Request>,
    /// Longest wait before looking at the request queue again
    poll_interval: Duration,
}

impl<B: Backend, C: Clock> EventLoop<B, C> {
    pub fn new(manager: SessionManager<B, C>, requests: Receiver<Request>, poll_interval: Duration) -> Self {
        Self {
            manager,
            requests,
            poll_interval,
        }
    }

    pub fn manager(&self) -> &SessionManager<B, C> {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> &mut SessionManager<B, C> {
        &mut self.manager
    }

    /// Run turns until shutdown is requested, the request source goes away,
    /// or the compositor connection fails. Every session is closed on return.
    pub fn run(&mut self) -> Result<(), OsdError> {
        info!(poll_ms = self.poll_interval.as_millis() as u64, "Event loop started");
        let result = loop {
            match self.turn(self.poll_interval) {
                Ok(TurnOutcome::Continue) => {}
                Ok(TurnOutcome::Shutdown) => break Ok(()),
                Err(e) => {
                    error!(error = %e, "Event loop stopped");
                    break Err(e);
                }
            }
        };
        self.manager.shutdown();
        result
    }

    /// One pass over every event source, waiting at most `max_wait` for
    /// compositor traffic when there is nothing else to do.
    pub fn turn(&mut self, max_wait: Duration) -> Result<TurnOutcome, OsdError> {
        let wait = self.wait_budget(max_wait);

        match self.manager.provider_mut().dispatch(wait) {
            Ok(events) => {
                for event in events {
                    self.manager.handle_output_event(event);
                }
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => warn!(error = %e, "Backend dispatch failed"),
        }

        loop {
            match self.requests.try_recv() {
                Ok(request) => {
                    if self.handle_request(request) == TurnOutcome::Shutdown {
                        return Ok(TurnOutcome::Shutdown);
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    info!("Request source closed");
                    return Ok(TurnOutcome::Shutdown);
                }
            }
        }

        self.manager.fire_timers();
        self.manager.run_render_tasks();
        Ok(TurnOutcome::Continue)
    }

    fn wait_budget(&mut self, max_wait: Duration) -> Duration {
        if self.manager.has_pending_renders() {
            return Duration::ZERO;
        }
        match self.manager.next_deadline() {
            Some(at) => at
                .saturating_duration_since(self.manager.clock().now())
                .min(max_wait),
            None => max_wait,
        }
    }

    fn handle_request(&mut self, request: Request) -> TurnOutcome {
        debug!(?request, "Request");
        match request {
            Request::Submit { channel, spec } => {
                // Rejections are logged by the manager and affect only this request
                let _ = self.manager.submit(&channel, &spec);
            }
            Request::Dismiss { channel } => {
                self.manager.dismiss(&channel);
            }
            Request::DismissMatching(filter) => {
                self.manager.dismiss_matching(filter);
            }
            Request::SetStyle(style) => {
                self.manager.set_style(style);
                info!("Style updated");
            }
            Request::ListChannels(reply) => {
                if reply.send(self.manager.channels()).is_err() {
                    debug!("Channel list requester went away");
                }
            }
            Request::Shutdown => return TurnOutcome::Shutdown,
        }
        TurnOutcome::Continue
    }
}
