//! Read Loop.
//!
//! One spawned task per session pulls decoded items from the transport,
//! converts frames to typed reports and hands them to the dispatcher. It
//! never sends commands.
//!
//! # States
//!
//! ```text
//! Idle ──► Reading ──► Decoding ──► Dispatching ──┐
//!             ^                                   │
//!             └───────────────────────────────────┘
//!
//! EOF / read error / close ──► Stopped
//! ```
//!
//! Frame errors are logged, forwarded as diagnostics and skipped. When the
//! transport fails the loop marks the link lost, fails every pending reply
//! with `TransportLost` and stops; later sends fail fast without touching the
//! transport.

use futures::StreamExt;
use std::sync::{Arc, PoisonError, RwLock};
use telemetrix_core::{Error, FrameError, Result};
use telemetrix_protocol::TelemetrixCodec;
use tokio::io::AsyncRead;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tracing::{debug, error, info, trace, warn};

use crate::dispatcher::{Diagnostic, ReportDispatcher};
use crate::pending::PendingReplies;

/// Observable state of the read loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Created, not yet reading.
    Idle,
    /// Waiting for bytes from the transport.
    Reading,
    /// Converting a complete frame to a report.
    Decoding,
    /// Running the dispatcher for a report.
    Dispatching,
    /// Terminal; the transport is gone.
    Stopped,
}

/// Whether the link can still carry commands.
#[derive(Debug, Default)]
pub(crate) struct LinkStatus {
    lost: RwLock<Option<String>>,
}

impl LinkStatus {
    /// Record the loss. The first reason wins.
    pub(crate) fn mark_lost(&self, reason: &str) -> bool {
        let mut lost = self.lost.write().unwrap_or_else(PoisonError::into_inner);
        if lost.is_some() {
            return false;
        }
        *lost = Some(reason.to_string());
        true
    }

    pub(crate) fn check(&self) -> Result<()> {
        match &*self.lost.read().unwrap_or_else(PoisonError::into_inner) {
            Some(reason) => Err(Error::TransportLost(reason.clone())),
            None => Ok(()),
        }
    }

    pub(crate) fn is_lost(&self) -> bool {
        self.check().is_err()
    }
}

/// Everything the read loop shares with the session.
#[derive(Debug)]
pub(crate) struct LoopContext {
    pub(crate) dispatcher: ReportDispatcher,
    pub(crate) pending: Arc<PendingReplies>,
    pub(crate) link: LinkStatus,
    pub(crate) state: watch::Sender<LoopState>,
}

impl LoopContext {
    pub(crate) fn new(dispatcher: ReportDispatcher, pending: Arc<PendingReplies>) -> Self {
        let (state, _) = watch::channel(LoopState::Idle);
        Self {
            dispatcher,
            pending,
            link: LinkStatus::default(),
            state,
        }
    }

    fn set_state(&self, state: LoopState) {
        self.state.send_if_modified(|current| {
            if *current == state || *current == LoopState::Stopped {
                return false;
            }
            *current = state;
            true
        });
    }

    /// Tear the link down: refuse sends, fail waiters, publish `Stopped`.
    pub(crate) fn stop(&self, reason: &str) {
        if self.link.mark_lost(reason) {
            info!(reason, "Link stopped");
        }
        self.pending.fail_all(reason);
        self.state.send_replace(LoopState::Stopped);
    }

    fn handle_frame_error(&self, frame_error: FrameError) {
        warn!(
            kind = %frame_error.kind,
            discarded = frame_error.discarded,
            "Discarded malformed input"
        );
        self.dispatcher.diagnose(&Diagnostic::Frame(frame_error));
    }
}

/// Spawn the read loop over `reader`.
pub(crate) fn spawn<R>(reader: R, ctx: Arc<LoopContext>) -> JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let frames = FramedRead::new(reader, TelemetrixCodec::new());
    tokio::spawn(run(frames, ctx))
}

async fn run<R>(mut frames: FramedRead<R, TelemetrixCodec>, ctx: Arc<LoopContext>)
where
    R: AsyncRead + Unpin,
{
    debug!("Read loop started");

    let reason = loop {
        ctx.set_state(LoopState::Reading);
        let item = match frames.next().await {
            Some(Ok(item)) => item,
            Some(Err(e)) => {
                error!(error = %e, "Transport read failed");
                break format!("read failed: {e}");
            }
            None => {
                error!("Transport closed by peer");
                break "transport closed".to_string();
            }
        };

        ctx.set_state(LoopState::Decoding);
        let frame = match item {
            Ok(frame) => frame,
            Err(frame_error) => {
                ctx.handle_frame_error(frame_error);
                continue;
            }
        };
        let report = match frame.report() {
            Ok(report) => report,
            Err(kind) => {
                ctx.handle_frame_error(FrameError::new(kind, frame.wire_len()));
                continue;
            }
        };

        ctx.set_state(LoopState::Dispatching);
        trace!(report = ?report, "Dispatching report");
        ctx.dispatcher.dispatch(&report);
    };

    ctx.stop(&reason);
    debug!("Read loop finished");
}
