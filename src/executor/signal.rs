//! Signal queue and drain loop shared by one running pipeline.
//!
//! Every boundary object of a pipeline (the subscriptions it hands out, the
//! subscriber entries it exposes, the taps reading inner flat-map streams)
//! delivers its signal by appending an [`Event`] to the pipeline's queue and
//! then trying to become the drainer. If a drain is already in progress,
//! including re-entrantly on the same thread, the signal is left for the
//! active drainer to pick up. This serializes all signal processing for a
//! pipeline without blocking and without recursion: re-entrant demand from
//! inside a signal handler becomes one more queue entry, never a deeper
//! stack.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::trace;

use crate::error::StreamError;
use crate::spi::{AnyItem, Subscriber, Subscription};

use super::interpreter::Interpreter;

/// One signal delivered to a running pipeline.
pub(crate) enum Event {
  /// Starts a pipeline that drives itself (terminal-ended shapes).
  Activate,
  /// A downstream subscriber attached to the pipeline's publisher end.
  DownstreamSubscribed(Arc<dyn Subscriber<AnyItem>>),
  /// The downstream party requested `n` more elements.
  Request(u64),
  /// The downstream party cancelled the stream.
  CancelDownstream,
  /// The external upstream granted its subscription.
  UpstreamSubscribed(Arc<dyn Subscription>),
  /// An element arrived from the external upstream.
  UpstreamNext(AnyItem),
  /// The external upstream failed.
  UpstreamError(StreamError),
  /// The external upstream completed.
  UpstreamComplete,
  /// An inner flat-map stream granted its subscription.
  InnerSubscribed {
    /// Index of the flat-map operator owning the inner stream.
    op: usize,
    /// The inner stream's subscription.
    subscription: Arc<dyn Subscription>,
  },
  /// An element arrived from an inner flat-map stream.
  InnerNext {
    /// Index of the flat-map operator owning the inner stream.
    op: usize,
    /// The element.
    item: AnyItem,
  },
  /// An inner flat-map stream failed.
  InnerError {
    /// Index of the flat-map operator owning the inner stream.
    op: usize,
    /// The inner failure.
    error: StreamError,
  },
  /// An inner flat-map stream completed.
  InnerComplete {
    /// Index of the flat-map operator owning the inner stream.
    op: usize,
  },
}

impl Event {
  pub(crate) fn name(&self) -> &'static str {
    match self {
      Event::Activate => "activate",
      Event::DownstreamSubscribed(_) => "downstream_subscribed",
      Event::Request(_) => "request",
      Event::CancelDownstream => "cancel",
      Event::UpstreamSubscribed(_) => "upstream_subscribed",
      Event::UpstreamNext(_) => "upstream_next",
      Event::UpstreamError(_) => "upstream_error",
      Event::UpstreamComplete => "upstream_complete",
      Event::InnerSubscribed { .. } => "inner_subscribed",
      Event::InnerNext { .. } => "inner_next",
      Event::InnerError { .. } => "inner_error",
      Event::InnerComplete { .. } => "inner_complete",
    }
  }
}

/// Shared heart of one running pipeline: the signal queue, the drain gate
/// and the interpreter state.
pub(crate) struct PipelineCell {
  queue: Mutex<VecDeque<Event>>,
  wip: AtomicUsize,
  interp: Mutex<Interpreter>,
}

impl PipelineCell {
  /// Creates a cell, giving the interpreter a weak handle back to it so the
  /// boundaries it spawns can signal.
  pub(crate) fn create(build: impl FnOnce(Weak<PipelineCell>) -> Interpreter) -> Arc<Self> {
    Arc::new_cyclic(|weak| PipelineCell {
      queue: Mutex::new(VecDeque::new()),
      wip: AtomicUsize::new(0),
      interp: Mutex::new(build(weak.clone())),
    })
  }

  /// Enqueues `event` and drains the queue unless a drain is already active.
  pub(crate) fn signal(&self, event: Event) {
    trace!(event = event.name(), "pipeline signal");
    self.lock_queue().push_back(event);
    self.drain();
  }

  /// Whether signals are waiting in the queue.
  pub(crate) fn has_pending(&self) -> bool {
    !self.lock_queue().is_empty()
  }

  fn drain(&self) {
    if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
      // Another drain is in flight; it will see this signal.
      return;
    }
    let mut interp = self.interp.lock().unwrap_or_else(|e| e.into_inner());
    let mut missed = 1usize;
    loop {
      loop {
        let event = self.lock_queue().pop_front();
        match event {
          Some(event) => interp.handle(event),
          None => break,
        }
      }
      interp.advance();
      let previous = self.wip.fetch_sub(missed, Ordering::AcqRel);
      let remaining = previous - missed;
      if remaining == 0 {
        break;
      }
      missed = remaining;
    }
  }

  fn lock_queue(&self) -> MutexGuard<'_, VecDeque<Event>> {
    self.queue.lock().unwrap_or_else(|e| e.into_inner())
  }
}
