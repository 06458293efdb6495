//! # Completion Handles
//!
//! A [`CompletionHandle`] represents the eventual single result of a pipeline
//! run: the collected value on success, or the [`StreamError`] that
//! terminated the stream. The executor resolves a handle exactly once; later
//! resolutions are ignored.
//!
//! Observation is non-blocking. Callers can register a callback with
//! [`on_resolved`](CompletionHandle::on_resolved), inspect the handle with
//! [`try_result`](CompletionHandle::try_result), or `.await` it (the handle
//! implements [`Future`]). There is no blocking wait.
//!
//! Engines work with the type-erased [`RawCompletion`]; the typed handle
//! wraps one together with a conversion out of the erased element transport.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::task::AtomicWaker;

use crate::error::StreamError;
use crate::spi::AnyItem;

type RawResult = Result<AnyItem, StreamError>;
type RawObserver = Box<dyn FnOnce(RawResult) + Send>;

struct CompletionState {
  result: Option<RawResult>,
  observers: Vec<RawObserver>,
}

/// Type-erased single-resolution result cell shared between an engine's
/// running pipeline and the handles observing it.
pub struct RawCompletion {
  state: Mutex<CompletionState>,
  waker: AtomicWaker,
}

impl RawCompletion {
  /// Creates an unresolved completion.
  pub fn new() -> Self {
    Self {
      state: Mutex::new(CompletionState {
        result: None,
        observers: Vec::new(),
      }),
      waker: AtomicWaker::new(),
    }
  }

  /// Resolves the completion. The first resolution wins; every later call is
  /// a no-op. Registered observers run immediately, outside the internal
  /// lock.
  pub fn resolve(&self, result: RawResult) {
    let observers = {
      let mut state = self.lock();
      if state.result.is_some() {
        return;
      }
      state.result = Some(result.clone());
      std::mem::take(&mut state.observers)
    };
    for observer in observers {
      observer(result.clone());
    }
    self.waker.wake();
  }

  /// Whether the completion has been resolved.
  pub fn is_resolved(&self) -> bool {
    self.lock().result.is_some()
  }

  /// Registers an observer. Runs immediately when already resolved.
  pub fn observe(&self, observer: RawObserver) {
    let ready = {
      let mut state = self.lock();
      match &state.result {
        Some(result) => Some(result.clone()),
        None => {
          state.observers.push(observer);
          return;
        }
      }
    };
    if let Some(result) = ready {
      observer(result);
    }
  }

  fn peek(&self) -> Option<RawResult> {
    self.lock().result.clone()
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, CompletionState> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }
}

impl Default for RawCompletion {
  fn default() -> Self {
    Self::new()
  }
}

pub(crate) type Convert<R> = Arc<dyn Fn(AnyItem) -> Result<R, StreamError> + Send + Sync>;

/// Handle for the eventual single result of a pipeline run.
///
/// Cloneable; every clone observes the same resolution.
pub struct CompletionHandle<R> {
  raw: Arc<RawCompletion>,
  convert: Convert<R>,
}

impl<R> std::fmt::Debug for CompletionHandle<R> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CompletionHandle").finish_non_exhaustive()
  }
}

impl<R> Clone for CompletionHandle<R> {
  fn clone(&self) -> Self {
    Self {
      raw: Arc::clone(&self.raw),
      convert: Arc::clone(&self.convert),
    }
  }
}

impl<R: Send + 'static> CompletionHandle<R> {
  pub(crate) fn new(raw: Arc<RawCompletion>, convert: Convert<R>) -> Self {
    Self { raw, convert }
  }

  /// Whether the run has finished, successfully or not.
  pub fn is_resolved(&self) -> bool {
    self.raw.is_resolved()
  }

  /// Registers a callback invoked with the run's result. When the run has
  /// already finished the callback runs immediately on the calling thread;
  /// otherwise it runs on the thread that resolves the run.
  pub fn on_resolved<F>(&self, f: F)
  where
    F: FnOnce(Result<R, StreamError>) + Send + 'static,
  {
    let convert = Arc::clone(&self.convert);
    self
      .raw
      .observe(Box::new(move |result| f(result.and_then(|item| convert(item)))));
  }

  /// Returns the result when the run has finished, `None` while it is still
  /// in flight.
  pub fn try_result(&self) -> Option<Result<R, StreamError>> {
    let result = self.raw.peek()?;
    Some(result.and_then(|item| (self.convert)(item)))
  }
}

impl<R: Send + 'static> Future for CompletionHandle<R> {
  type Output = Result<R, StreamError>;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    if let Some(result) = self.try_result() {
      return Poll::Ready(result);
    }
    self.raw.waker.register(cx.waker());
    match self.try_result() {
      Some(result) => Poll::Ready(result),
      None => Poll::Pending,
    }
  }
}
