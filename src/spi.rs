//! # Stream Primitives
//!
//! The push-pull primitives every materialized pipeline produces or consumes:
//! [`Publisher`], [`Subscriber`], [`Subscription`] and [`Processor`]. These
//! follow the conventional reactive-streams method contracts so pipelines
//! interoperate with externally authored implementations:
//!
//! - a subscriber receives exactly one `on_subscribe` before any other signal;
//! - `on_next` signals arrive in order and never exceed requested demand;
//! - exactly one of `on_complete` or `on_error` ends the stream, after which
//!   no further signal is delivered;
//! - `request` is additive and may be called from inside a signal handler;
//! - `cancel` is idempotent and stops future delivery.
//!
//! Signal receivers take `&self` and endpoints are shared as [`Arc`]:
//! implementations keep their own interior mutability, and the pipeline
//! machinery guarantees signal delivery to any one endpoint is serialized.
//!
//! ## Type-erased element flow
//!
//! Inside a materialized pipeline, elements flow as [`AnyItem`], the same
//! type-erased `Arc<dyn Any + Send + Sync>` transport used for zero-copy item
//! passing between stages. The typed builder facade erases at the entry edge
//! and downcasts at the exit edge, so user code never sees `AnyItem` unless
//! it implements an [`Engine`](crate::engine::Engine).

use std::any::Any;
use std::sync::Arc;

use crate::error::StreamError;

/// Type-erased pipeline element.
///
/// Elements are reference-counted so stages can hand them across without
/// copying; in normal flow each element has a single owner at any instant.
pub type AnyItem = Arc<dyn Any + Send + Sync>;

/// Wraps a concrete value as a type-erased pipeline element.
pub fn any_item<T: Send + Sync + 'static>(value: T) -> AnyItem {
  Arc::new(value)
}

/// Recovers the concrete value from a type-erased element.
///
/// Fails with an internal error when the element holds a different type or is
/// still aliased elsewhere; neither happens on a well-formed pipeline.
pub fn take_item<T: Send + Sync + 'static>(item: AnyItem, stage: &str) -> Result<T, StreamError> {
  match item.downcast::<T>() {
    Ok(arc) => Arc::try_unwrap(arc)
      .map_err(|_| StreamError::internal(stage, "element is aliased and cannot be moved")),
    Err(_) => Err(StreamError::internal(stage, "element type mismatch")),
  }
}

/// Link between a subscriber and the publisher it subscribed to.
///
/// Handed to the subscriber through [`Subscriber::on_subscribe`]; the
/// subscriber uses it to pace and stop the stream.
pub trait Subscription: Send + Sync {
  /// Adds `n` to the outstanding demand. Demand is cumulative and saturates
  /// rather than overflowing; `u64::MAX` is treated as unbounded. Requesting
  /// zero is a protocol violation and terminates the stream with an error.
  fn request(&self, n: u64);

  /// Stops the stream. No further signals are delivered to the subscriber
  /// once the cancellation takes effect, and the request propagates upstream.
  /// Idempotent.
  fn cancel(&self);
}

/// Receiver of stream signals.
pub trait Subscriber<T>: Send + Sync {
  /// Called exactly once, before any other signal, with the subscription
  /// controlling this stream.
  fn on_subscribe(&self, subscription: Arc<dyn Subscription>);

  /// Called once per element, in order, never beyond requested demand.
  fn on_next(&self, element: T);

  /// Terminal failure signal. Nothing follows it.
  fn on_error(&self, error: StreamError);

  /// Terminal success signal. Nothing follows it.
  fn on_complete(&self);
}

/// Source of a stream. Cold: production starts when a subscriber attaches
/// and requests demand.
pub trait Publisher<T>: Send + Sync {
  /// Attaches `subscriber` to this publisher. Pipelines built by this crate
  /// accept a single subscriber per materialization; a second subscriber is
  /// rejected with an error signal rather than corrupting the running
  /// stream.
  fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>);
}

impl<T> std::fmt::Debug for dyn Publisher<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str("Publisher")
  }
}

/// A stage that is both a subscriber and a publisher.
pub trait Processor<I, O>: Subscriber<I> + Publisher<O> {}

impl<T, S> Subscriber<T> for Arc<S>
where
  S: Subscriber<T> + ?Sized,
{
  fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
    (**self).on_subscribe(subscription);
  }

  fn on_next(&self, element: T) {
    (**self).on_next(element);
  }

  fn on_error(&self, error: StreamError) {
    (**self).on_error(error);
  }

  fn on_complete(&self) {
    (**self).on_complete();
  }
}

impl<T, P> Publisher<T> for Arc<P>
where
  P: Publisher<T> + ?Sized,
{
  fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
    (**self).subscribe(subscriber);
  }
}

impl<I, O, P> Processor<I, O> for Arc<P> where P: Processor<I, O> + ?Sized {}
