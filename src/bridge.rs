//! # Stream Bridge
//!
//! Adapts a built [`Publisher`] into a [`Stream`] so pipelines compose with
//! async Rust. The bridge subscribes with a channel-backed subscriber,
//! requests a window of `capacity` elements up front and replenishes demand
//! one element at a time as the stream consumer makes progress, so the
//! publisher never outruns the consumer by more than the window. Dropping
//! the stream cancels the subscription.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_stream::stream;
use tokio::sync::mpsc;
use tokio_stream::Stream;

use crate::error::StreamError;
use crate::spi::{Publisher, Subscriber, Subscription};

enum BridgeSignal<T> {
  Next(T),
  Error(StreamError),
  Complete,
}

struct BridgeShared {
  subscription: Mutex<Option<Arc<dyn Subscription>>>,
  outstanding: AtomicU64,
}

impl BridgeShared {
  fn subscription(&self) -> Option<Arc<dyn Subscription>> {
    self
      .subscription
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .clone()
  }
}

struct BridgeSubscriber<T> {
  tx: mpsc::UnboundedSender<BridgeSignal<T>>,
  shared: Arc<BridgeShared>,
  capacity: u64,
}

impl<T: Send + Sync + 'static> Subscriber<T> for BridgeSubscriber<T> {
  fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
    *self
      .shared
      .subscription
      .lock()
      .unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&subscription));
    self.shared.outstanding.store(self.capacity, Ordering::SeqCst);
    subscription.request(self.capacity);
  }

  fn on_next(&self, element: T) {
    let within_demand = self
      .shared
      .outstanding
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
      .is_ok();
    if within_demand {
      let _ = self.tx.send(BridgeSignal::Next(element));
    } else {
      if let Some(subscription) = self.shared.subscription() {
        subscription.cancel();
      }
      let _ = self.tx.send(BridgeSignal::Error(StreamError::protocol(
        "bridge",
        "element delivered without outstanding demand",
      )));
    }
  }

  fn on_error(&self, error: StreamError) {
    let _ = self.tx.send(BridgeSignal::Error(error));
  }

  fn on_complete(&self) {
    let _ = self.tx.send(BridgeSignal::Complete);
  }
}

struct CancelOnDrop {
  shared: Arc<BridgeShared>,
}

impl Drop for CancelOnDrop {
  fn drop(&mut self) {
    let subscription = self
      .shared
      .subscription
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .take();
    if let Some(subscription) = subscription {
      subscription.cancel();
    }
  }
}

/// Adapts `publisher` into a stream of elements with a demand window of
/// `capacity` (raised to one when zero is given). Upstream failure ends the
/// stream with an `Err` item; completion just ends it.
pub fn into_stream<T: Send + Sync + 'static>(
  publisher: &dyn Publisher<T>,
  capacity: usize,
) -> impl Stream<Item = Result<T, StreamError>> + Send {
  let capacity = (capacity.max(1)) as u64;
  let (tx, mut rx) = mpsc::unbounded_channel();
  let shared = Arc::new(BridgeShared {
    subscription: Mutex::new(None),
    outstanding: AtomicU64::new(0),
  });
  publisher.subscribe(Arc::new(BridgeSubscriber {
    tx,
    shared: Arc::clone(&shared),
    capacity,
  }));
  stream! {
    let _guard = CancelOnDrop {
      shared: Arc::clone(&shared),
    };
    while let Some(signal) = rx.recv().await {
      match signal {
        BridgeSignal::Next(element) => {
          yield Ok(element);
          shared.outstanding.fetch_add(1, Ordering::SeqCst);
          if let Some(subscription) = shared.subscription() {
            subscription.request(1);
          }
        }
        BridgeSignal::Error(error) => {
          yield Err(error);
          break;
        }
        BridgeSignal::Complete => break,
      }
    }
  }
}
