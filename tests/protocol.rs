use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use proptest::prelude::*;

use fluxweave::{
  ConformanceFactory, EngineConformance, Publisher, StreamError, Subscriber, Subscription, builder,
  from_publisher, of,
};

#[derive(Debug, Clone, PartialEq)]
enum Signal {
  Subscribed,
  Next(i32),
  Error(String),
  Complete,
}

/// Records every signal in arrival order and exposes the subscription so
/// tests control demand explicitly.
struct TestSubscriber {
  signals: Mutex<Vec<Signal>>,
  subscription: Mutex<Option<Arc<dyn Subscription>>>,
}

impl TestSubscriber {
  fn new() -> Arc<Self> {
    Arc::new(Self {
      signals: Mutex::new(Vec::new()),
      subscription: Mutex::new(None),
    })
  }

  fn signals(&self) -> Vec<Signal> {
    self.signals.lock().unwrap().clone()
  }

  fn next_values(&self) -> Vec<i32> {
    self
      .signals()
      .into_iter()
      .filter_map(|s| match s {
        Signal::Next(v) => Some(v),
        _ => None,
      })
      .collect()
  }

  fn terminal_signals(&self) -> usize {
    self
      .signals()
      .iter()
      .filter(|s| matches!(s, Signal::Error(_) | Signal::Complete))
      .count()
  }

  fn request(&self, n: u64) {
    let subscription = self.subscription.lock().unwrap().clone();
    subscription.expect("subscription granted").request(n);
  }

  fn cancel(&self) {
    let subscription = self.subscription.lock().unwrap().clone();
    subscription.expect("subscription granted").cancel();
  }
}

impl Subscriber<i32> for TestSubscriber {
  fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
    *self.subscription.lock().unwrap() = Some(subscription);
    self.signals.lock().unwrap().push(Signal::Subscribed);
  }

  fn on_next(&self, element: i32) {
    self.signals.lock().unwrap().push(Signal::Next(element));
  }

  fn on_error(&self, error: StreamError) {
    self
      .signals
      .lock()
      .unwrap()
      .push(Signal::Error(error.message().to_string()));
  }

  fn on_complete(&self) {
    self.signals.lock().unwrap().push(Signal::Complete);
  }
}

struct ManualState {
  subscriber: Option<Arc<dyn Subscriber<i32>>>,
  requested: u64,
  total_granted: u64,
  cancels: usize,
}

/// Hand-driven publisher: tests feed it and watch the demand it receives.
#[derive(Clone)]
struct ManualUpstream {
  state: Arc<Mutex<ManualState>>,
}

impl ManualUpstream {
  fn new() -> Self {
    Self {
      state: Arc::new(Mutex::new(ManualState {
        subscriber: None,
        requested: 0,
        total_granted: 0,
        cancels: 0,
      })),
    }
  }

  fn requested(&self) -> u64 {
    self.state.lock().unwrap().requested
  }

  fn total_granted(&self) -> u64 {
    self.state.lock().unwrap().total_granted
  }

  fn cancels(&self) -> usize {
    self.state.lock().unwrap().cancels
  }

  fn subscriber(&self) -> Arc<dyn Subscriber<i32>> {
    self
      .state
      .lock()
      .unwrap()
      .subscriber
      .clone()
      .expect("subscriber attached")
  }

  /// Delivers one element, consuming one unit of granted demand.
  fn feed(&self, value: i32) {
    {
      let mut state = self.state.lock().unwrap();
      assert!(state.requested > 0, "feeding beyond requested demand");
      state.requested -= 1;
    }
    self.subscriber().on_next(value);
  }

  /// Delivers one element without checking demand, simulating a misbehaving
  /// upstream.
  fn feed_violating(&self, value: i32) {
    self.subscriber().on_next(value);
  }

  fn complete(&self) {
    self.subscriber().on_complete();
  }

  /// Feeds from `values` as demand arrives, then completes.
  fn pump(&self, values: &[i32]) {
    let mut remaining = values.iter().copied();
    loop {
      if self.requested() == 0 {
        break;
      }
      match remaining.next() {
        Some(value) => self.feed(value),
        None => {
          self.complete();
          return;
        }
      }
    }
    if remaining.len() == 0 {
      self.complete();
    }
  }
}

struct ManualSubscription {
  state: Arc<Mutex<ManualState>>,
}

impl Subscription for ManualSubscription {
  fn request(&self, n: u64) {
    let mut state = self.state.lock().unwrap();
    state.requested = state.requested.saturating_add(n);
    state.total_granted = state.total_granted.saturating_add(n);
  }

  fn cancel(&self) {
    let mut state = self.state.lock().unwrap();
    state.cancels += 1;
  }
}

impl Publisher<i32> for ManualUpstream {
  fn subscribe(&self, subscriber: Arc<dyn Subscriber<i32>>) {
    let subscription = {
      let mut state = self.state.lock().unwrap();
      state.subscriber = Some(Arc::clone(&subscriber));
      Arc::new(ManualSubscription {
        state: Arc::clone(&self.state),
      })
    };
    subscriber.on_subscribe(subscription);
  }
}

#[test]
fn identity_processor_relays_under_exact_demand() {
  let processor = builder::<i32>().map(|n| Ok(n * 2)).build_rs().unwrap();

  let downstream = TestSubscriber::new();
  processor.subscribe(downstream.clone());

  let upstream = ManualUpstream::new();
  let entry: Arc<dyn Subscriber<i32>> = Arc::new(Arc::clone(&processor));
  upstream.subscribe(entry);

  downstream.request(3);
  upstream.pump(&[1, 2, 3]);

  assert_eq!(downstream.next_values(), vec![2, 4, 6]);
  assert_eq!(
    downstream.signals().last(),
    Some(&Signal::Complete),
    "completion is forwarded after the elements"
  );
  assert_eq!(downstream.terminal_signals(), 1);
}

#[test]
fn no_elements_flow_without_demand() {
  let publisher = of(vec![1_i32, 2, 3]).build_rs().unwrap();
  let sub = TestSubscriber::new();
  publisher.subscribe(sub.clone());
  assert_eq!(sub.signals(), vec![Signal::Subscribed]);

  sub.request(2);
  assert_eq!(sub.next_values(), vec![1, 2]);

  sub.request(1);
  assert_eq!(sub.next_values(), vec![1, 2, 3]);
  assert_eq!(sub.signals().last(), Some(&Signal::Complete));
}

#[test]
fn completion_without_demand_on_empty_stream() {
  let publisher = of(Vec::<i32>::new()).build_rs().unwrap();
  let sub = TestSubscriber::new();
  publisher.subscribe(sub.clone());
  assert_eq!(sub.signals(), vec![Signal::Subscribed, Signal::Complete]);
}

#[test]
fn zero_demand_request_is_a_protocol_violation() {
  let publisher = of(vec![1_i32]).build_rs().unwrap();
  let sub = TestSubscriber::new();
  publisher.subscribe(sub.clone());
  sub.request(0);
  let signals = sub.signals();
  assert_eq!(signals.len(), 2);
  assert!(matches!(&signals[1], Signal::Error(_)));
}

#[test]
fn misbehaving_upstream_is_surfaced_not_absorbed() {
  let upstream = ManualUpstream::new();
  let publisher = from_publisher(upstream.clone()).build_rs().unwrap();
  let sub = TestSubscriber::new();
  publisher.subscribe(sub.clone());

  sub.request(1);
  upstream.feed(10);
  // A second element without any outstanding request breaks the contract.
  upstream.feed_violating(11);

  let signals = sub.signals();
  assert_eq!(signals[1], Signal::Next(10));
  assert!(matches!(signals.last(), Some(Signal::Error(_))));
  assert_eq!(sub.terminal_signals(), 1);
}

#[test]
fn cancellation_is_idempotent_and_propagates_once() {
  let upstream = ManualUpstream::new();
  let publisher = from_publisher(upstream.clone()).build_rs().unwrap();
  let sub = TestSubscriber::new();
  publisher.subscribe(sub.clone());

  sub.request(2);
  upstream.feed(5);
  sub.cancel();
  sub.cancel();

  assert_eq!(upstream.cancels(), 1);
  assert_eq!(sub.next_values(), vec![5]);
  assert_eq!(sub.terminal_signals(), 0, "cancellation is not acknowledged");
}

#[test]
fn no_signals_after_cancellation() {
  let publisher = of(vec![1_i32, 2, 3, 4]).build_rs().unwrap();
  let sub = TestSubscriber::new();
  publisher.subscribe(sub.clone());
  sub.request(1);
  let before = sub.signals().len();
  sub.cancel();
  sub.request(10);
  assert_eq!(sub.signals().len(), before);
}

#[test]
fn second_subscriber_is_rejected_with_an_error() {
  let publisher = of(vec![1_i32]).build_rs().unwrap();
  let first = TestSubscriber::new();
  let second = TestSubscriber::new();
  publisher.subscribe(first.clone());
  publisher.subscribe(second.clone());
  assert!(matches!(second.signals().last(), Some(Signal::Error(_))));
  // The first subscription is unaffected.
  first.request(1);
  assert_eq!(first.next_values(), vec![1]);
}

#[test]
fn reentrant_demand_from_inside_on_next_is_accounted_once() {
  struct Reentrant {
    seen: Mutex<Vec<i32>>,
    subscription: Mutex<Option<Arc<dyn Subscription>>>,
    completed: AtomicUsize,
  }

  impl Subscriber<i32> for Reentrant {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
      *self.subscription.lock().unwrap() = Some(Arc::clone(&subscription));
      subscription.request(1);
    }

    fn on_next(&self, element: i32) {
      self.seen.lock().unwrap().push(element);
      // One more element, requested from inside the delivery itself.
      let subscription = self.subscription.lock().unwrap().clone();
      if let Some(subscription) = subscription {
        subscription.request(1);
      }
    }

    fn on_error(&self, _error: StreamError) {}

    fn on_complete(&self) {
      self.completed.fetch_add(1, Ordering::SeqCst);
    }
  }

  let publisher = of((1..=50_i32).collect::<Vec<_>>()).build_rs().unwrap();
  let sub = Arc::new(Reentrant {
    seen: Mutex::new(Vec::new()),
    subscription: Mutex::new(None),
    completed: AtomicUsize::new(0),
  });
  publisher.subscribe(sub.clone());
  assert_eq!(sub.seen.lock().unwrap().clone(), (1..=50).collect::<Vec<_>>());
  assert_eq!(sub.completed.load(Ordering::SeqCst), 1);
}

#[test]
fn terminal_signal_is_exact_with_injected_failures() {
  for failure_at in 1..=6_i32 {
    let publisher = of((1..=6_i32).collect::<Vec<_>>())
      .map(move |n| {
        if n == failure_at {
          Err("injected".into())
        } else {
          Ok(n)
        }
      })
      .build_rs()
      .unwrap();
    let sub = TestSubscriber::new();
    publisher.subscribe(sub.clone());
    sub.request(u64::MAX);
    let signals = sub.signals();
    assert_eq!(sub.terminal_signals(), 1, "failure at {failure_at}");
    assert!(
      matches!(signals.last(), Some(Signal::Error(_))),
      "terminal must be the last signal"
    );
    assert_eq!(sub.next_values().len() as i32, failure_at - 1);
    // Demand arriving after the terminal state changes nothing.
    sub.request(5);
    assert_eq!(sub.signals().len(), signals.len());
  }
}

#[test]
fn conformance_factory_yields_isolated_pipelines() {
  let factory = EngineConformance::with_default_engine();
  let first = factory.identity_processor(16).unwrap();
  let second = factory.identity_processor(16).unwrap();

  let sub_a = TestSubscriber::new();
  let sub_b = TestSubscriber::new();
  first.subscribe(sub_a.clone());
  second.subscribe(sub_b.clone());

  let up_a = ManualUpstream::new();
  let up_b = ManualUpstream::new();
  up_a.subscribe(Arc::new(Arc::clone(&first)) as Arc<dyn Subscriber<i32>>);
  up_b.subscribe(Arc::new(Arc::clone(&second)) as Arc<dyn Subscriber<i32>>);

  sub_a.request(2);
  up_a.pump(&[factory.element(1), factory.element(2)]);
  sub_b.request(1);
  up_b.pump(&[factory.element(9)]);

  assert_eq!(sub_a.next_values(), vec![1, 2]);
  assert_eq!(sub_b.next_values(), vec![9]);
}

proptest! {
  /// The count of delivered elements never exceeds cumulative requested
  /// demand at any observation point, for arbitrary request schedules.
  #[test]
  fn delivered_never_exceeds_requested(
    len in 0usize..40,
    schedule in prop::collection::vec(1u64..7, 0..30)
  ) {
    let values: Vec<i32> = (0..len as i32).collect();
    let publisher = of(values.clone()).build_rs().unwrap();
    let sub = TestSubscriber::new();
    publisher.subscribe(sub.clone());

    let mut cumulative: u64 = 0;
    for n in schedule {
      sub.request(n);
      cumulative = cumulative.saturating_add(n);
      let delivered = sub.next_values().len() as u64;
      prop_assert!(
        delivered <= cumulative,
        "delivered {delivered} beyond cumulative demand {cumulative}"
      );
    }

    // With enough demand the whole input arrives in order, then completes.
    sub.request(len as u64 + 1);
    prop_assert_eq!(sub.next_values(), values);
    prop_assert_eq!(sub.terminal_signals(), 1);
    prop_assert!(matches!(sub.signals().last(), Some(Signal::Complete)));
  }

  /// Composition order is preserved for arbitrary inputs.
  #[test]
  fn filter_then_map_matches_iterator_semantics(
    values in prop::collection::vec(-100i32..100, 0..60)
  ) {
    let expected: Vec<i32> = values
      .iter()
      .filter(|n| **n % 3 == 0)
      .map(|n| n * 2)
      .collect();
    let handle = of(values)
      .filter(|n| Ok(n % 3 == 0))
      .map(|n| Ok(n * 2))
      .to_list()
      .run()
      .unwrap();
    prop_assert_eq!(handle.try_result().unwrap().unwrap(), expected);
  }
}

#[test]
fn demand_counter_saturates_instead_of_overflowing() {
  let publisher = of(vec![1_i32, 2]).build_rs().unwrap();
  let sub = TestSubscriber::new();
  publisher.subscribe(sub.clone());
  sub.request(u64::MAX);
  sub.request(u64::MAX);
  assert_eq!(sub.next_values(), vec![1, 2]);
  assert_eq!(sub.terminal_signals(), 1);
}

#[test]
fn demand_requested_upstream_never_exceeds_downstream_needs() {
  let upstream = ManualUpstream::new();
  let publisher = from_publisher(upstream.clone())
    .map(|n: i32| Ok(n + 1))
    .build_rs()
    .unwrap();
  let sub = TestSubscriber::new();
  publisher.subscribe(sub.clone());

  sub.request(2);
  let mut fed = 0;
  while upstream.requested() > 0 && fed < 100 {
    fed += 1;
    upstream.feed(fed);
  }
  assert_eq!(sub.next_values(), vec![2, 3]);
  assert!(
    upstream.total_granted() <= 2,
    "granted {} upstream for downstream demand 2",
    upstream.total_granted()
  );
}
