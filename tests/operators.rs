use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use fluxweave::{
  BuildError, StreamError, StreamErrorKind, Subscriber, Subscription, TokioEngine, builder, empty,
  failed, from_iterable, of,
};

/// Subscriber that requests everything up front and records what it sees.
struct CollectingSubscriber {
  seen: Mutex<Vec<i32>>,
  completed: AtomicUsize,
  errored: Mutex<Vec<StreamError>>,
}

impl CollectingSubscriber {
  fn new() -> Arc<Self> {
    Arc::new(Self {
      seen: Mutex::new(Vec::new()),
      completed: AtomicUsize::new(0),
      errored: Mutex::new(Vec::new()),
    })
  }

  fn seen(&self) -> Vec<i32> {
    self.seen.lock().unwrap().clone()
  }
}

impl Subscriber<i32> for CollectingSubscriber {
  fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
    subscription.request(u64::MAX);
  }

  fn on_next(&self, element: i32) {
    self.seen.lock().unwrap().push(element);
  }

  fn on_error(&self, error: StreamError) {
    self.errored.lock().unwrap().push(error);
  }

  fn on_complete(&self) {
    self.completed.fetch_add(1, Ordering::SeqCst);
  }
}

#[test]
fn filter_map_collect_sums_odd_doubles() {
  let handle = from_iterable(|| 1..=999_i64)
    .filter(|n| Ok(n % 2 == 1))
    .map(|n| Ok(n * 2))
    .collect_with(|| 0_i64, |sum, n| Ok(sum + n))
    .run()
    .unwrap();
  let expected: i64 = (1..=999).filter(|n| n % 2 == 1).map(|n| n * 2).sum();
  assert_eq!(handle.try_result().unwrap().unwrap(), expected);
}

#[test]
fn to_list_preserves_arrival_order() {
  let handle = of(vec![3_i32, 1, 4, 1, 5, 9, 2, 6])
    .to_list()
    .run()
    .unwrap();
  assert_eq!(
    handle.try_result().unwrap().unwrap(),
    vec![3, 1, 4, 1, 5, 9, 2, 6]
  );
}

#[test]
fn empty_source_collects_identity_without_touching_accumulator() {
  let calls = Arc::new(AtomicUsize::new(0));
  let calls_in_fold = Arc::clone(&calls);
  let handle = from_iterable(Vec::<i32>::new)
    .collect_with(
      || 0_i32,
      move |sum, n| {
        calls_in_fold.fetch_add(1, Ordering::SeqCst);
        Ok(sum + n)
      },
    )
    .run()
    .unwrap();
  assert_eq!(handle.try_result().unwrap().unwrap(), 0);
  assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn empty_builder_completes_immediately() {
  let handle = empty::<i32>().to_list().run().unwrap();
  assert_eq!(handle.try_result().unwrap().unwrap(), Vec::<i32>::new());
}

#[test]
fn failed_source_surfaces_through_the_handle() {
  let handle = failed::<i32>("backing store gone").ignore().run().unwrap();
  let error = handle.try_result().unwrap().unwrap_err();
  assert_eq!(error.kind(), StreamErrorKind::Upstream);
  assert!(error.message().contains("backing store gone"));
}

#[test]
fn take_truncates_and_completes() {
  let handle = from_iterable(|| 1..=1_000_000_i64).take(3).to_list().run().unwrap();
  assert_eq!(handle.try_result().unwrap().unwrap(), vec![1, 2, 3]);
}

#[test]
fn skip_drops_the_prefix() {
  let handle = of((1..=10_i32).collect::<Vec<_>>())
    .skip(7)
    .to_list()
    .run()
    .unwrap();
  assert_eq!(handle.try_result().unwrap().unwrap(), vec![8, 9, 10]);
}

#[test]
fn flat_map_drains_inner_streams_in_order() {
  let handle = of(vec![1_i32, 2, 3])
    .flat_map(|n| Ok(of(vec![n * 10, n * 10 + 1])))
    .to_list()
    .run()
    .unwrap();
  assert_eq!(
    handle.try_result().unwrap().unwrap(),
    vec![10, 11, 20, 21, 30, 31]
  );
}

#[test]
fn flat_map_iterable_expands_sequentially() {
  let handle = of(vec![1_u32, 2, 3])
    .flat_map_iterable(|n| Ok(0..n))
    .to_list()
    .run()
    .unwrap();
  assert_eq!(handle.try_result().unwrap().unwrap(), vec![0, 0, 1, 0, 1, 2]);
}

#[test]
fn flat_map_with_empty_inner_streams_skips_them() {
  let handle = of(vec![0_u32, 2, 0, 1])
    .flat_map_iterable(|n| Ok(0..n))
    .to_list()
    .run()
    .unwrap();
  assert_eq!(handle.try_result().unwrap().unwrap(), vec![0, 1, 0]);
}

#[test]
fn peek_observes_every_element_in_order() {
  let observed = Arc::new(Mutex::new(Vec::new()));
  let observed_in_peek = Arc::clone(&observed);
  let handle = of(vec![1_i32, 2, 3])
    .peek(move |n| {
      observed_in_peek.lock().unwrap().push(*n);
      Ok(())
    })
    .map(|n| Ok(n * 2))
    .to_list()
    .run()
    .unwrap();
  assert_eq!(handle.try_result().unwrap().unwrap(), vec![2, 4, 6]);
  assert_eq!(observed.lock().unwrap().clone(), vec![1, 2, 3]);
}

#[test]
fn find_first_resolves_and_releases_upstream() {
  let handle = from_iterable(|| 10..=1_000_000_i64)
    .find_first()
    .run()
    .unwrap();
  assert_eq!(handle.try_result().unwrap().unwrap(), Some(10));

  let handle = empty::<i64>().find_first().run().unwrap();
  assert_eq!(handle.try_result().unwrap().unwrap(), None);
}

#[test]
fn ignore_discards_elements_and_completes() {
  let handle = of(vec![1_i32, 2, 3]).ignore().run().unwrap();
  assert!(handle.try_result().unwrap().is_ok());
}

#[test]
fn cancel_terminal_resolves_and_fires_terminate_hooks() {
  let terminated = Arc::new(AtomicUsize::new(0));
  let terminated_in_hook = Arc::clone(&terminated);
  let handle = of(vec![1_i32, 2, 3])
    .on_terminate(move || {
      terminated_in_hook.fetch_add(1, Ordering::SeqCst);
    })
    .cancel()
    .run()
    .unwrap();
  assert!(handle.try_result().unwrap().is_ok());
  assert_eq!(terminated.load(Ordering::SeqCst), 1);
}

#[test]
fn via_routes_through_an_external_processor() {
  let doubler = builder::<i32>().map(|n| Ok(n * 2)).build_rs().unwrap();
  let handle = of(vec![1_i32, 2, 3]).via(doubler).to_list().run().unwrap();
  assert_eq!(handle.try_result().unwrap().unwrap(), vec![2, 4, 6]);
}

#[test]
fn via_taints_the_graph_for_reuse() {
  let doubler = builder::<i32>().map(|n| Ok(n * 2)).build_rs().unwrap();
  let runner = of(vec![1_i32, 2, 3]).via(doubler).to_list();
  let again = runner.clone();
  assert!(runner.run().is_ok());
  assert_eq!(again.run().unwrap_err(), BuildError::TaintedReuse);
}

#[test]
fn on_error_hooks_observe_only_upstream_failures() {
  let before = Arc::new(AtomicUsize::new(0));
  let after = Arc::new(AtomicUsize::new(0));
  let before_in_hook = Arc::clone(&before);
  let after_in_hook = Arc::clone(&after);
  let handle = of(vec![1_i32, 2, 3])
    .on_error(move |_| {
      before_in_hook.fetch_add(1, Ordering::SeqCst);
    })
    .map(|n| {
      if n == 2 {
        Err("two is right out".into())
      } else {
        Ok(n)
      }
    })
    .on_error(move |_| {
      after_in_hook.fetch_add(1, Ordering::SeqCst);
    })
    .to_list()
    .run()
    .unwrap();
  assert!(handle.try_result().unwrap().is_err());
  assert_eq!(before.load(Ordering::SeqCst), 0);
  assert_eq!(after.load(Ordering::SeqCst), 1);
}

#[test]
fn on_terminate_fires_exactly_once_on_completion() {
  let fired = Arc::new(AtomicUsize::new(0));
  let fired_in_hook = Arc::clone(&fired);
  let handle = of(vec![1_i32])
    .on_terminate(move || {
      fired_in_hook.fetch_add(1, Ordering::SeqCst);
    })
    .ignore()
    .run()
    .unwrap();
  assert!(handle.try_result().unwrap().is_ok());
  assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn failing_user_function_is_never_invoked_again() {
  let calls = Arc::new(AtomicUsize::new(0));
  let calls_in_map = Arc::clone(&calls);
  let handle = from_iterable(|| 1..=10_i32)
    .map(move |n| {
      calls_in_map.fetch_add(1, Ordering::SeqCst);
      if n == 3 {
        Err("third time is not the charm".into())
      } else {
        Ok(n)
      }
    })
    .to_list()
    .run()
    .unwrap();
  let error = handle.try_result().unwrap().unwrap_err();
  assert_eq!(error.kind(), StreamErrorKind::UserFunction);
  assert_eq!(error.stage(), "map");
  assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[test]
fn collect_discards_partial_accumulation_on_upstream_error() {
  let handle = from_iterable(|| 1..=10_i32)
    .map(|n| if n == 5 { Err("halfway failure".into()) } else { Ok(n) })
    .collect_with(|| 0_i32, |sum, n| Ok(sum + n))
    .run()
    .unwrap();
  let error = handle.try_result().unwrap().unwrap_err();
  assert_eq!(error.kind(), StreamErrorKind::UserFunction);
}

#[test]
fn untainted_graphs_materialize_repeatedly_with_identical_output() {
  let runner = of(vec![5_i32, 6, 7]).map(|n| Ok(n * n)).to_list();
  let first = runner.clone().run().unwrap().try_result().unwrap().unwrap();
  let second = runner.run().unwrap().try_result().unwrap().unwrap();
  assert_eq!(first, second);
  assert_eq!(first, vec![25, 36, 49]);
}

#[test]
fn embedded_subscriber_taints_the_graph() {
  let first_run_sub = CollectingSubscriber::new();
  let runner = of(vec![1_i32, 2]).to(first_run_sub.clone());
  let again = runner.clone();
  let handle = runner.run().unwrap();
  assert!(handle.try_result().unwrap().is_ok());
  assert_eq!(first_run_sub.seen(), vec![1, 2]);
  assert_eq!(again.run().unwrap_err(), BuildError::TaintedReuse);
}

#[test]
fn to_subscriber_delivers_terminal_signals() {
  let sub = CollectingSubscriber::new();
  let handle = of(vec![7_i32, 8]).to(sub.clone()).run().unwrap();
  assert!(handle.try_result().unwrap().is_ok());
  assert_eq!(sub.seen(), vec![7, 8]);
  assert_eq!(sub.completed.load(Ordering::SeqCst), 1);
  assert!(sub.errored.lock().unwrap().is_empty());
}

#[test]
fn subscriber_shape_bridges_a_publisher_to_a_completion() {
  let (entry, completion) = builder::<i32>()
    .map(|n| Ok(n + 1))
    .to_list()
    .build()
    .unwrap();
  let publisher = of(vec![1_i32, 2, 3]).build_rs().unwrap();
  publisher.subscribe(entry);
  assert_eq!(completion.try_result().unwrap().unwrap(), vec![2, 3, 4]);
}

#[test]
fn publisher_feeds_an_external_subscriber() {
  let publisher = of(vec![1_i32, 2, 3]).map(|n| Ok(n * 10)).build_rs().unwrap();
  let sub = CollectingSubscriber::new();
  publisher.subscribe(sub.clone());
  assert_eq!(sub.seen(), vec![10, 20, 30]);
  assert_eq!(sub.completed.load(Ordering::SeqCst), 1);
}

#[test]
fn completion_handle_callbacks_fire_on_resolution() {
  let observed = Arc::new(AtomicU64::new(0));
  let observed_in_cb = Arc::clone(&observed);
  let handle = from_iterable(|| 1..=4_u64)
    .collect_with(|| 0_u64, |sum, n| Ok(sum + n))
    .run()
    .unwrap();
  handle.on_resolved(move |result| {
    observed_in_cb.store(result.unwrap(), Ordering::SeqCst);
  });
  assert_eq!(observed.load(Ordering::SeqCst), 10);
}

#[tokio::test]
async fn tokio_engine_runs_off_the_caller_thread() {
  let engine = TokioEngine::new();
  let handle = from_iterable(|| 1..=100_i64)
    .map(|n| Ok(n * 3))
    .collect_with(|| 0_i64, |sum, n| Ok(sum + n))
    .run_with(&engine)
    .unwrap();
  let total = handle.await.unwrap();
  assert_eq!(total, 3 * (100 * 101) / 2);
}

#[tokio::test]
async fn completion_handles_are_awaitable_from_sync_runs() {
  let handle = of(vec![2_i32, 3, 4])
    .collect_with(|| 1_i32, |product, n| Ok(product * n))
    .run()
    .unwrap();
  assert_eq!(handle.await.unwrap(), 24);
}
