//! # Fluent Pipeline Builders
//!
//! The typed construction surface of the crate. Builders wrap a persistent
//! [`Graph`]: every operator call appends one stage to a copy, so builder
//! values can be shared, forked and reused freely until a materializer
//! consumes them. The three builder types mirror the three pipeline shapes:
//!
//! - [`PublisherBuilder`] — source-led chains (`from_iterable`, `of`,
//!   `empty`, `failed`, `from_publisher`); terminals turn them into a
//!   [`CompletionRunner`].
//! - [`ProcessorBuilder`] — unsourced chains started by [`builder`];
//!   terminals turn them into a [`SubscriberBuilder`].
//! - [`SubscriberBuilder`] — unsourced, terminal-ended chains; `build`
//!   yields the entry subscriber together with the completion handle.
//!
//! User functions are fallible: returning `Err` from a map body, predicate
//! or collector terminates the stream with a `UserFunction` error, exactly
//! once, and the function is never invoked again for that run.
//!
//! ```rust
//! use fluxweave::from_iterable;
//!
//! # fn main() -> Result<(), fluxweave::BuildError> {
//! let handle = from_iterable(|| 1..=10_i64)
//!   .filter(|n| Ok(n % 2 == 1))
//!   .map(|n| Ok(n * 2))
//!   .collect_with(|| 0_i64, |sum, n| Ok(sum + n))
//!   .run()?;
//! assert_eq!(handle.try_result().unwrap().unwrap(), 50);
//! # Ok(())
//! # }
//! ```

use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use crate::completion::{CompletionHandle, Convert};
use crate::engine::{Engine, default_engine};
use crate::error::{BuildError, StreamError, UserFnError};
use crate::executor::FirstResult;
use crate::graph::Graph;
use crate::spi::{AnyItem, Processor, Publisher, Subscriber, Subscription, any_item, take_item};
use crate::stage::{
  FanStage, IterSupplier, ProcessorEndpoint, SingleUse, SourceStage, Stage, TerminalStage,
  TransformStage,
};

// -------------------------------------------------------------------------
// Entry points
// -------------------------------------------------------------------------

/// Starts an identity processor chain: a pipeline with no source whose entry
/// is the stream fed into it.
pub fn builder<T: Send + Sync + 'static>() -> ProcessorBuilder<T, T> {
  ProcessorBuilder {
    graph: Graph::new(),
    _marker: PhantomData,
  }
}

/// Starts a pipeline from a supplier of iterables. The supplier runs once
/// per materialization, so an untainted graph built from it can be run any
/// number of times.
pub fn from_iterable<T, I, F>(supplier: F) -> PublisherBuilder<T>
where
  T: Send + Sync + 'static,
  I: IntoIterator<Item = T>,
  I::IntoIter: Send + 'static,
  F: Fn() -> I + Send + Sync + 'static,
{
  let supplier: IterSupplier = Arc::new(move || {
    Box::new(supplier().into_iter().map(any_item)) as Box<dyn Iterator<Item = AnyItem> + Send>
  });
  PublisherBuilder::from_graph(Graph::new().appended(Stage::Source(SourceStage::Iterable(supplier))))
}

/// Starts a pipeline over a fixed set of values.
pub fn of<T: Clone + Send + Sync + 'static>(values: impl Into<Vec<T>>) -> PublisherBuilder<T> {
  let values: Vec<T> = values.into();
  from_iterable(move || values.clone())
}

/// Starts a pipeline that completes immediately without emitting.
pub fn empty<T: Send + Sync + 'static>() -> PublisherBuilder<T> {
  PublisherBuilder::from_graph(Graph::new().appended(Stage::Source(SourceStage::Empty)))
}

/// Starts a pipeline that fails immediately with the given error.
pub fn failed<T: Send + Sync + 'static>(error: impl Into<UserFnError>) -> PublisherBuilder<T> {
  let error = StreamError::upstream(error.into().to_string());
  PublisherBuilder::from_graph(Graph::new().appended(Stage::Source(SourceStage::Failed(error))))
}

/// Starts a pipeline fed by an externally authored publisher.
pub fn from_publisher<T, P>(publisher: P) -> PublisherBuilder<T>
where
  T: Send + Sync + 'static,
  P: Publisher<T> + 'static,
{
  let typed: Arc<dyn Publisher<T>> = Arc::new(publisher);
  let erased: Arc<dyn Publisher<AnyItem>> = Arc::new(ErasedPublisher {
    inner: typed,
    _marker: PhantomData,
  });
  PublisherBuilder::from_graph(
    Graph::new().appended(Stage::Source(SourceStage::SuppliedPublisher(erased))),
  )
}

// -------------------------------------------------------------------------
// Collectors
// -------------------------------------------------------------------------

/// Mutable reduction of a stream into a single value: a fresh accumulator
/// per run, one `accumulate` call per element in arrival order, and a final
/// `finish` once the upstream completes.
pub trait Collector: Send + Sync + 'static {
  /// Element type consumed from the stream.
  type Item: Send + Sync + 'static;
  /// Intermediate accumulation type.
  type Accumulated: Send + Sync + 'static;
  /// Final result type.
  type Output: Send + Sync + 'static;

  /// Produces the initial accumulator. Invoked once per materialization.
  fn supply(&self) -> Self::Accumulated;

  /// Folds one element into the accumulator.
  ///
  /// # Errors
  ///
  /// An error terminates the run; the partial accumulation is discarded.
  fn accumulate(
    &self,
    acc: Self::Accumulated,
    item: Self::Item,
  ) -> Result<Self::Accumulated, UserFnError>;

  /// Converts the final accumulator into the result.
  ///
  /// # Errors
  ///
  /// An error fails the completion instead of resolving it.
  fn finish(&self, acc: Self::Accumulated) -> Result<Self::Output, UserFnError>;
}

struct ClosureCollector<A, T, FS, FA> {
  supply: FS,
  accumulate: FA,
  _marker: PhantomData<fn(T) -> A>,
}

impl<A, T, FS, FA> Collector for ClosureCollector<A, T, FS, FA>
where
  A: Send + Sync + 'static,
  T: Send + Sync + 'static,
  FS: Fn() -> A + Send + Sync + 'static,
  FA: Fn(A, T) -> Result<A, UserFnError> + Send + Sync + 'static,
{
  type Item = T;
  type Accumulated = A;
  type Output = A;

  fn supply(&self) -> A {
    (self.supply)()
  }

  fn accumulate(&self, acc: A, item: T) -> Result<A, UserFnError> {
    (self.accumulate)(acc, item)
  }

  fn finish(&self, acc: A) -> Result<A, UserFnError> {
    Ok(acc)
  }
}

struct ToListCollector<T> {
  _marker: PhantomData<fn(T)>,
}

impl<T: Send + Sync + 'static> Collector for ToListCollector<T> {
  type Item = T;
  type Accumulated = Vec<T>;
  type Output = Vec<T>;

  fn supply(&self) -> Vec<T> {
    Vec::new()
  }

  fn accumulate(&self, mut acc: Vec<T>, item: T) -> Result<Vec<T>, UserFnError> {
    acc.push(item);
    Ok(acc)
  }

  fn finish(&self, acc: Vec<T>) -> Result<Vec<T>, UserFnError> {
    Ok(acc)
  }
}

// -------------------------------------------------------------------------
// Stage construction helpers (type erasure happens here)
// -------------------------------------------------------------------------

fn user_error(stage: &str, error: StreamError) -> UserFnError {
  Box::new(StreamError::internal(stage, error.message().to_string()))
}

fn map_stage<I, O, F>(f: F) -> Stage
where
  I: Send + Sync + 'static,
  O: Send + Sync + 'static,
  F: Fn(I) -> Result<O, UserFnError> + Send + Sync + 'static,
{
  Stage::Transform(TransformStage::Map(Arc::new(move |item: AnyItem| {
    let value = take_item::<I>(item, "map").map_err(|e| user_error("map", e))?;
    f(value).map(any_item)
  })))
}

fn filter_stage<T, F>(predicate: F) -> Stage
where
  T: Send + Sync + 'static,
  F: Fn(&T) -> Result<bool, UserFnError> + Send + Sync + 'static,
{
  Stage::Transform(TransformStage::Filter(Arc::new(move |item: &AnyItem| {
    match item.downcast_ref::<T>() {
      Some(value) => predicate(value),
      None => Err("element type mismatch".into()),
    }
  })))
}

fn peek_stage<T, F>(f: F) -> Stage
where
  T: Send + Sync + 'static,
  F: Fn(&T) -> Result<(), UserFnError> + Send + Sync + 'static,
{
  Stage::Transform(TransformStage::Peek(Arc::new(move |item: &AnyItem| {
    match item.downcast_ref::<T>() {
      Some(value) => f(value),
      None => Err("element type mismatch".into()),
    }
  })))
}

fn flat_map_stage<I, R, F>(f: F) -> Stage
where
  I: Send + Sync + 'static,
  R: Send + Sync + 'static,
  F: Fn(I) -> Result<PublisherBuilder<R>, UserFnError> + Send + Sync + 'static,
{
  Stage::Transform(TransformStage::FlatMap(Arc::new(move |item: AnyItem| {
    let value = take_item::<I>(item, "flat_map").map_err(|e| user_error("flat_map", e))?;
    f(value).map(|builder| builder.graph)
  })))
}

fn flat_map_iterable_stage<I, R, It, F>(f: F) -> Stage
where
  I: Send + Sync + 'static,
  R: Send + Sync + 'static,
  It: IntoIterator<Item = R>,
  It::IntoIter: Send + 'static,
  F: Fn(I) -> Result<It, UserFnError> + Send + Sync + 'static,
{
  Stage::Transform(TransformStage::FlatMapIterable(Arc::new(
    move |item: AnyItem| {
      let value =
        take_item::<I>(item, "flat_map_iterable").map_err(|e| user_error("flat_map_iterable", e))?;
      f(value).map(|iterable| {
        Box::new(iterable.into_iter().map(any_item)) as Box<dyn Iterator<Item = AnyItem> + Send>
      })
    },
  )))
}

fn collect_stage<C: Collector>(collector: C) -> Stage {
  let collector = Arc::new(collector);
  let supply = {
    let collector = Arc::clone(&collector);
    Arc::new(move || any_item(collector.supply()))
  };
  let accumulate = {
    let collector = Arc::clone(&collector);
    Arc::new(move |acc: AnyItem, item: AnyItem| {
      let acc =
        take_item::<C::Accumulated>(acc, "collect").map_err(|e| user_error("collect", e))?;
      let item = take_item::<C::Item>(item, "collect").map_err(|e| user_error("collect", e))?;
      collector.accumulate(acc, item).map(any_item)
    })
  };
  let finish = Arc::new(move |acc: AnyItem| {
    let acc = take_item::<C::Accumulated>(acc, "collect").map_err(|e| user_error("collect", e))?;
    collector.finish(acc).map(any_item)
  });
  Stage::Terminal(TerminalStage::Collect {
    supply,
    accumulate,
    finish,
  })
}

fn to_stage<T, S>(subscriber: S) -> Stage
where
  T: Send + Sync + 'static,
  S: Subscriber<T> + 'static,
{
  let typed: Arc<dyn Subscriber<T>> = Arc::new(subscriber);
  let erased: Arc<dyn Subscriber<AnyItem>> = Arc::new(DowncastSubscriber::new(typed));
  Stage::Terminal(TerminalStage::ToSubscriber(SingleUse::new(erased)))
}

fn via_stage<I, O, P>(processor: P) -> Stage
where
  I: Send + Sync + 'static,
  O: Send + Sync + 'static,
  P: Processor<I, O> + 'static,
{
  let shared = Arc::new(processor);
  let subscriber_half: Arc<dyn Subscriber<I>> = shared.clone();
  let publisher_half: Arc<dyn Publisher<O>> = shared;
  let endpoint = ProcessorEndpoint {
    subscriber: Arc::new(DowncastSubscriber::new(subscriber_half)),
    publisher: Arc::new(ErasedPublisher {
      inner: publisher_half,
      _marker: PhantomData,
    }),
  };
  Stage::Fan(FanStage::Via(SingleUse::new(endpoint)))
}

// -------------------------------------------------------------------------
// Result converters
// -------------------------------------------------------------------------

fn value_converter<R: Clone + Send + Sync + 'static>(stage: &'static str) -> Convert<R> {
  Arc::new(move |item: AnyItem| {
    item
      .downcast_ref::<R>()
      .cloned()
      .ok_or_else(|| StreamError::internal(stage, "completion value type mismatch"))
  })
}

fn unit_converter() -> Convert<()> {
  Arc::new(|item: AnyItem| {
    item
      .downcast_ref::<()>()
      .copied()
      .ok_or_else(|| StreamError::internal("completion", "completion value type mismatch"))
  })
}

fn first_converter<T: Clone + Send + Sync + 'static>() -> Convert<Option<T>> {
  Arc::new(|item: AnyItem| {
    let first = item
      .downcast_ref::<FirstResult>()
      .ok_or_else(|| StreamError::internal("find_first", "completion value type mismatch"))?;
    match &first.0 {
      Some(inner) => inner
        .downcast_ref::<T>()
        .cloned()
        .map(Some)
        .ok_or_else(|| StreamError::internal("find_first", "element type mismatch")),
      None => Ok(None),
    }
  })
}

// -------------------------------------------------------------------------
// Typed adapters over the erased layer
// -------------------------------------------------------------------------

/// Subscriber adapter from the erased stream onto a typed subscriber.
struct DowncastSubscriber<T> {
  inner: Arc<dyn Subscriber<T>>,
  subscription: Mutex<Option<Arc<dyn Subscription>>>,
}

impl<T> DowncastSubscriber<T> {
  fn new(inner: Arc<dyn Subscriber<T>>) -> Self {
    Self {
      inner,
      subscription: Mutex::new(None),
    }
  }
}

impl<T: Send + Sync + 'static> DowncastSubscriber<T> {
  fn mismatch(&self) {
    let subscription = self
      .subscription
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .take();
    if let Some(subscription) = subscription {
      subscription.cancel();
    }
    self
      .inner
      .on_error(StreamError::internal("subscriber", "element type mismatch"));
  }
}

impl<T: Send + Sync + 'static> Subscriber<AnyItem> for DowncastSubscriber<T> {
  fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
    *self.subscription.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&subscription));
    self.inner.on_subscribe(subscription);
  }

  fn on_next(&self, element: AnyItem) {
    match element.downcast::<T>() {
      Ok(arc) => match Arc::try_unwrap(arc) {
        Ok(value) => self.inner.on_next(value),
        Err(_) => self.mismatch(),
      },
      Err(_) => self.mismatch(),
    }
  }

  fn on_error(&self, error: StreamError) {
    self.inner.on_error(error);
  }

  fn on_complete(&self) {
    self.inner.on_complete();
  }
}

/// Subscriber adapter from a typed stream onto the erased entry of a
/// pipeline.
struct ErasingSubscriber<T> {
  inner: Arc<dyn Subscriber<AnyItem>>,
  _marker: PhantomData<fn(T)>,
}

impl<T: Send + Sync + 'static> Subscriber<T> for ErasingSubscriber<T> {
  fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
    self.inner.on_subscribe(subscription);
  }

  fn on_next(&self, element: T) {
    self.inner.on_next(any_item(element));
  }

  fn on_error(&self, error: StreamError) {
    self.inner.on_error(error);
  }

  fn on_complete(&self) {
    self.inner.on_complete();
  }
}

/// Publisher facade exposing a typed stream over an erased pipeline.
struct TypedPublisher<T> {
  raw: Arc<dyn Publisher<AnyItem>>,
  _marker: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> Publisher<T> for TypedPublisher<T> {
  fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
    self
      .raw
      .subscribe(Arc::new(DowncastSubscriber::new(subscriber)));
  }
}

/// Publisher adapter presenting a typed external publisher as an erased one.
struct ErasedPublisher<T> {
  inner: Arc<dyn Publisher<T>>,
  _marker: PhantomData<fn(T)>,
}

impl<T: Send + Sync + 'static> Publisher<AnyItem> for ErasedPublisher<T> {
  fn subscribe(&self, subscriber: Arc<dyn Subscriber<AnyItem>>) {
    self.inner.subscribe(Arc::new(ErasingSubscriber {
      inner: subscriber,
      _marker: PhantomData,
    }));
  }
}

/// Processor facade exposing typed ends over an erased pipeline.
struct TypedProcessor<I, O> {
  raw: Arc<dyn Processor<AnyItem, AnyItem>>,
  _marker: PhantomData<fn(I) -> O>,
}

impl<I: Send + Sync + 'static, O: Send + Sync + 'static> Subscriber<I> for TypedProcessor<I, O> {
  fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
    self.raw.on_subscribe(subscription);
  }

  fn on_next(&self, element: I) {
    self.raw.on_next(any_item(element));
  }

  fn on_error(&self, error: StreamError) {
    self.raw.on_error(error);
  }

  fn on_complete(&self) {
    self.raw.on_complete();
  }
}

impl<I: Send + Sync + 'static, O: Send + Sync + 'static> Publisher<O> for TypedProcessor<I, O> {
  fn subscribe(&self, subscriber: Arc<dyn Subscriber<O>>) {
    self
      .raw
      .subscribe(Arc::new(DowncastSubscriber::new(subscriber)));
  }
}

impl<I: Send + Sync + 'static, O: Send + Sync + 'static> Processor<I, O> for TypedProcessor<I, O> {}

// -------------------------------------------------------------------------
// PublisherBuilder
// -------------------------------------------------------------------------

/// Fluent builder over a source-led pipeline emitting elements of type `O`.
pub struct PublisherBuilder<O> {
  graph: Graph,
  _marker: PhantomData<fn() -> O>,
}

impl<O> Clone for PublisherBuilder<O> {
  fn clone(&self) -> Self {
    Self {
      graph: self.graph.clone(),
      _marker: PhantomData,
    }
  }
}

impl<O: Send + Sync + 'static> PublisherBuilder<O> {
  fn from_graph(graph: Graph) -> Self {
    Self {
      graph,
      _marker: PhantomData,
    }
  }

  fn appended<R>(self, stage: Stage) -> PublisherBuilder<R> {
    PublisherBuilder {
      graph: self.graph.appended(stage),
      _marker: PhantomData,
    }
  }

  /// The underlying stage graph.
  pub fn graph(&self) -> &Graph {
    &self.graph
  }

  /// Applies `f` to every element.
  pub fn map<R, F>(self, f: F) -> PublisherBuilder<R>
  where
    R: Send + Sync + 'static,
    F: Fn(O) -> Result<R, UserFnError> + Send + Sync + 'static,
  {
    self.appended(map_stage(f))
  }

  /// Keeps the elements matching `predicate`.
  pub fn filter<F>(self, predicate: F) -> PublisherBuilder<O>
  where
    F: Fn(&O) -> Result<bool, UserFnError> + Send + Sync + 'static,
  {
    self.appended(filter_stage(predicate))
  }

  /// Expands every element into the stream described by the returned
  /// builder. Inner streams are drained fully and in order, one at a time.
  pub fn flat_map<R, F>(self, f: F) -> PublisherBuilder<R>
  where
    R: Send + Sync + 'static,
    F: Fn(O) -> Result<PublisherBuilder<R>, UserFnError> + Send + Sync + 'static,
  {
    self.appended(flat_map_stage(f))
  }

  /// Expands every element into an iterable, drained sequentially.
  pub fn flat_map_iterable<R, It, F>(self, f: F) -> PublisherBuilder<R>
  where
    R: Send + Sync + 'static,
    It: IntoIterator<Item = R>,
    It::IntoIter: Send + 'static,
    F: Fn(O) -> Result<It, UserFnError> + Send + Sync + 'static,
  {
    self.appended(flat_map_iterable_stage(f))
  }

  /// Observes every element without changing it.
  pub fn peek<F>(self, f: F) -> PublisherBuilder<O>
  where
    F: Fn(&O) -> Result<(), UserFnError> + Send + Sync + 'static,
  {
    self.appended(peek_stage(f))
  }

  /// Observes a terminal error passing this position.
  pub fn on_error<F>(self, handler: F) -> PublisherBuilder<O>
  where
    F: Fn(&StreamError) + Send + Sync + 'static,
  {
    self.appended(Stage::Transform(TransformStage::OnError(Arc::new(handler))))
  }

  /// Observes completion, failure or cancellation passing this position.
  pub fn on_terminate<F>(self, handler: F) -> PublisherBuilder<O>
  where
    F: Fn() + Send + Sync + 'static,
  {
    self.appended(Stage::Transform(TransformStage::OnTerminate(Arc::new(
      handler,
    ))))
  }

  /// Passes at most `n` elements, then completes and releases upstream.
  pub fn take(self, n: u64) -> PublisherBuilder<O> {
    self.appended(Stage::Transform(TransformStage::Take(n)))
  }

  /// Drops the first `n` elements.
  pub fn skip(self, n: u64) -> PublisherBuilder<O> {
    self.appended(Stage::Transform(TransformStage::Skip(n)))
  }

  /// Routes the stream through an externally supplied processor. Embedding
  /// the processor taints the graph: it can be materialized once.
  pub fn via<R, P>(self, processor: P) -> PublisherBuilder<R>
  where
    R: Send + Sync + 'static,
    P: Processor<O, R> + 'static,
  {
    self.appended(via_stage(processor))
  }

  /// Terminates into an externally supplied subscriber. Taints the graph.
  /// The completion resolves when the stream reaches a terminal signal.
  pub fn to<S>(self, subscriber: S) -> CompletionRunner<()>
  where
    S: Subscriber<O> + 'static,
  {
    CompletionRunner {
      graph: self.graph.appended(to_stage(subscriber)),
      convert: unit_converter(),
    }
  }

  /// Collects every element with `collector`.
  pub fn collect<C>(self, collector: C) -> CompletionRunner<C::Output>
  where
    C: Collector<Item = O>,
    C::Output: Clone,
  {
    CompletionRunner {
      graph: self.graph.appended(collect_stage(collector)),
      convert: value_converter::<C::Output>("collect"),
    }
  }

  /// Folds every element with a supplier and accumulator closure pair.
  pub fn collect_with<A, FS, FA>(self, supply: FS, accumulate: FA) -> CompletionRunner<A>
  where
    A: Clone + Send + Sync + 'static,
    FS: Fn() -> A + Send + Sync + 'static,
    FA: Fn(A, O) -> Result<A, UserFnError> + Send + Sync + 'static,
  {
    self.collect(ClosureCollector {
      supply,
      accumulate,
      _marker: PhantomData,
    })
  }

  /// Gathers every element into a `Vec`, in arrival order.
  pub fn to_list(self) -> CompletionRunner<Vec<O>>
  where
    O: Clone,
  {
    self.collect(ToListCollector {
      _marker: PhantomData,
    })
  }

  /// Resolves with the first element (or `None` on an empty stream) and
  /// cancels the rest.
  pub fn find_first(self) -> CompletionRunner<Option<O>>
  where
    O: Clone,
  {
    CompletionRunner {
      graph: self.graph.appended(Stage::Terminal(TerminalStage::FindFirst)),
      convert: first_converter::<O>(),
    }
  }

  /// Discards every element, resolving when the stream terminates.
  pub fn ignore(self) -> CompletionRunner<()> {
    CompletionRunner {
      graph: self.graph.appended(Stage::Terminal(TerminalStage::Ignore)),
      convert: unit_converter(),
    }
  }

  /// Cancels the stream as soon as it is wired up.
  pub fn cancel(self) -> CompletionRunner<()> {
    CompletionRunner {
      graph: self.graph.appended(Stage::Terminal(TerminalStage::Cancel)),
      convert: unit_converter(),
    }
  }

  /// Materializes the chain into a cold publisher with the default engine.
  ///
  /// # Errors
  ///
  /// See [`Engine::build_publisher`].
  pub fn build_rs(self) -> Result<Arc<dyn Publisher<O>>, BuildError> {
    let engine = default_engine();
    self.build_rs_with(engine.as_ref())
  }

  /// Materializes the chain into a cold publisher with the given engine.
  ///
  /// # Errors
  ///
  /// See [`Engine::build_publisher`].
  pub fn build_rs_with(self, engine: &dyn Engine) -> Result<Arc<dyn Publisher<O>>, BuildError> {
    let raw = engine.build_publisher(self.graph)?;
    Ok(Arc::new(TypedPublisher {
      raw,
      _marker: PhantomData,
    }))
  }
}

// -------------------------------------------------------------------------
// ProcessorBuilder
// -------------------------------------------------------------------------

/// Fluent builder over an unsourced chain consuming `I` and emitting `O`.
pub struct ProcessorBuilder<I, O> {
  graph: Graph,
  _marker: PhantomData<fn(I) -> O>,
}

impl<I, O> Clone for ProcessorBuilder<I, O> {
  fn clone(&self) -> Self {
    Self {
      graph: self.graph.clone(),
      _marker: PhantomData,
    }
  }
}

impl<I: Send + Sync + 'static, O: Send + Sync + 'static> ProcessorBuilder<I, O> {
  fn appended<R>(self, stage: Stage) -> ProcessorBuilder<I, R> {
    ProcessorBuilder {
      graph: self.graph.appended(stage),
      _marker: PhantomData,
    }
  }

  /// The underlying stage graph.
  pub fn graph(&self) -> &Graph {
    &self.graph
  }

  /// Applies `f` to every element.
  pub fn map<R, F>(self, f: F) -> ProcessorBuilder<I, R>
  where
    R: Send + Sync + 'static,
    F: Fn(O) -> Result<R, UserFnError> + Send + Sync + 'static,
  {
    self.appended(map_stage(f))
  }

  /// Keeps the elements matching `predicate`.
  pub fn filter<F>(self, predicate: F) -> ProcessorBuilder<I, O>
  where
    F: Fn(&O) -> Result<bool, UserFnError> + Send + Sync + 'static,
  {
    self.appended(filter_stage(predicate))
  }

  /// Expands every element into the stream described by the returned
  /// builder, drained sequentially and in order.
  pub fn flat_map<R, F>(self, f: F) -> ProcessorBuilder<I, R>
  where
    R: Send + Sync + 'static,
    F: Fn(O) -> Result<PublisherBuilder<R>, UserFnError> + Send + Sync + 'static,
  {
    self.appended(flat_map_stage(f))
  }

  /// Expands every element into an iterable, drained sequentially.
  pub fn flat_map_iterable<R, It, F>(self, f: F) -> ProcessorBuilder<I, R>
  where
    R: Send + Sync + 'static,
    It: IntoIterator<Item = R>,
    It::IntoIter: Send + 'static,
    F: Fn(O) -> Result<It, UserFnError> + Send + Sync + 'static,
  {
    self.appended(flat_map_iterable_stage(f))
  }

  /// Observes every element without changing it.
  pub fn peek<F>(self, f: F) -> ProcessorBuilder<I, O>
  where
    F: Fn(&O) -> Result<(), UserFnError> + Send + Sync + 'static,
  {
    self.appended(peek_stage(f))
  }

  /// Observes a terminal error passing this position.
  pub fn on_error<F>(self, handler: F) -> ProcessorBuilder<I, O>
  where
    F: Fn(&StreamError) + Send + Sync + 'static,
  {
    self.appended(Stage::Transform(TransformStage::OnError(Arc::new(handler))))
  }

  /// Observes completion, failure or cancellation passing this position.
  pub fn on_terminate<F>(self, handler: F) -> ProcessorBuilder<I, O>
  where
    F: Fn() + Send + Sync + 'static,
  {
    self.appended(Stage::Transform(TransformStage::OnTerminate(Arc::new(
      handler,
    ))))
  }

  /// Passes at most `n` elements, then completes and releases upstream.
  pub fn take(self, n: u64) -> ProcessorBuilder<I, O> {
    self.appended(Stage::Transform(TransformStage::Take(n)))
  }

  /// Drops the first `n` elements.
  pub fn skip(self, n: u64) -> ProcessorBuilder<I, O> {
    self.appended(Stage::Transform(TransformStage::Skip(n)))
  }

  /// Routes the stream through an externally supplied processor. Taints the
  /// graph.
  pub fn via<R, P>(self, processor: P) -> ProcessorBuilder<I, R>
  where
    R: Send + Sync + 'static,
    P: Processor<O, R> + 'static,
  {
    self.appended(via_stage(processor))
  }

  /// Terminates into an externally supplied subscriber. Taints the graph.
  pub fn to<S>(self, subscriber: S) -> SubscriberBuilder<I, ()>
  where
    S: Subscriber<O> + 'static,
  {
    SubscriberBuilder {
      graph: self.graph.appended(to_stage(subscriber)),
      convert: unit_converter(),
      _marker: PhantomData,
    }
  }

  /// Collects every element with `collector`.
  pub fn collect<C>(self, collector: C) -> SubscriberBuilder<I, C::Output>
  where
    C: Collector<Item = O>,
    C::Output: Clone,
  {
    SubscriberBuilder {
      graph: self.graph.appended(collect_stage(collector)),
      convert: value_converter::<C::Output>("collect"),
      _marker: PhantomData,
    }
  }

  /// Folds every element with a supplier and accumulator closure pair.
  pub fn collect_with<A, FS, FA>(self, supply: FS, accumulate: FA) -> SubscriberBuilder<I, A>
  where
    A: Clone + Send + Sync + 'static,
    FS: Fn() -> A + Send + Sync + 'static,
    FA: Fn(A, O) -> Result<A, UserFnError> + Send + Sync + 'static,
  {
    self.collect(ClosureCollector {
      supply,
      accumulate,
      _marker: PhantomData,
    })
  }

  /// Gathers every element into a `Vec`, in arrival order.
  pub fn to_list(self) -> SubscriberBuilder<I, Vec<O>>
  where
    O: Clone,
  {
    self.collect(ToListCollector {
      _marker: PhantomData,
    })
  }

  /// Resolves with the first element (or `None`) and cancels the rest.
  pub fn find_first(self) -> SubscriberBuilder<I, Option<O>>
  where
    O: Clone,
  {
    SubscriberBuilder {
      graph: self.graph.appended(Stage::Terminal(TerminalStage::FindFirst)),
      convert: first_converter::<O>(),
      _marker: PhantomData,
    }
  }

  /// Discards every element, resolving when the stream terminates.
  pub fn ignore(self) -> SubscriberBuilder<I, ()> {
    SubscriberBuilder {
      graph: self.graph.appended(Stage::Terminal(TerminalStage::Ignore)),
      convert: unit_converter(),
      _marker: PhantomData,
    }
  }

  /// Cancels the upstream as soon as it subscribes.
  pub fn cancel(self) -> SubscriberBuilder<I, ()> {
    SubscriberBuilder {
      graph: self.graph.appended(Stage::Terminal(TerminalStage::Cancel)),
      convert: unit_converter(),
      _marker: PhantomData,
    }
  }

  /// Materializes the chain into a processor with the default engine.
  ///
  /// # Errors
  ///
  /// See [`Engine::build_processor`].
  pub fn build_rs(self) -> Result<Arc<dyn Processor<I, O>>, BuildError> {
    let engine = default_engine();
    self.build_rs_with(engine.as_ref())
  }

  /// Materializes the chain into a processor with the given engine.
  ///
  /// # Errors
  ///
  /// See [`Engine::build_processor`].
  pub fn build_rs_with(self, engine: &dyn Engine) -> Result<Arc<dyn Processor<I, O>>, BuildError> {
    let raw = engine.build_processor(self.graph)?;
    Ok(Arc::new(TypedProcessor {
      raw,
      _marker: PhantomData,
    }))
  }
}

// -------------------------------------------------------------------------
// SubscriberBuilder and CompletionRunner
// -------------------------------------------------------------------------

/// A finished unsourced chain: materializes into the subscriber that feeds
/// it plus the completion its terminal resolves.
pub struct SubscriberBuilder<I, R> {
  graph: Graph,
  convert: Convert<R>,
  _marker: PhantomData<fn(I)>,
}

impl<I, R> Clone for SubscriberBuilder<I, R> {
  fn clone(&self) -> Self {
    Self {
      graph: self.graph.clone(),
      convert: Arc::clone(&self.convert),
      _marker: PhantomData,
    }
  }
}

impl<I: Send + Sync + 'static, R: Send + 'static> SubscriberBuilder<I, R> {
  /// The underlying stage graph.
  pub fn graph(&self) -> &Graph {
    &self.graph
  }

  /// Materializes with the default engine.
  ///
  /// # Errors
  ///
  /// See [`Engine::build_subscriber`].
  pub fn build(self) -> Result<(Arc<dyn Subscriber<I>>, CompletionHandle<R>), BuildError> {
    let engine = default_engine();
    self.build_with(engine.as_ref())
  }

  /// Materializes with the given engine.
  ///
  /// # Errors
  ///
  /// See [`Engine::build_subscriber`].
  pub fn build_with(
    self,
    engine: &dyn Engine,
  ) -> Result<(Arc<dyn Subscriber<I>>, CompletionHandle<R>), BuildError> {
    let (raw, completion) = engine.build_subscriber(self.graph)?;
    let subscriber: Arc<dyn Subscriber<I>> = Arc::new(ErasingSubscriber {
      inner: raw,
      _marker: PhantomData,
    });
    Ok((subscriber, CompletionHandle::new(completion, self.convert)))
  }
}

/// A finished source-to-terminal chain, ready to run.
pub struct CompletionRunner<R> {
  graph: Graph,
  convert: Convert<R>,
}

impl<R> Clone for CompletionRunner<R> {
  fn clone(&self) -> Self {
    Self {
      graph: self.graph.clone(),
      convert: Arc::clone(&self.convert),
    }
  }
}

impl<R: Send + 'static> CompletionRunner<R> {
  /// The underlying stage graph.
  pub fn graph(&self) -> &Graph {
    &self.graph
  }

  /// Starts the run with the default engine.
  ///
  /// # Errors
  ///
  /// See [`Engine::run`].
  pub fn run(self) -> Result<CompletionHandle<R>, BuildError> {
    let engine = default_engine();
    self.run_with(engine.as_ref())
  }

  /// Starts the run with the given engine.
  ///
  /// # Errors
  ///
  /// See [`Engine::run`].
  pub fn run_with(self, engine: &dyn Engine) -> Result<CompletionHandle<R>, BuildError> {
    let raw = engine.run(self.graph)?;
    Ok(CompletionHandle::new(raw, self.convert))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn builders_are_persistent_values() {
    let base = of(vec![1_i32, 2, 3]).map(|n| Ok(n + 1));
    let doubled = base.clone().map(|n| Ok(n * 2));
    assert_eq!(base.graph().stages().len(), 2);
    assert_eq!(doubled.graph().stages().len(), 3);
  }

  #[test]
  fn processor_graph_has_no_source() {
    let chain = builder::<i32>().map(|n| Ok(n * 2)).filter(|n| Ok(*n > 0));
    assert!(!chain.graph().has_source());
    assert!(!chain.graph().has_terminal());
  }

  #[test]
  fn terminal_appends_close_the_graph() {
    let runner = of(vec![1_i32]).ignore();
    assert!(runner.graph().has_source());
    assert!(runner.graph().has_terminal());
  }

  #[test]
  fn engine_rejects_mismatched_shapes() {
    use crate::engines::InProcessEngine;

    let engine = InProcessEngine::new();
    let runner = of(vec![1_i32]).ignore();
    let err = engine.build_publisher(runner.graph().clone()).unwrap_err();
    assert!(matches!(err, BuildError::GraphStructure(_)));

    let chain = builder::<i32>().map(|n| Ok(n * 2));
    let err = engine.build_publisher(chain.graph().clone()).unwrap_err();
    assert_eq!(err, BuildError::EmptyGraph);
  }
}
