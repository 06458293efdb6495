//! # Error Handling
//!
//! Errors in fluxweave travel on one of two channels and never cross between
//! them:
//!
//! - **Structural errors** ([`BuildError`]) are detected while a graph is
//!   being materialized and are returned synchronously from the materializer
//!   call that discovered them.
//! - **Runtime errors** ([`StreamError`]) occur on the data path of a running
//!   pipeline and are always delivered as the pipeline's single terminal
//!   error signal (`on_error` or a failed completion handle). They are never
//!   thrown across a signal boundary.
//!
//! [`StreamError`] is cheaply cloneable so the same terminal failure can be
//!   observed through a subscriber and through a completion handle.

use std::error::Error;
use std::fmt;

use thiserror::Error as ThisError;

/// Error type returned by user-supplied functions (map bodies, predicates,
/// collectors). The Rust rendition of a thrown exception.
pub type UserFnError = Box<dyn Error + Send + Sync>;

/// Structural error raised while translating a graph into running primitives.
///
/// These are programming errors in how a pipeline was assembled or reused,
/// reported synchronously by the materializer. Data-path failures use
/// [`StreamError`] instead.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum BuildError {
  /// The graph lacks a source stage in a position that requires one.
  #[error("graph has no source stage where one is required")]
  EmptyGraph,
  /// The stage sequence violates a shape rule (for example a terminal stage
  /// in a graph materialized as a publisher).
  #[error("invalid graph structure: {0}")]
  GraphStructure(String),
  /// The engine does not recognize a stage variant.
  #[error("engine cannot translate stage '{0}'")]
  UnsupportedStage(&'static str),
  /// A second materialization tried to claim a single-use endpoint that an
  /// earlier materialization already consumed.
  #[error("graph embeds a single-use endpoint already claimed by an earlier materialization")]
  TaintedReuse,
  /// `set_default_engine` was called after a default engine was installed.
  #[error("a process-wide default engine is already installed")]
  EngineAlreadySet,
}

/// Classification of a runtime stream failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorKind {
  /// A user-supplied function returned an error.
  UserFunction,
  /// A party on the stream violated the demand or signal protocol.
  ProtocolViolation,
  /// The failure originated upstream (an external publisher's error signal,
  /// or a `failed` source).
  Upstream,
  /// An internal invariant did not hold. Seeing this kind indicates a bug in
  /// the pipeline machinery, not in user code.
  Internal,
}

impl StreamErrorKind {
  fn label(self) -> &'static str {
    match self {
      StreamErrorKind::UserFunction => "user function",
      StreamErrorKind::ProtocolViolation => "protocol violation",
      StreamErrorKind::Upstream => "upstream",
      StreamErrorKind::Internal => "internal",
    }
  }
}

/// Error that terminated a running pipeline.
///
/// Carries the failure kind, the label of the stage where it was observed and
/// a capture timestamp. Cloneable: the executor hands the same error to the
/// downstream subscriber, to lifecycle hooks and to the completion handle.
#[derive(Debug, Clone)]
pub struct StreamError {
  kind: StreamErrorKind,
  stage: String,
  message: String,
  timestamp: chrono::DateTime<chrono::Utc>,
}

impl StreamError {
  /// Creates an error of the given kind observed at the given stage.
  pub fn new(kind: StreamErrorKind, stage: impl Into<String>, message: impl Into<String>) -> Self {
    Self {
      kind,
      stage: stage.into(),
      message: message.into(),
      timestamp: chrono::Utc::now(),
    }
  }

  /// Wraps an error returned by a user-supplied function at `stage`.
  pub fn user_function(stage: impl Into<String>, source: UserFnError) -> Self {
    Self::new(StreamErrorKind::UserFunction, stage, source.to_string())
  }

  /// Records a demand or signal protocol violation observed at `stage`.
  pub fn protocol(stage: impl Into<String>, message: impl Into<String>) -> Self {
    Self::new(StreamErrorKind::ProtocolViolation, stage, message)
  }

  /// Records a failure that arrived from upstream of the pipeline.
  pub fn upstream(message: impl Into<String>) -> Self {
    Self::new(StreamErrorKind::Upstream, "upstream", message)
  }

  pub(crate) fn internal(stage: impl Into<String>, message: impl Into<String>) -> Self {
    Self::new(StreamErrorKind::Internal, stage, message)
  }

  /// The failure classification.
  pub fn kind(&self) -> StreamErrorKind {
    self.kind
  }

  /// Label of the stage where the failure was observed, such as `"map"` or
  /// `"collect"`.
  pub fn stage(&self) -> &str {
    &self.stage
  }

  /// Human-readable failure message.
  pub fn message(&self) -> &str {
    &self.message
  }

  /// When the failure was captured.
  pub fn timestamp(&self) -> chrono::DateTime<chrono::Utc> {
    self.timestamp
  }
}

impl fmt::Display for StreamError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{} error in {}: {}",
      self.kind.label(),
      self.stage,
      self.message
    )
  }
}

impl Error for StreamError {}
