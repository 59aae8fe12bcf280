//! Concurrent checking of external sources.
//!
//! Every source still in the `Unknown` state gets its own task. Tasks:
//! - wait until the source's parent (if scheduled in this run) has been checked
//! - then take a permit from the shared semaphore
//! - run each applicable checker until one settles the source or fails
//! - commit the result and fire the source's checked latch
//!
//! Checker failures are collected, never raised. A task that is aborted by
//! the run timeout leaves its source untouched.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;
use tokio::sync::{Semaphore, watch};
use tokio::task::{Id, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::checker::{CheckContext, CheckerError, CheckerRegistry};
use crate::external::{CheckResult, ExternalSource, SourceLoadError};
use crate::http::HttpClient;
use crate::manifest::CheckerOptions;
use crate::update::UpdateError;
use crate::update::appdata::AppdataError;

/// A recoverable error recorded during a run.
#[derive(Debug, Error)]
pub enum RunError {
  #[error(transparent)]
  Load(#[from] SourceLoadError),

  #[error("failed to check {source_id} with {checker}: {error}")]
  Checker {
    source_id: String,
    checker: String,
    #[source]
    error: CheckerError,
  },

  #[error("check of {source_id} was cancelled by the run timeout")]
  Timeout { source_id: String },

  #[error("check task for {source_id} failed: {message}")]
  Task { source_id: String, message: String },

  #[error("failed to set up the HTTP session: {message}")]
  Client { message: String },

  #[error(transparent)]
  Update(#[from] UpdateError),

  #[error(transparent)]
  Appdata(#[from] AppdataError),
}

impl RunError {
  /// The source this error is about, when there is one.
  pub fn source_id(&self) -> Option<&str> {
    match self {
      RunError::Checker { source_id, .. } | RunError::Timeout { source_id } | RunError::Task { source_id, .. } => {
        Some(source_id)
      }
      RunError::Update(UpdateError::NoCommonDigest { source_id, .. }) => Some(source_id),
      _ => None,
    }
  }
}

/// What a run did.
#[derive(Debug, Default)]
pub struct CheckOutcome {
  /// Sources scheduled in this run, in declaration order.
  pub checked: Vec<Arc<ExternalSource>>,
  pub errors: Vec<RunError>,
}

/// Progress counter shared by every task of a run.
#[derive(Debug)]
struct TasksCounter {
  started: AtomicUsize,
  finished: AtomicUsize,
  total: usize,
}

impl TasksCounter {
  fn new(total: usize) -> Self {
    Self {
      started: AtomicUsize::new(0),
      finished: AtomicUsize::new(0),
      total,
    }
  }

  fn start(&self) -> usize {
    self.started.fetch_add(1, Ordering::SeqCst) + 1
  }

  fn finish(&self) -> usize {
    self.finished.fetch_add(1, Ordering::SeqCst) + 1
  }
}

/// Fires the checked latch when dropped, whether the task finished,
/// failed, or was aborted.
struct CheckedLatch(watch::Sender<bool>);

impl Drop for CheckedLatch {
  fn drop(&mut self) {
    self.0.send_replace(true);
  }
}

/// Everything a check task needs, shared across tasks.
struct RunShared {
  registry: CheckerRegistry,
  http: HttpClient,
  options: CheckerOptions,
  semaphore: Semaphore,
  counter: TasksCounter,
}

/// Check `sources` concurrently, parents before their children.
pub async fn run(sources: Vec<Arc<ExternalSource>>, registry: &CheckerRegistry, options: &CheckerOptions) -> CheckOutcome {
  let mut outcome = CheckOutcome::default();

  let http = match HttpClient::from_options(options) {
    Ok(http) => http,
    Err(e) => {
      error!(error = %e, "cannot check sources");
      outcome.errors.push(RunError::Client { message: e.to_string() });
      return outcome;
    }
  };

  let scheduled: Vec<Arc<ExternalSource>> = sources.into_iter().filter(|s| !s.result().is_settled()).collect();
  info!(sources = scheduled.len(), parallelism = options.parallelism, "checking external sources");

  let mut latches: HashMap<usize, (CheckedLatch, watch::Receiver<bool>)> = HashMap::new();
  for source in &scheduled {
    let (tx, rx) = watch::channel(false);
    latches.insert(identity(source), (CheckedLatch(tx), rx));
  }
  let receivers: HashMap<usize, watch::Receiver<bool>> = latches.iter().map(|(key, (_, rx))| (*key, rx.clone())).collect();

  let shared = Arc::new(RunShared {
    registry: registry.clone(),
    http,
    options: options.clone(),
    semaphore: Semaphore::new(options.parallelism.max(1)),
    counter: TasksCounter::new(scheduled.len()),
  });

  let mut join_set = JoinSet::new();
  let mut task_sources: HashMap<Id, Arc<ExternalSource>> = HashMap::new();
  for source in &scheduled {
    let Some((latch, _)) = latches.remove(&identity(source)) else {
      continue;
    };
    let parent_done = source.parent().and_then(|parent| receivers.get(&identity(parent)).cloned());
    let handle = join_set.spawn(check_source(source.clone(), parent_done, latch, shared.clone()));
    task_sources.insert(handle.id(), source.clone());
  }

  let deadline = options.run_timeout.map(|timeout| Instant::now() + timeout);
  loop {
    let next = match deadline {
      Some(deadline) => match tokio::time::timeout_at(deadline, join_set.join_next_with_id()).await {
        Ok(next) => next,
        Err(_) => {
          warn!(remaining = join_set.len(), "run timeout reached, cancelling checks");
          join_set.abort_all();
          drain(&mut join_set, &task_sources, &mut outcome.errors).await;
          break;
        }
      },
      None => join_set.join_next_with_id().await,
    };
    let Some(joined) = next else {
      break;
    };
    collect(joined, &task_sources, &mut outcome.errors);
  }

  info!(
    checked = scheduled.len(),
    outdated = scheduled.iter().filter(|s| s.is_outdated()).count(),
    errors = outcome.errors.len(),
    "check complete"
  );
  outcome.checked = scheduled;
  outcome
}

/// Aliased sources share one allocation, so the pointer identifies a source.
fn identity(source: &Arc<ExternalSource>) -> usize {
  Arc::as_ptr(source) as usize
}

async fn drain(
  join_set: &mut JoinSet<Vec<RunError>>,
  task_sources: &HashMap<Id, Arc<ExternalSource>>,
  errors: &mut Vec<RunError>,
) {
  while let Some(joined) = join_set.join_next_with_id().await {
    collect(joined, task_sources, errors);
  }
}

fn collect(
  joined: Result<(Id, Vec<RunError>), tokio::task::JoinError>,
  task_sources: &HashMap<Id, Arc<ExternalSource>>,
  errors: &mut Vec<RunError>,
) {
  match joined {
    Ok((_, task_errors)) => errors.extend(task_errors),
    Err(e) => {
      let source_id = task_sources
        .get(&e.id())
        .map(|s| s.id().to_string())
        .unwrap_or_default();
      if e.is_cancelled() {
        errors.push(RunError::Timeout { source_id });
      } else {
        error!(source = %source_id, error = %e, "check task panicked");
        errors.push(RunError::Task {
          source_id,
          message: e.to_string(),
        });
      }
    }
  }
}

async fn check_source(
  source: Arc<ExternalSource>,
  parent_done: Option<watch::Receiver<bool>>,
  _latch: CheckedLatch,
  shared: Arc<RunShared>,
) -> Vec<RunError> {
  if let Some(mut parent_done) = parent_done {
    debug!(source = %source, "waiting for parent check");
    // The parent's latch fires on drop, so a closed channel means it already fired.
    let _ = parent_done.wait_for(|done| *done).await;
  }

  let Ok(_permit) = shared.semaphore.acquire().await else {
    return Vec::new();
  };

  let checkers = shared.registry.applicable(&source);
  let n = shared.counter.start();
  let total = shared.counter.total;
  if checkers.is_empty() {
    info!(source = %source, "Skipped check [{}/{}]", n, total);
    shared.counter.finish();
    return Vec::new();
  }
  info!(source = %source, "Started check [{}/{}]", n, total);

  let ctx = CheckContext {
    http: &shared.http,
    options: &shared.options,
  };
  let mut result = CheckResult::default();
  let mut errors = Vec::new();

  for checker in checkers {
    debug!(source = %source, checker = checker.name(), "running checker");
    let mut attempt = result.clone();
    let checked = match checker.validate(&source) {
      Ok(()) => checker.check(&ctx, &source, &mut attempt).await,
      Err(e) => Err(e),
    };
    match checked {
      Ok(()) => result = attempt,
      Err(e) => {
        error!(source = %source, checker = checker.name(), error = %e, "Failed to check {} with {}", source, checker.name());
        errors.push(RunError::Checker {
          source_id: source.id().to_string(),
          checker: checker.name().to_string(),
          error: e,
        });
        break;
      }
    }
    if result.is_settled() {
      break;
    }
  }

  source.commit(result);
  let done = shared.counter.finish();
  info!(source = %source, state = %source.state(), "Finished check [{}/{}]", done, total);
  errors
}
