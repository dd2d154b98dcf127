use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use milter::{Event, FilterFactory, Macros, Response};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::RunnerCfg;
use crate::task::{FilterTask, TaskState};

/// Outcome of handing one event to the filter set: either a verdict to put on
/// the wire, or `Continue` meaning more events are expected first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Continue,
    Reply(Response),
}

/// Owns the full set of filter tasks for one connection: fans events out,
/// folds the answers into one aggregate verdict, and manages abort/close for
/// the whole set.
pub struct TaskRunner {
    tasks: Vec<FilterTask>,
    cancel: CancellationToken,
    abort_timeout: Duration,
    closed: bool,
}

impl TaskRunner {
    /// Builds one filter task per registered factory, delivers the connect
    /// event to every one that started, and folds the answers.
    ///
    /// Startup is not required to be unanimous: a filter that fails to
    /// construct contributes an immediate temporary failure to the fold while
    /// its siblings still run.
    pub async fn start(
        factories: &[Arc<dyn FilterFactory>],
        connect: &Event,
        macros: &Macros,
        cfg: &RunnerCfg,
    ) -> (Self, Dispatch) {
        let cancel = CancellationToken::new();
        let mut tasks: Vec<FilterTask> = factories
            .iter()
            .map(|factory| {
                FilterTask::spawn(
                    factory.as_ref(),
                    cancel.child_token(),
                    cfg.event_timeout(),
                    cfg.channel_capacity,
                )
            })
            .collect();

        let mut fresh: Vec<Response> = join_all(tasks.iter_mut().map(|task| task.wait_ready()))
            .await
            .into_iter()
            .flatten()
            .collect();

        let mut runner = TaskRunner {
            tasks,
            cancel,
            abort_timeout: cfg.abort_timeout(),
            closed: false,
        };
        let started = runner.tasks.iter().filter(|task| task.is_live()).count();
        debug!(
            configured = factories.len(),
            started, "filter set started"
        );

        fresh.append(&mut runner.fan_out(connect, macros).await);
        let verdict = runner.fold(&fresh);
        (runner, verdict)
    }

    /// Delivers one event to every live filter task concurrently and folds
    /// the responses. Tasks that already hold a final response are excluded
    /// from fan-out but still count toward the all-accept/all-skip checks.
    pub async fn dispatch(&mut self, event: &Event, macros: &Macros) -> Dispatch {
        if self.closed {
            return Dispatch::Continue;
        }
        let fresh = self.fan_out(event, macros).await;
        self.fold(&fresh)
    }

    /// Broadcasts macro metadata to every session without expecting answers.
    pub fn deliver_macro(&self, macros: &Macros) {
        if self.closed {
            return;
        }
        for task in &self.tasks {
            task.deliver_macro(macros);
        }
    }

    /// Cooperative teardown: every session is asked to acknowledge the abort
    /// within the configured bound, then the whole set is closed.
    pub async fn abort(&mut self) {
        if self.closed {
            return;
        }
        info!("aborting filter set");
        let mut acks = Vec::new();
        for task in &mut self.tasks {
            if let Some(ack) = task.begin_abort() {
                acks.push(ack);
            }
        }
        if !acks.is_empty() {
            let _ = tokio::time::timeout(self.abort_timeout, join_all(acks)).await;
        }
        self.close();
    }

    /// Unconditional teardown of all outstanding work. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.cancel.cancel();
        for task in &mut self.tasks {
            task.close();
        }
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    async fn fan_out(&mut self, event: &Event, macros: &Macros) -> Vec<Response> {
        let mut inflight: FuturesUnordered<_> = self
            .tasks
            .iter_mut()
            .filter(|task| task.is_live())
            .map(|task| task.push(event, macros))
            .collect();

        // collect in completion order: the first reject-class response to
        // arrive wins the fold tie-break
        let mut responses = Vec::with_capacity(inflight.len());
        while let Some(response) = inflight.next().await {
            responses.push(response);
        }
        responses
    }

    fn fold(&self, fresh: &[Response]) -> Dispatch {
        let open: Vec<&FilterTask> = self
            .tasks
            .iter()
            .filter(|task| !matches!(task.state(), TaskState::Closed))
            .collect();
        let all_accepted = !open.is_empty()
            && open
                .iter()
                .all(|task| matches!(task.state(), TaskState::Final(Response::Accept)));
        fold_responses(fresh, all_accepted)
    }
}

/// Folds one event cycle's responses into the aggregate verdict.
///
/// `fresh` holds the responses collected this cycle in arrival order;
/// `all_accepted` is whether every filter task (including ones that went
/// final on an earlier event) now holds a final accept. The rules
/// short-circuit in severity order, so the verdict is never more permissive
/// than the most restrictive non-provisional response.
pub(crate) fn fold_responses(fresh: &[Response], all_accepted: bool) -> Dispatch {
    if fresh.iter().any(|r| matches!(r, Response::TempFail)) {
        return Dispatch::Reply(Response::TempFail);
    }
    if let Some(response) = fresh.iter().find(|r| r.is_reject_class()) {
        return Dispatch::Reply(response.clone());
    }
    if all_accepted {
        return Dispatch::Reply(Response::Accept);
    }
    if !fresh.is_empty() && fresh.iter().all(|r| matches!(r, Response::Skip)) {
        return Dispatch::Reply(Response::Skip);
    }
    Dispatch::Continue
}
