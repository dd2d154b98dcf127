use std::time::Duration;

use async_channel::Sender;
use milter::{Event, FilterFactory, Macros, Response};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::session::{run_session, SessionInput};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TaskState {
    /// Session is being constructed; not yet accepting events.
    Starting,
    /// Session acknowledged readiness; events are accepted one at a time.
    Live,
    /// Session answered with a final response; no more events this cycle.
    Final(Response),
    /// Resources released. Terminal.
    Closed,
}

/// The concurrency unit for one (connection x filter) pair: owns the session
/// task and enforces per-filter single-flight and timeout rules.
pub(crate) struct FilterTask {
    name: String,
    state: TaskState,
    inbox: Sender<SessionInput>,
    handle: JoinHandle<()>,
    cancel: CancellationToken,
    ready: Option<oneshot::Receiver<()>>,
    event_timeout: Duration,
}

impl FilterTask {
    pub(crate) fn spawn(
        factory: &dyn FilterFactory,
        cancel: CancellationToken,
        event_timeout: Duration,
        capacity: usize,
    ) -> Self {
        let (inbox, outbox) = async_channel::bounded(capacity);
        let (ready_tx, ready_rx) = oneshot::channel();
        let name = factory.name().to_string();
        let handle = match factory.build() {
            Ok(filter) => tokio::spawn(run_session(filter, outbox, ready_tx, cancel.clone())),
            Err(err) => {
                error!(filter = %name, error = %err, "failed to construct filter session");
                // dropping ready_tx makes wait_ready report the startup failure
                drop(ready_tx);
                tokio::spawn(async {})
            }
        };

        FilterTask {
            name,
            state: TaskState::Starting,
            inbox,
            handle,
            cancel,
            ready: Some(ready_rx),
            event_timeout,
        }
    }

    pub(crate) fn state(&self) -> &TaskState {
        &self.state
    }

    pub(crate) fn is_live(&self) -> bool {
        matches!(self.state, TaskState::Live)
    }

    /// Waits for the session to leave `Starting`. Returns the immediate
    /// response a failed startup contributes to the initial fold.
    pub(crate) async fn wait_ready(&mut self) -> Option<Response> {
        let Some(ready) = self.ready.take() else {
            return None;
        };
        match ready.await {
            Ok(()) => {
                self.state = TaskState::Live;
                None
            }
            Err(_) => {
                self.state = TaskState::Final(Response::TempFail);
                Some(Response::TempFail)
            }
        }
    }

    /// Hands one event to the session and waits for its answer.
    ///
    /// Single-flight per task is enforced by `&mut self`. A task that is
    /// already `Final` or `Closed` answers with the `Skip` sentinel without
    /// forwarding anything: an already decided filter must not be asked again.
    pub(crate) async fn push(&mut self, event: &Event, macros: &Macros) -> Response {
        if !self.is_live() {
            return Response::Skip;
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let input = SessionInput::Deliver {
            event: event.clone(),
            macros: macros.clone(),
            reply: reply_tx,
        };
        if self.inbox.send(input).await.is_err() {
            warn!(filter = %self.name, "session gone, treating as temporary failure");
            self.state = TaskState::Final(Response::TempFail);
            return Response::TempFail;
        }

        let response = match timeout(self.event_timeout, reply_rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                if self.cancel.is_cancelled() {
                    // aborted mid-event: placeholder so the caller never hangs
                    Response::Continue
                } else {
                    warn!(
                        filter = %self.name,
                        event = event.kind(),
                        "session died mid-event, treating as temporary failure"
                    );
                    Response::TempFail
                }
            }
            Err(_) => {
                warn!(
                    filter = %self.name,
                    event = event.kind(),
                    timeout = ?self.event_timeout,
                    "filter timed out, cancelling session"
                );
                self.cancel.cancel();
                Response::TempFail
            }
        };

        debug!(
            filter = %self.name,
            event = event.kind(),
            response = response.kind(),
            "filter answered"
        );
        if response.is_final() {
            self.state = TaskState::Final(response.clone());
        }
        response
    }

    /// Fire-and-forget macro broadcast. A session whose inbox is full is
    /// skipped rather than awaited, so one stuck filter cannot stall the
    /// whole broadcast.
    pub(crate) fn deliver_macro(&self, macros: &Macros) {
        if matches!(self.state, TaskState::Closed) {
            return;
        }
        if self
            .inbox
            .try_send(SessionInput::Macros(macros.clone()))
            .is_err()
        {
            debug!(filter = %self.name, "session inbox full, dropping macro update");
        }
    }

    /// Sends the cooperative abort signal. Returns the acknowledgement slot,
    /// or `None` when the session is already gone or unresponsive.
    pub(crate) fn begin_abort(&mut self) -> Option<oneshot::Receiver<()>> {
        if matches!(self.state, TaskState::Closed) {
            return None;
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        match self.inbox.try_send(SessionInput::Abort(ack_tx)) {
            Ok(()) => Some(ack_rx),
            Err(_) => None,
        }
    }

    /// Unconditional teardown. Idempotent.
    pub(crate) fn close(&mut self) {
        if matches!(self.state, TaskState::Closed) {
            return;
        }
        self.cancel.cancel();
        self.inbox.close();
        self.handle.abort();
        self.state = TaskState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use milter::{Filter, FilterError};

    struct OneShotAccept {
        asked: usize,
    }

    #[async_trait]
    impl Filter for OneShotAccept {
        fn name(&self) -> &str {
            "one_shot_accept"
        }

        async fn on_event(
            &mut self,
            _event: &Event,
            _macros: &Macros,
        ) -> Result<Response, FilterError> {
            self.asked += 1;
            Ok(Response::Accept)
        }
    }

    struct Panicky;

    #[async_trait]
    impl Filter for Panicky {
        fn name(&self) -> &str {
            "panicky"
        }

        async fn on_event(
            &mut self,
            _event: &Event,
            _macros: &Macros,
        ) -> Result<Response, FilterError> {
            panic!("filter bug");
        }
    }

    struct BadReplyCode;

    #[async_trait]
    impl Filter for BadReplyCode {
        fn name(&self) -> &str {
            "bad_reply_code"
        }

        async fn on_event(
            &mut self,
            _event: &Event,
            _macros: &Macros,
        ) -> Result<Response, FilterError> {
            Ok(Response::ReplyCode {
                code: 250,
                text: "not a failure code".into(),
            })
        }
    }

    struct BoxedFactory<F>(F);

    impl<F> FilterFactory for BoxedFactory<F>
    where
        F: Fn() -> Box<dyn Filter> + Send + Sync,
    {
        fn name(&self) -> &str {
            "test"
        }

        fn build(&self) -> Result<Box<dyn Filter>, FilterError> {
            Ok((self.0)())
        }
    }

    fn header() -> Event {
        Event::Header {
            name: "Subject".into(),
            value: "hi".into(),
        }
    }

    async fn live_task(factory: &dyn FilterFactory) -> FilterTask {
        let mut task = FilterTask::spawn(
            factory,
            CancellationToken::new(),
            Duration::from_secs(5),
            16,
        );
        assert_eq!(task.wait_ready().await, None);
        assert!(task.is_live());
        task
    }

    #[tokio::test]
    async fn final_task_answers_skip_sentinel() {
        let factory = BoxedFactory(|| Box::new(OneShotAccept { asked: 0 }) as Box<dyn Filter>);
        let mut task = live_task(&factory).await;

        assert_eq!(task.push(&header(), &Macros::new()).await, Response::Accept);
        assert_eq!(*task.state(), TaskState::Final(Response::Accept));

        // already decided: sentinel, session not contacted again
        assert_eq!(task.push(&header(), &Macros::new()).await, Response::Skip);
        assert_eq!(*task.state(), TaskState::Final(Response::Accept));
    }

    #[tokio::test]
    async fn panicking_session_surfaces_temp_fail_once() {
        let factory = BoxedFactory(|| Box::new(Panicky) as Box<dyn Filter>);
        let mut task = live_task(&factory).await;

        assert_eq!(
            task.push(&header(), &Macros::new()).await,
            Response::TempFail
        );
        assert_eq!(*task.state(), TaskState::Final(Response::TempFail));
        assert_eq!(task.push(&header(), &Macros::new()).await, Response::Skip);
    }

    #[tokio::test]
    async fn contract_violation_becomes_temp_fail() {
        let factory = BoxedFactory(|| Box::new(BadReplyCode) as Box<dyn Filter>);
        let mut task = live_task(&factory).await;

        assert_eq!(
            task.push(&header(), &Macros::new()).await,
            Response::TempFail
        );
    }

    #[tokio::test]
    async fn construction_failure_reports_temp_fail() {
        struct Failing;
        impl FilterFactory for Failing {
            fn name(&self) -> &str {
                "failing"
            }
            fn build(&self) -> Result<Box<dyn Filter>, FilterError> {
                Err(FilterError::Failed("policy refused".into()))
            }
        }

        let mut task = FilterTask::spawn(
            &Failing,
            CancellationToken::new(),
            Duration::from_secs(5),
            16,
        );
        assert_eq!(task.wait_ready().await, Some(Response::TempFail));
        assert_eq!(*task.state(), TaskState::Final(Response::TempFail));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let factory = BoxedFactory(|| Box::new(OneShotAccept { asked: 0 }) as Box<dyn Filter>);
        let mut task = live_task(&factory).await;

        task.close();
        task.close();
        assert_eq!(*task.state(), TaskState::Closed);
        assert_eq!(task.push(&header(), &Macros::new()).await, Response::Skip);
    }
}
