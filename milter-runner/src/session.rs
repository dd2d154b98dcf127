use async_channel::Receiver;
use milter::{Event, Filter, Macros, Response};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Inputs a filter task feeds into its session.
pub(crate) enum SessionInput {
    Deliver {
        event: Event,
        macros: Macros,
        reply: oneshot::Sender<Response>,
    },
    Macros(Macros),
    Abort(oneshot::Sender<()>),
}

/// Runs one filter against its inbox until the inbox closes, the transaction
/// aborts, or the task is cancelled.
///
/// Filter failures never escape this loop: an error from the filter, or a
/// response that violates the protocol contract, is logged and answered with
/// a temporary failure. Cancellation mid-event drops the pending reply slot,
/// which the waiting filter task turns into a non-blocking `Continue`.
pub(crate) async fn run_session(
    mut filter: Box<dyn Filter>,
    inbox: Receiver<SessionInput>,
    ready: oneshot::Sender<()>,
    cancel: CancellationToken,
) {
    if ready.send(()).is_err() {
        return;
    }

    loop {
        let input = tokio::select! {
            _ = cancel.cancelled() => break,
            input = inbox.recv() => match input {
                Ok(input) => input,
                Err(_) => break,
            },
        };

        match input {
            SessionInput::Deliver {
                event,
                macros,
                reply,
            } => {
                let outcome = tokio::select! {
                    _ = cancel.cancelled() => break,
                    outcome = filter.on_event(&event, &macros) => outcome,
                };
                let response = match outcome {
                    Ok(response) => match response.validate() {
                        Ok(()) => response,
                        Err(violation) => {
                            warn!(
                                filter = filter.name(),
                                %violation,
                                "filter contract violation, substituting temporary failure"
                            );
                            Response::TempFail
                        }
                    },
                    Err(err) => {
                        warn!(
                            filter = filter.name(),
                            error = %err,
                            "filter failed, substituting temporary failure"
                        );
                        Response::TempFail
                    }
                };
                let _ = reply.send(response);
            }
            SessionInput::Macros(macros) => filter.on_macros(&macros).await,
            SessionInput::Abort(ack) => {
                filter.on_abort().await;
                let _ = ack.send(());
                break;
            }
        }
    }
}
