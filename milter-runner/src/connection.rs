use std::sync::Arc;

use bytes::BytesMut;
use miette::Diagnostic;
use milter::{
    ActionFlags, CodecError, Event, FilterFactory, Macros, Message, MessageCodec, ProtocolFlags,
    Response, Transport, TransportError, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::RunnerCfg;
use crate::task_runner::{Dispatch, TaskRunner};

#[derive(Debug, Error, Diagnostic)]
pub enum RunnerError {
    #[error("negotiation failed: {reason}")]
    #[diagnostic(code(milter_runner::negotiation))]
    Negotiation { reason: String },

    #[error("codec error")]
    #[diagnostic(code(milter_runner::codec))]
    Codec(#[from] CodecError),

    #[error("transport error")]
    #[diagnostic(code(milter_runner::transport))]
    Transport(#[from] TransportError),

    #[error("no filters registered")]
    #[diagnostic(code(milter_runner::no_filters))]
    NoFilters,
}

#[derive(Debug, Clone, Copy)]
struct Negotiated {
    version: u32,
    actions: ActionFlags,
    protocol: ProtocolFlags,
}

enum Flow {
    Continue,
    Quit,
}

/// Drives the read/decode/route/encode/write cycle for one MTA connection.
///
/// The runner owns the byte stream and the codec buffer exclusively; filter
/// tasks never touch either. One transport failure is fatal for this
/// connection only.
pub struct ConnectionRunner<T, C> {
    transport: T,
    codec: C,
    factories: Vec<Arc<dyn FilterFactory>>,
    cfg: RunnerCfg,
    negotiated: Option<Negotiated>,
    macros: Macros,
    tasks: Option<TaskRunner>,
    connect: Option<Event>,
    restart_pending: bool,
}

impl<T, C> ConnectionRunner<T, C>
where
    T: Transport,
    C: MessageCodec,
{
    pub fn new(
        transport: T,
        codec: C,
        factories: Vec<Arc<dyn FilterFactory>>,
        cfg: RunnerCfg,
    ) -> Result<Self, RunnerError> {
        if factories.is_empty() {
            return Err(RunnerError::NoFilters);
        }
        Ok(ConnectionRunner {
            transport,
            codec,
            factories,
            cfg,
            negotiated: None,
            macros: Macros::new(),
            tasks: None,
            connect: None,
            restart_pending: false,
        })
    }

    /// Runs the connection to completion: until the peer quits, the stream
    /// closes, or a fatal protocol error occurs. All exits tear the filter
    /// set down unconditionally.
    pub async fn run(mut self) -> Result<(), RunnerError> {
        let mut buf = BytesMut::with_capacity(self.cfg.read_buffer_size);
        loop {
            loop {
                let message = match self.codec.read_from(&mut buf) {
                    Ok(Some(message)) => message,
                    Ok(None) => break,
                    Err(err) => {
                        self.shutdown();
                        return Err(err.into());
                    }
                };
                match self.handle_message(message).await {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Quit) => {
                        self.shutdown();
                        return Ok(());
                    }
                    Err(err) => {
                        self.shutdown();
                        return Err(err);
                    }
                }
            }

            match self.transport.receive(self.cfg.read_buffer_size).await {
                Ok(bytes) => buf.extend_from_slice(&bytes),
                Err(TransportError::EndOfStream) => {
                    info!("connection closed by peer");
                    self.shutdown();
                    return Ok(());
                }
                Err(err) => {
                    warn!(error = %err, "transport failed, closing connection");
                    self.shutdown();
                    return Err(err.into());
                }
            }
        }
    }

    async fn handle_message(&mut self, message: Message) -> Result<Flow, RunnerError> {
        debug!(message = message.kind(), "handling message");
        match message {
            Message::Negotiate {
                version,
                actions,
                protocol,
            } => {
                self.negotiate(version, actions, protocol).await?;
                Ok(Flow::Continue)
            }
            Message::Macro(macros) => {
                // buffered into the connection context either way; broadcast
                // only once a filter set exists
                self.macros.merge(&macros);
                if let Some(tasks) = &self.tasks {
                    tasks.deliver_macro(&self.macros);
                }
                Ok(Flow::Continue)
            }
            Message::Event(event) if event.is_connect() => {
                self.start_cycle(event).await?;
                Ok(Flow::Continue)
            }
            Message::Event(event) => {
                self.handle_event(event).await?;
                Ok(Flow::Continue)
            }
            Message::Abort => {
                if let Some(tasks) = self.tasks.as_mut() {
                    tasks.abort().await;
                }
                self.restart_pending = true;
                Ok(Flow::Continue)
            }
            Message::Quit => Ok(Flow::Quit),
            Message::Reply(response) => {
                warn!(
                    response = response.kind(),
                    "peer sent a reply message, ignoring"
                );
                Ok(Flow::Continue)
            }
        }
    }

    async fn negotiate(
        &mut self,
        version: u32,
        actions: ActionFlags,
        protocol: ProtocolFlags,
    ) -> Result<(), RunnerError> {
        if version < MIN_PROTOCOL_VERSION {
            return Err(RunnerError::Negotiation {
                reason: format!(
                    "peer protocol version {version} is older than supported minimum {MIN_PROTOCOL_VERSION}"
                ),
            });
        }
        let required = self.cfg.required_actions();
        if !actions.contains(required) {
            let missing = required.difference(actions);
            return Err(RunnerError::Negotiation {
                reason: format!("peer does not offer required actions {missing:?}"),
            });
        }

        let negotiated = Negotiated {
            version: version.min(PROTOCOL_VERSION),
            actions: required,
            protocol: protocol & ProtocolFlags::all(),
        };
        info!(
            version = negotiated.version,
            actions = ?negotiated.actions,
            protocol = ?negotiated.protocol,
            "negotiated with peer"
        );
        self.negotiated = Some(negotiated);

        self.write_message(&Message::Negotiate {
            version: negotiated.version,
            actions: negotiated.actions,
            protocol: negotiated.protocol,
        })
        .await
    }

    /// Builds a fresh filter set for a new connection cycle, delivering the
    /// connect event and any macros buffered before it.
    async fn start_cycle(&mut self, connect: Event) -> Result<(), RunnerError> {
        if let Some(tasks) = self.tasks.as_mut() {
            tasks.abort().await;
        }
        self.connect = Some(connect.clone());
        self.restart_pending = false;

        let (tasks, verdict) =
            TaskRunner::start(&self.factories, &connect, &self.macros, &self.cfg).await;
        self.tasks = Some(tasks);
        self.finish_dispatch(verdict).await
    }

    async fn handle_event(&mut self, event: Event) -> Result<(), RunnerError> {
        if self.tasks.is_none() || self.restart_pending {
            let Some(connect) = self.connect.clone() else {
                warn!(
                    event = event.kind(),
                    "event before connect, answering temporary failure"
                );
                return self.write_message(&Message::Reply(Response::TempFail)).await;
            };
            self.start_cycle(connect).await?;
            if self.restart_pending {
                // the rebuilt set already went final again; drop the event
                return Ok(());
            }
        }

        let Some(tasks) = self.tasks.as_mut() else {
            return Ok(());
        };
        let verdict = tasks.dispatch(&event, &self.macros).await;
        self.finish_dispatch(verdict).await
    }

    async fn finish_dispatch(&mut self, verdict: Dispatch) -> Result<(), RunnerError> {
        let Dispatch::Reply(response) = verdict else {
            return Ok(());
        };
        let response = match self.gate_skip(response) {
            // a downgraded skip means nothing to tell the MTA yet
            Response::Continue => return Ok(()),
            response => response,
        };

        if response.is_final() {
            // message decided: only an abort may still reach the filters
            if let Some(tasks) = self.tasks.as_mut() {
                tasks.abort().await;
            }
            self.restart_pending = true;
        }
        self.write_message(&Message::Reply(response)).await
    }

    /// A skip verdict may only go on the wire when the MTA negotiated the
    /// skip capability.
    fn gate_skip(&self, response: Response) -> Response {
        match response {
            Response::Skip if !self.skip_negotiated() => {
                debug!("skip not negotiated, downgrading to continue");
                Response::Continue
            }
            response => response,
        }
    }

    fn skip_negotiated(&self) -> bool {
        self.negotiated
            .map(|n| n.protocol.contains(ProtocolFlags::SKIP))
            .unwrap_or(false)
    }

    async fn write_message(&mut self, message: &Message) -> Result<(), RunnerError> {
        let mut out = BytesMut::new();
        self.codec.write_to(&mut out, message)?;
        self.transport.send(&out).await?;
        Ok(())
    }

    fn shutdown(&mut self) {
        if let Some(tasks) = self.tasks.as_mut() {
            tasks.close();
        }
    }
}
