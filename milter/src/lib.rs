use async_trait::async_trait;
use miette::Diagnostic;
use thiserror::Error;

mod codec;
mod message;
mod response;
mod transport;

pub use codec::{CodecError, MessageCodec};
pub use message::{
    ActionFlags, Event, Macros, Message, ProtocolFlags, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION,
};
pub use response::{ContractViolation, Response};
pub use transport::{StreamTransport, Transport, TransportError};

#[derive(Debug, Error, Diagnostic)]
pub enum FilterError {
    #[error("filter failed: {0}")]
    #[diagnostic(code(milter::filter_failed))]
    Failed(String),

    #[error("IO error")]
    #[diagnostic(code(milter::io_error))]
    Io(#[from] std::io::Error),
}

/// One independently-configured piece of mail filtering logic, run against the
/// ordered event stream of a single MTA connection.
///
/// A fresh instance is built per connection cycle; `on_event` is never called
/// again before the previous call has returned. Returning a final [`Response`]
/// (anything other than `Continue`/`Skip`) ends this filter's participation in
/// the current cycle.
#[async_trait]
pub trait Filter: Send {
    fn name(&self) -> &str;

    /// Handles one protocol event and answers with a verdict for it.
    async fn on_event(&mut self, event: &Event, macros: &Macros) -> Result<Response, FilterError>;

    /// Receives MTA macro updates. No verdict is expected.
    async fn on_macros(&mut self, _macros: &Macros) {}

    /// Called when the MTA aborts the current mail transaction.
    async fn on_abort(&mut self) {}
}

/// Builds one [`Filter`] instance per connection cycle. Registered factories
/// keep their registration order for event fan-out.
pub trait FilterFactory: Send + Sync {
    fn name(&self) -> &str;

    fn build(&self) -> Result<Box<dyn Filter>, FilterError>;
}
