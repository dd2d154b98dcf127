use thiserror::Error;

/// A filter's answer to one protocol event.
///
/// `Continue` and `Skip` are provisional: the filter keeps taking part in the
/// current transaction. Every other variant is final and ends the filter's
/// participation until the next transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Keep going; the filter wants to see more events.
    Continue,
    /// No opinion on further chunks of the current stage; the MTA may elide
    /// the remaining body chunks until the next boundary.
    Skip,
    /// Accept the message unconditionally.
    Accept,
    /// Reject the message permanently.
    Reject,
    /// Silently discard the message.
    Discard,
    /// Fail the message temporarily; the MTA should retry later.
    TempFail,
    /// Reject with a custom SMTP reply. `code` must be in the 4xx/5xx range.
    ReplyCode { code: u16, text: String },
}

/// Ways a filter's response can violate the protocol contract. Distinguished
/// from filter failures so operators can tell a bug in the produced verdict
/// from a crash.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContractViolation {
    #[error("reply code {0} is outside the 4xx/5xx range")]
    CodeOutOfRange(u16),

    #[error("reply text contains line breaks")]
    TextNotSingleLine,
}

impl Response {
    pub fn is_provisional(&self) -> bool {
        matches!(self, Response::Continue | Response::Skip)
    }

    pub fn is_final(&self) -> bool {
        !self.is_provisional()
    }

    /// Reject-class responses terminate the message with a negative verdict
    /// and win the aggregate fold over everything except a temporary failure.
    pub fn is_reject_class(&self) -> bool {
        matches!(
            self,
            Response::Reject | Response::Discard | Response::ReplyCode { .. }
        )
    }

    /// Checks that the response is well-formed enough to put on the wire.
    pub fn validate(&self) -> Result<(), ContractViolation> {
        match self {
            Response::ReplyCode { code, text } => {
                if !(400..=599).contains(code) {
                    return Err(ContractViolation::CodeOutOfRange(*code));
                }
                if text.contains('\r') || text.contains('\n') {
                    return Err(ContractViolation::TextNotSingleLine);
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Short stable name, used for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Response::Continue => "continue",
            Response::Skip => "skip",
            Response::Accept => "accept",
            Response::Reject => "reject",
            Response::Discard => "discard",
            Response::TempFail => "temp_fail",
            Response::ReplyCode { .. } => "reply_code",
        }
    }
}
