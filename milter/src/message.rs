use std::collections::HashMap;
use std::net::SocketAddr;

use bitflags::bitflags;
use bytes::Bytes;

use crate::Response;

/// Highest milter protocol version this implementation speaks.
pub const PROTOCOL_VERSION: u32 = 6;

/// Oldest peer protocol version still accepted during negotiation.
pub const MIN_PROTOCOL_VERSION: u32 = 2;

bitflags! {
    /// Message modification actions a filter may ask the MTA to permit
    /// (the SMFIF_* bits of the wire protocol).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ActionFlags: u32 {
        const ADD_HEADERS = 0x01;
        const CHANGE_BODY = 0x02;
        const ADD_RCPT = 0x04;
        const DELETE_RCPT = 0x08;
        const CHANGE_HEADERS = 0x10;
        const QUARANTINE = 0x20;
    }
}

bitflags! {
    /// Protocol-stage capabilities negotiated with the MTA
    /// (the SMFIP_* bits of the wire protocol).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ProtocolFlags: u32 {
        const NO_CONNECT = 0x01;
        const NO_HELO = 0x02;
        const NO_MAIL = 0x04;
        const NO_RCPT = 0x08;
        const NO_BODY = 0x10;
        const NO_HEADERS = 0x20;
        const NO_EOH = 0x40;
        const SKIP = 0x400;
    }
}

/// MTA-supplied connection/transaction metadata, delivered outside the normal
/// event/response cycle. Written only by the connection runner; filters see
/// read-only snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Macros {
    pairs: HashMap<String, String>,
}

impl Macros {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.pairs.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.pairs.get(name).map(String::as_str)
    }

    /// Overlays `other` on top of the current set; later values win.
    pub fn merge(&mut self, other: &Macros) {
        for (name, value) in &other.pairs {
            self.pairs.insert(name.clone(), value.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// One unit of protocol information about an in-progress mail transaction.
/// Events for a connection are delivered to every filter in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connect {
        hostname: String,
        address: Option<SocketAddr>,
    },
    Helo {
        hostname: String,
    },
    MailFrom {
        sender: String,
        args: Vec<String>,
    },
    RcptTo {
        recipient: String,
        args: Vec<String>,
    },
    Data,
    Header {
        name: String,
        value: String,
    },
    EndOfHeaders,
    Body {
        chunk: Bytes,
    },
    EndOfMessage,
    Unknown {
        command: String,
    },
}

impl Event {
    pub fn is_connect(&self) -> bool {
        matches!(self, Event::Connect { .. })
    }

    /// Short stable name, used for logging instead of the full payload.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Connect { .. } => "connect",
            Event::Helo { .. } => "helo",
            Event::MailFrom { .. } => "mail_from",
            Event::RcptTo { .. } => "rcpt_to",
            Event::Data => "data",
            Event::Header { .. } => "header",
            Event::EndOfHeaders => "end_of_headers",
            Event::Body { .. } => "body",
            Event::EndOfMessage => "end_of_message",
            Event::Unknown { .. } => "unknown",
        }
    }
}

/// A decoded protocol message, either direction of the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Negotiate {
        version: u32,
        actions: ActionFlags,
        protocol: ProtocolFlags,
    },
    Macro(Macros),
    Event(Event),
    Abort,
    Quit,
    Reply(Response),
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Negotiate { .. } => "negotiate",
            Message::Macro(_) => "macro",
            Message::Event(event) => event.kind(),
            Message::Abort => "abort",
            Message::Quit => "quit",
            Message::Reply(_) => "reply",
        }
    }
}
