//! Method vocabulary exchanged between clients and nodes, and between nodes.
//!
//! A request arrives as a method name plus ordered `key=value` parameters and is
//! answered with an [`RpcReply`]: a flat string map that always carries
//! `success`, plus `err` on failure and method specific fields otherwise.

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{AcceptedPair, Seqnum, Value};

pub const FIELD_SUCCESS: &str = "success";
pub const FIELD_ERR: &str = "err";
pub const FIELD_MSG: &str = "msg";
pub const FIELD_REPLY: &str = "reply";
pub const FIELD_SEQNUM: &str = "seqnum";
pub const FIELD_VALUE: &str = "value";

pub const REPLY_AGREE: &str = "agree";
pub const REPLY_REJECTED: &str = "rejected";
pub const REPLY_ACCEPTED: &str = "accepted";

pub const ERR_NO_RESPONSE: &str = "No response";
pub const ERR_NOT_AGREED: &str = "Value was not agreed upon";
pub const ERR_NOT_ACCEPTED: &str = "Value was not accepted";
pub const ERR_INVALID_ID: &str = "Invalid id";
pub const ERR_NODE_NOT_FOUND: &str = "Node not found";
pub const ERR_METHOD_NOT_FOUND: &str = "Method not found";
pub const ERR_MALFORMED: &str = "Incorrectly formatted request";
pub const ERR_TOO_FEW_NODES: &str = "Not enough nodes are up";
pub const ERR_SHUTTING_DOWN: &str = "Node is shutting down";
pub const ERR_INTERNAL: &str = "Internal error";
pub const ERR_SEQNUMS_EXHAUSTED: &str = "No sequence numbers left";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// Client entry point: run a full consensus round on a value.
    SendValue,
    ProposeSeqnum,
    AcceptValue,
    Commit,
}

impl Method {
    pub const ALL: [Method; 4] = [Method::SendValue, Method::ProposeSeqnum, Method::AcceptValue, Method::Commit];

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::SendValue => "SEND_VALUE",
            Method::ProposeSeqnum => "PROPOSE_SEQNUM",
            Method::AcceptValue => "ACCEPT_VALUE",
            Method::Commit => "COMMIT",
        }
    }
}

impl Display for Method {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

impl FromStr for Method {
    type Err = RequestError;

    /// Case insensitive, `send.value` is the same as `SEND_VALUE`.
    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let normalized = name.trim().replace('.', "_").to_ascii_uppercase();
        Method::ALL
            .into_iter()
            .find(|method| method.as_str() == normalized)
            .ok_or_else(|| RequestError::UnknownMethod(name.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("unknown method {0:?}")]
    UnknownMethod(String),
    #[error("missing parameter {0:?}")]
    MissingParam(&'static str),
    #[error("parameter {name:?} is not a number: {raw:?}")]
    InvalidParam { name: &'static str, raw: String },
}

impl RequestError {
    /// The reply sent back for a request that could not be decoded.
    pub fn to_reply(&self) -> RpcReply {
        match self {
            RequestError::UnknownMethod(_) => RpcReply::failure(ERR_METHOD_NOT_FOUND),
            _ => RpcReply::failure(ERR_MALFORMED).with(FIELD_MSG, self),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Request {
    SendValue { value: Value },
    ProposeSeqnum { seqnum: Seqnum },
    AcceptValue { seqnum: Seqnum, value: Value },
    Commit { seqnum: Seqnum, value: Value },
}

impl Request {
    /// Decode a request from its method name and parameters. Unknown parameters are ignored.
    pub fn parse<K, V>(method: &str, params: &[(K, V)]) -> Result<Self, RequestError>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let method: Method = method.parse()?;
        let params = Params(params);

        Ok(match method {
            Method::SendValue => Request::SendValue {
                value: params.number(FIELD_VALUE)?,
            },
            Method::ProposeSeqnum => Request::ProposeSeqnum {
                seqnum: params.number(FIELD_SEQNUM)?,
            },
            Method::AcceptValue => Request::AcceptValue {
                seqnum: params.number(FIELD_SEQNUM)?,
                value: params.number(FIELD_VALUE)?,
            },
            Method::Commit => Request::Commit {
                seqnum: params.number(FIELD_SEQNUM)?,
                value: params.number(FIELD_VALUE)?,
            },
        })
    }

    pub fn method(&self) -> Method {
        match self {
            Request::SendValue { .. } => Method::SendValue,
            Request::ProposeSeqnum { .. } => Method::ProposeSeqnum,
            Request::AcceptValue { .. } => Method::AcceptValue,
            Request::Commit { .. } => Method::Commit,
        }
    }

    /// Parameters in wire order.
    pub fn params(&self) -> Vec<(&'static str, String)> {
        match *self {
            Request::SendValue { value } => vec![(FIELD_VALUE, value.to_string())],
            Request::ProposeSeqnum { seqnum } => vec![(FIELD_SEQNUM, seqnum.to_string())],
            Request::AcceptValue { seqnum, value } | Request::Commit { seqnum, value } => {
                vec![(FIELD_SEQNUM, seqnum.to_string()), (FIELD_VALUE, value.to_string())]
            }
        }
    }
}

struct Params<'a, K, V>(&'a [(K, V)]);

impl<K: AsRef<str>, V: AsRef<str>> Params<'_, K, V> {
    fn number<N: FromStr>(&self, name: &'static str) -> Result<N, RequestError> {
        let (_, raw) = self
            .0
            .iter()
            .find(|(key, _)| key.as_ref() == name)
            .ok_or(RequestError::MissingParam(name))?;
        raw.as_ref().trim().parse().map_err(|_| RequestError::InvalidParam {
            name,
            raw: raw.as_ref().to_string(),
        })
    }
}

/// Result of any method, as a flat string map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RpcReply(BTreeMap<String, String>);

impl RpcReply {
    pub fn ok() -> Self {
        Self::with_success(true)
    }

    pub fn failure(err: impl Display) -> Self {
        Self::with_success(false).with(FIELD_ERR, err)
    }

    fn with_success(success: bool) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(FIELD_SUCCESS.to_string(), success.to_string());
        Self(fields)
    }

    pub fn with(mut self, key: &str, value: impl Display) -> Self {
        self.0.insert(key.to_string(), value.to_string());
        self
    }

    pub fn is_success(&self) -> bool {
        self.get(FIELD_SUCCESS) == Some("true")
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn err(&self) -> Option<&str> {
        self.get(FIELD_ERR)
    }

    /// The peer could not be reached, as opposed to answering negatively.
    pub fn is_no_response(&self) -> bool {
        !self.is_success() && self.err() == Some(ERR_NO_RESPONSE)
    }

    fn number<N: FromStr>(&self, key: &str) -> Option<N> {
        self.get(key)?.parse().ok()
    }

    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.0
    }
}

impl From<BTreeMap<String, String>> for RpcReply {
    fn from(fields: BTreeMap<String, String>) -> Self {
        Self(fields)
    }
}

/// An acceptor's answer to `PROPOSE_SEQNUM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseReply {
    /// The proposal may go ahead. `accepted` is a value this acceptor already
    /// accepted and the proposer has to carry forward.
    Agree { accepted: Option<AcceptedPair> },
    Rejected,
}

impl PromiseReply {
    /// `None` if the reply is a failure or not a promise at all.
    pub fn from_reply(reply: &RpcReply) -> Option<Self> {
        if !reply.is_success() {
            return None;
        }
        match reply.get(FIELD_REPLY)? {
            REPLY_AGREE => {
                let accepted = reply
                    .number::<Seqnum>(FIELD_SEQNUM)
                    .zip(reply.number::<Value>(FIELD_VALUE));
                Some(PromiseReply::Agree { accepted })
            }
            REPLY_REJECTED => Some(PromiseReply::Rejected),
            _ => None,
        }
    }
}

impl From<PromiseReply> for RpcReply {
    fn from(promise: PromiseReply) -> Self {
        match promise {
            PromiseReply::Agree { accepted: None } => RpcReply::ok().with(FIELD_REPLY, REPLY_AGREE),
            PromiseReply::Agree {
                accepted: Some((seqnum, value)),
            } => RpcReply::ok()
                .with(FIELD_REPLY, REPLY_AGREE)
                .with(FIELD_SEQNUM, seqnum)
                .with(FIELD_VALUE, value),
            PromiseReply::Rejected => RpcReply::ok().with(FIELD_REPLY, REPLY_REJECTED),
        }
    }
}

/// An acceptor's answer to `ACCEPT_VALUE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptReply {
    Accepted,
    Rejected,
}

impl AcceptReply {
    pub fn from_reply(reply: &RpcReply) -> Option<Self> {
        if !reply.is_success() {
            return None;
        }
        match reply.get(FIELD_REPLY)? {
            REPLY_ACCEPTED => Some(AcceptReply::Accepted),
            REPLY_REJECTED => Some(AcceptReply::Rejected),
            _ => None,
        }
    }
}

impl From<AcceptReply> for RpcReply {
    fn from(accept: AcceptReply) -> Self {
        match accept {
            AcceptReply::Accepted => RpcReply::ok().with(FIELD_REPLY, REPLY_ACCEPTED),
            AcceptReply::Rejected => RpcReply::ok().with(FIELD_REPLY, REPLY_REJECTED),
        }
    }
}
