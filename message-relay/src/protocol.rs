//! Newline-delimited JSON wire format shared by the relay server and the
//! terminal client.
//!
//! Every frame is one JSON object terminated by `\n` (a trailing `\r` is
//! tolerated). Requests are tagged by their `action` field; responses carry a
//! numeric `response` code. A relayed message is forwarded as the sender's
//! `message` request frame.

use std::io;

use bytes::BytesMut;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Error text sent when a username is held by another live connection.
pub const NAME_RESERVED: &str = "name already reserved";
/// Error text for malformed, unknown or unauthorised requests.
pub const BAD_REQUEST: &str = "Bad request";
/// Error text sent to every live connection during shutdown.
pub const SHUTTING_DOWN: &str = "server shutting down";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Account {
    pub account_name: String,
}

/// A client request. Each variant's fields are mandatory on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Request {
    Presence {
        time: f64,
        user: Account,
    },
    #[serde(rename = "message")]
    Send {
        time: f64,
        #[serde(rename = "from")]
        sender: String,
        #[serde(rename = "to")]
        destination: String,
        #[serde(rename = "mess_text")]
        text: String,
    },
    Exit {
        time: f64,
        account_name: String,
    },
    GetContacts {
        time: f64,
        user: String,
    },
    #[serde(rename = "add")]
    AddContact {
        time: f64,
        user: String,
        account_name: String,
    },
    #[serde(rename = "remove")]
    RemoveContact {
        time: f64,
        user: String,
        account_name: String,
    },
    #[serde(rename = "get_users")]
    UsersRequest {
        time: f64,
        account_name: String,
    },
}

impl Request {
    pub fn presence(account_name: &str) -> Self {
        Self::Presence {
            time: now(),
            user: Account {
                account_name: account_name.to_string(),
            },
        }
    }

    pub fn send(sender: &str, destination: &str, text: &str) -> Self {
        Self::Send {
            time: now(),
            sender: sender.to_string(),
            destination: destination.to_string(),
            text: text.to_string(),
        }
    }

    pub fn exit(account_name: &str) -> Self {
        Self::Exit {
            time: now(),
            account_name: account_name.to_string(),
        }
    }

    pub fn get_contacts(user: &str) -> Self {
        Self::GetContacts {
            time: now(),
            user: user.to_string(),
        }
    }

    pub fn add_contact(user: &str, contact: &str) -> Self {
        Self::AddContact {
            time: now(),
            user: user.to_string(),
            account_name: contact.to_string(),
        }
    }

    pub fn remove_contact(user: &str, contact: &str) -> Self {
        Self::RemoveContact {
            time: now(),
            user: user.to_string(),
            account_name: contact.to_string(),
        }
    }

    pub fn users_request(account_name: &str) -> Self {
        Self::UsersRequest {
            time: now(),
            account_name: account_name.to_string(),
        }
    }

    /// Wire name of the request's action, for logging.
    pub fn action(&self) -> &'static str {
        match self {
            Self::Presence { .. } => "presence",
            Self::Send { .. } => "message",
            Self::Exit { .. } => "exit",
            Self::GetContacts { .. } => "get_contacts",
            Self::AddContact { .. } => "add",
            Self::RemoveContact { .. } => "remove",
            Self::UsersRequest { .. } => "get_users",
        }
    }

    fn validate(&self) -> Result<(), DecodeError> {
        let fields: Vec<(&'static str, &str)> = match self {
            Self::Presence { user, .. } => vec![("account_name", user.account_name.as_str())],
            Self::Send {
                sender,
                destination,
                ..
            } => vec![("from", sender.as_str()), ("to", destination.as_str())],
            Self::Exit { account_name, .. } | Self::UsersRequest { account_name, .. } => {
                vec![("account_name", account_name.as_str())]
            }
            Self::GetContacts { user, .. } => vec![("user", user.as_str())],
            Self::AddContact {
                user, account_name, ..
            }
            | Self::RemoveContact {
                user, account_name, ..
            } => vec![("user", user.as_str()), ("account_name", account_name.as_str())],
        };

        match fields.into_iter().find(|(_, value)| value.trim().is_empty()) {
            Some((field, _)) => Err(DecodeError::EmptyField(field)),
            None => Ok(()),
        }
    }
}

/// Response status codes understood by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum Status {
    Ok,
    Accepted,
    BadRequest,
}

impl From<Status> for u16 {
    fn from(status: Status) -> Self {
        match status {
            Status::Ok => 200,
            Status::Accepted => 202,
            Status::BadRequest => 400,
        }
    }
}

impl TryFrom<u16> for Status {
    type Error = String;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        match code {
            200 => Ok(Self::Ok),
            202 => Ok(Self::Accepted),
            400 => Ok(Self::BadRequest),
            other => Err(format!("unknown response code {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Response {
    #[serde(rename = "response")]
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "data_list", default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Vec<String>>,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            status: Status::Ok,
            error: None,
            payload: None,
        }
    }

    pub fn with_payload(payload: Vec<String>) -> Self {
        Self {
            status: Status::Accepted,
            error: None,
            payload: Some(payload),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Status::BadRequest,
            error: Some(message.into()),
            payload: None,
        }
    }

    pub fn bad_request() -> Self {
        Self::error(BAD_REQUEST)
    }
}

/// Anything the server may write to a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ServerFrame {
    Response(Response),
    Relay(Request),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame is not valid JSON: {0}")]
    Syntax(#[source] serde_json::Error),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("frame exceeds {limit} bytes")]
    FrameTooLong { limit: usize },
    #[error("malformed request: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("field `{0}` must not be empty")]
    EmptyField(&'static str),
}

impl DecodeError {
    /// Transport-level failures end the connection; the rest are answered
    /// with a 400 response.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Syntax(_) | Self::NotAnObject | Self::FrameTooLong { .. }
        )
    }
}

/// Decodes and validates one frame (without its line terminator).
pub fn decode_request(frame: &[u8]) -> Result<Request, DecodeError> {
    let value: serde_json::Value = serde_json::from_slice(frame).map_err(DecodeError::Syntax)?;
    if !value.is_object() {
        return Err(DecodeError::NotAnObject);
    }

    let request: Request = serde_json::from_value(value).map_err(DecodeError::Malformed)?;
    request.validate()?;
    Ok(request)
}

/// Encodes a message as a single newline-terminated frame.
pub fn encode_frame<T: Serialize>(message: &T) -> serde_json::Result<Vec<u8>> {
    let mut encoded = serde_json::to_vec(message)?;
    encoded.push(b'\n');
    Ok(encoded)
}

/// Splits the next complete, non-empty frame off the front of `buffer`.
///
/// Returns `Ok(None)` when only a partial frame is buffered.
pub fn take_frame(buffer: &mut BytesMut, limit: usize) -> Result<Option<BytesMut>, DecodeError> {
    loop {
        let Some(end) = buffer.iter().position(|&byte| byte == b'\n') else {
            if buffer.len() > limit {
                return Err(DecodeError::FrameTooLong { limit });
            }
            return Ok(None);
        };
        if end > limit {
            return Err(DecodeError::FrameTooLong { limit });
        }

        let mut frame = buffer.split_to(end + 1);
        let trimmed = frame
            .iter()
            .rposition(|&byte| !LINE_ENDINGS.contains(&(byte as char)))
            .map_or(0, |last| last + 1);
        frame.truncate(trimmed);

        if !frame.is_empty() {
            return Ok(Some(frame));
        }
    }
}

pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }

        let parsed = serde_json::from_str(trimmed).map_err(to_io_error)?;
        return Ok(Some(parsed));
    }
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let encoded = encode_frame(message).map_err(to_io_error)?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

/// Seconds since the Unix epoch, with microsecond precision.
fn now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
