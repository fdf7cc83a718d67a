//! STOMP 1.2 frames carried in WebSocket text messages.
//!
//! A frame is a command line, `name:value` header lines, a blank line, the
//! body and a NUL terminator. A bare EOL between frames is a heart-beat. One
//! WebSocket message may carry several frames.
//!
//! Header names and values are escaped (`\\`, `\n`, `\r`, `\c`) on every
//! frame except `CONNECT` and `CONNECTED`.

use std::fmt;
use std::time::Duration;

use crate::error::LinkError;

/// STOMP frame command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Client handshake.
    Connect,
    /// Broker handshake acknowledgement.
    Connected,
    /// Publish to a destination.
    Send,
    /// Open a subscription.
    Subscribe,
    /// Close a subscription.
    Unsubscribe,
    /// Graceful client shutdown.
    Disconnect,
    /// Message routed to a subscription.
    Message,
    /// Receipt for a frame that asked for one.
    Receipt,
    /// Broker-side error; the broker closes the session after sending it.
    Error,
}

impl Command {
    /// Returns the wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Connected => "CONNECTED",
            Self::Send => "SEND",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Disconnect => "DISCONNECT",
            Self::Message => "MESSAGE",
            Self::Receipt => "RECEIPT",
            Self::Error => "ERROR",
        }
    }

    /// Parses a wire name.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "CONNECT" | "STOMP" => Self::Connect,
            "CONNECTED" => Self::Connected,
            "SEND" => Self::Send,
            "SUBSCRIBE" => Self::Subscribe,
            "UNSUBSCRIBE" => Self::Unsubscribe,
            "DISCONNECT" => Self::Disconnect,
            "MESSAGE" => Self::Message,
            "RECEIPT" => Self::Receipt,
            "ERROR" => Self::Error,
            _ => return None,
        })
    }

    const fn escapes_headers(self) -> bool {
        !matches!(self, Self::Connect | Self::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single STOMP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame command.
    pub command: Command,
    /// Headers in wire order. Repeated names are allowed; the first wins.
    pub headers: Vec<(String, String)>,
    /// Frame body.
    pub body: String,
}

/// Unit decoded from a WebSocket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A complete frame.
    Frame(Frame),
    /// An EOL heart-beat.
    Heartbeat,
}

impl Frame {
    /// Creates a frame with no headers and an empty body.
    #[must_use]
    pub const fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    /// Appends a header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Returns the first value of header `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Parses the `heart-beat` header as `(outgoing, incoming)` intervals.
    #[must_use]
    pub fn heart_beat(&self) -> Option<(Duration, Duration)> {
        let (out, inc) = self.get("heart-beat")?.split_once(',')?;
        Some((
            Duration::from_millis(out.trim().parse().ok()?),
            Duration::from_millis(inc.trim().parse().ok()?),
        ))
    }

    /// Builds a `CONNECT` frame.
    #[must_use]
    pub fn connect<'a>(
        host: &str,
        heartbeat: (Duration, Duration),
        extra: impl IntoIterator<Item = (&'a String, &'a String)>,
    ) -> Self {
        let mut frame = Self::new(Command::Connect)
            .header("accept-version", "1.2,1.1,1.0")
            .header("host", host)
            .header(
                "heart-beat",
                format!("{},{}", heartbeat.0.as_millis(), heartbeat.1.as_millis()),
            );
        for (name, value) in extra {
            frame = frame.header(name.clone(), value.clone());
        }
        frame
    }

    /// Builds a `SUBSCRIBE` frame.
    #[must_use]
    pub fn subscribe(id: &str, destination: &str) -> Self {
        Self::new(Command::Subscribe)
            .header("id", id)
            .header("destination", destination)
            .header("ack", "auto")
    }

    /// Builds an `UNSUBSCRIBE` frame.
    #[must_use]
    pub fn unsubscribe(id: &str) -> Self {
        Self::new(Command::Unsubscribe).header("id", id)
    }

    /// Builds a `SEND` frame. Caller headers are added after `destination`
    /// and `content-type`, so they cannot override them.
    #[must_use]
    pub fn send<'a>(
        destination: &str,
        body: String,
        content_type: &str,
        extra: impl IntoIterator<Item = (&'a String, &'a String)>,
    ) -> Self {
        let mut frame = Self::new(Command::Send)
            .header("destination", destination)
            .header("content-type", content_type);
        for (name, value) in extra {
            frame = frame.header(name.clone(), value.clone());
        }
        frame.with_body(body)
    }

    /// Encodes the frame for the wire.
    #[must_use]
    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(self.body.len() + 64);
        out.push_str(self.command.as_str());
        out.push('\n');
        for (name, value) in &self.headers {
            push_header_part(&mut out, name, escape);
            out.push(':');
            push_header_part(&mut out, value, escape);
            out.push('\n');
        }
        if !self.body.is_empty() && self.get("content-length").is_none() {
            out.push_str("content-length:");
            out.push_str(&self.body.len().to_string());
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }
}

/// The EOL heart-beat sent on idle sessions.
pub const HEARTBEAT: &str = "\n";

/// Decodes every frame and heart-beat in one WebSocket text message.
///
/// # Errors
///
/// Returns [`LinkError::Protocol`] on an unknown command, a malformed
/// header, a bad escape sequence, or a missing NUL terminator.
pub fn decode(text: &str) -> Result<Vec<Inbound>, LinkError> {
    let mut out = Vec::new();
    let mut rest = text;
    loop {
        let trimmed = rest.trim_start_matches(['\r', '\n']);
        if trimmed.len() != rest.len() {
            out.push(Inbound::Heartbeat);
        }
        rest = trimmed;
        if rest.is_empty() {
            break;
        }
        let (frame, remaining) = decode_one(rest)?;
        out.push(Inbound::Frame(frame));
        rest = remaining;
    }
    Ok(out)
}

fn decode_one(text: &str) -> Result<(Frame, &str), LinkError> {
    let (command_line, mut rest) = split_line(text)
        .ok_or_else(|| LinkError::Protocol("frame has no command line".to_string()))?;
    let command = Command::parse(command_line)
        .ok_or_else(|| LinkError::Protocol(format!("unknown command {command_line:?}")))?;
    let unescape = command.escapes_headers();

    let mut frame = Frame::new(command);
    loop {
        let (line, after) = split_line(rest)
            .ok_or_else(|| LinkError::Protocol("unterminated header block".to_string()))?;
        rest = after;
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| LinkError::Protocol(format!("malformed header {line:?}")))?;
        let (name, value) = if unescape {
            (unescape_header(name)?, unescape_header(value)?)
        } else {
            (name.to_string(), value.to_string())
        };
        frame.headers.push((name, value));
    }

    let length = frame
        .get("content-length")
        .map(|v| {
            v.trim()
                .parse::<usize>()
                .map_err(|_| LinkError::Protocol(format!("bad content-length {v:?}")))
        })
        .transpose()?;

    let (body, after_body) = match length {
        Some(len) => rest
            .split_at_checked(len)
            .ok_or_else(|| LinkError::Protocol("content-length exceeds frame".to_string()))?,
        None => rest.split_at(rest.find('\0').unwrap_or(rest.len())),
    };
    let remaining = after_body
        .strip_prefix('\0')
        .ok_or_else(|| LinkError::Protocol("frame is not NUL terminated".to_string()))?;
    frame.body = body.to_string();
    Ok((frame, remaining))
}

/// Splits off one line, accepting `\n` or `\r\n`.
fn split_line(text: &str) -> Option<(&str, &str)> {
    let (line, rest) = text.split_once('\n')?;
    Some((line.strip_suffix('\r').unwrap_or(line), rest))
}

fn push_header_part(out: &mut String, part: &str, escape: bool) {
    if !escape {
        out.push_str(part);
        return;
    }
    for ch in part.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
}

fn unescape_header(raw: &str) -> Result<String, LinkError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            other => {
                return Err(LinkError::Protocol(format!(
                    "invalid header escape \\{}",
                    other.map(String::from).unwrap_or_default()
                )));
            }
        }
    }
    Ok(out)
}

/// Negotiates effective heart-beat intervals from the client's
/// `(outgoing, incoming)` request and the broker's `(outgoing, incoming)`
/// answer. Returns `(send_every, expect_every)`; zero disables a direction.
#[must_use]
pub fn negotiate_heartbeat(
    client: (Duration, Duration),
    server: (Duration, Duration),
) -> (Duration, Duration) {
    let pick = |ours: Duration, theirs: Duration| {
        if ours.is_zero() || theirs.is_zero() {
            Duration::ZERO
        } else {
            ours.max(theirs)
        }
    };
    (pick(client.0, server.1), pick(client.1, server.0))
}
