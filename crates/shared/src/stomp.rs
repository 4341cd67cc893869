//! Minimal STOMP 1.2 text-frame codec.
//!
//! Frames look like:
//!
//! ```text
//! COMMAND
//! header1:value1
//! header2:value2
//!
//! body^@
//! ```
//!
//! A lone end-of-line is a heart-beat and decodes to `None`.

use std::fmt;

use crate::error::FrameError;

pub const HEADER_DESTINATION: &str = "destination";
pub const HEADER_SUBSCRIPTION: &str = "subscription";
pub const HEADER_ID: &str = "id";
pub const HEADER_AUTHORIZATION: &str = "Authorization";
pub const HEADER_CONTENT_TYPE: &str = "content-type";
pub const HEADER_CONTENT_LENGTH: &str = "content-length";
pub const HEADER_MESSAGE: &str = "message";

pub const STOMP_VERSION: &str = "1.2";
pub const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Message,
    Receipt,
    Error,
    Disconnect,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Connected => "CONNECTED",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
            Command::Disconnect => "DISCONNECT",
        }
    }

    fn parse(s: &str) -> Result<Self, FrameError> {
        Ok(match s {
            // STOMP is accepted as an alias of CONNECT
            "CONNECT" | "STOMP" => Command::Connect,
            "CONNECTED" => Command::Connected,
            "SEND" => Command::Send,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            "DISCONNECT" => Command::Disconnect,
            other => return Err(FrameError::UnknownCommand(other.to_string())),
        })
    }

    /// CONNECT and CONNECTED frames carry headers verbatim.
    fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
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
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Look up a header. When a header repeats, the first occurrence wins.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Handshake frame opening a session, optionally authenticated.
    pub fn connect(host: &str, bearer: Option<&str>) -> Self {
        let frame = Frame::new(Command::Connect)
            .header("accept-version", STOMP_VERSION)
            .header("host", host)
            .header("heart-beat", "0,0");
        match bearer {
            Some(token) => frame.header(HEADER_AUTHORIZATION, format!("Bearer {}", token)),
            None => frame,
        }
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        Frame::new(Command::Subscribe)
            .header(HEADER_ID, id)
            .header(HEADER_DESTINATION, destination)
            .header("ack", "auto")
    }

    pub fn unsubscribe(id: &str) -> Self {
        Frame::new(Command::Unsubscribe).header(HEADER_ID, id)
    }

    /// A SEND frame carrying a JSON body.
    pub fn send(destination: &str, bearer: Option<&str>, json: String) -> Self {
        let frame = Frame::new(Command::Send)
            .header(HEADER_DESTINATION, destination)
            .header(HEADER_CONTENT_TYPE, JSON_CONTENT_TYPE);
        let frame = match bearer {
            Some(token) => frame.header(HEADER_AUTHORIZATION, format!("Bearer {}", token)),
            None => frame,
        };
        frame.body(json)
    }

    pub fn disconnect() -> Self {
        Frame::new(Command::Disconnect)
    }

    /// Serialize to the text wire form, including the trailing NUL.
    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(64 + self.body.len());
        out.push_str(self.command.as_str());
        out.push('\n');
        for (k, v) in &self.headers {
            if k == HEADER_CONTENT_LENGTH {
                continue;
            }
            if escape {
                out.push_str(&escape_header(k));
                out.push(':');
                out.push_str(&escape_header(v));
            } else {
                out.push_str(k);
                out.push(':');
                out.push_str(v);
            }
            out.push('\n');
        }
        if !self.body.is_empty() {
            out.push_str(HEADER_CONTENT_LENGTH);
            out.push(':');
            out.push_str(&self.body.len().to_string());
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Parse one frame from its text wire form.
    ///
    /// Returns `Ok(None)` for heart-beats.
    pub fn decode(raw: &str) -> Result<Option<Frame>, FrameError> {
        let trimmed = raw.trim_start_matches(['\r', '\n']);
        if trimmed.is_empty() {
            return if raw.is_empty() {
                Err(FrameError::Empty)
            } else {
                Ok(None)
            };
        }

        let (head, rest) = split_head(trimmed).ok_or(FrameError::MissingBody)?;
        let mut lines = head.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l));

        let command = Command::parse(lines.next().unwrap_or_default())?;
        let escape = command.escapes_headers();

        let mut headers = Vec::new();
        for line in lines {
            let (k, v) = line
                .split_once(':')
                .ok_or_else(|| FrameError::MalformedHeader(line.to_string()))?;
            if escape {
                headers.push((unescape_header(k)?, unescape_header(v)?));
            } else {
                headers.push((k.to_string(), v.to_string()));
            }
        }

        let content_length = headers
            .iter()
            .find(|(k, _)| k == HEADER_CONTENT_LENGTH)
            .and_then(|(_, v)| v.parse::<usize>().ok());

        let body = match content_length {
            Some(len) if rest.len() > len && rest.as_bytes()[len] == 0 && rest.is_char_boundary(len) => {
                rest[..len].to_string()
            }
            _ => {
                let end = rest.find('\0').ok_or(FrameError::MissingTerminator)?;
                rest[..end].to_string()
            }
        };

        Ok(Some(Frame {
            command,
            headers,
            body,
        }))
    }
}

/// Split at the first blank line, accepting either `\n\n` or `\r\n\r\n`.
fn split_head(s: &str) -> Option<(&str, &str)> {
    let lf = s.find("\n\n").map(|i| (i, 2));
    let crlf = s.find("\r\n\r\n").map(|i| (i, 4));
    let (idx, sep) = match (lf, crlf) {
        (Some(a), Some(b)) => {
            if a.0 <= b.0 {
                a
            } else {
                b
            }
        }
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => return None,
    };
    Some((&s[..idx], &s[idx + sep..]))
}

fn escape_header(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            c => out.push(c),
        }
    }
    out
}

fn unescape_header(s: &str) -> Result<String, FrameError> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            _ => return Err(FrameError::InvalidEscape(s.to_string())),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_frame_carries_bearer_and_length() {
        let frame = Frame::send("/app/ping", Some("tok"), r#"{"a":1}"#.to_string());
        let wire = frame.encode();
        assert!(wire.starts_with("SEND\n"));
        assert!(wire.contains("Authorization:Bearer tok\n"));
        assert!(wire.contains("content-length:7\n"));
        assert!(wire.ends_with("{\"a\":1}\0"));
    }

    #[test]
    fn decodes_message_frame() {
        let raw = "MESSAGE\ndestination:/group/3\nsubscription:sub-1\nmessage-id:9\n\n{\"id\":1}\0";
        let frame = Frame::decode(raw).unwrap().unwrap();
        assert_eq!(frame.command, Command::Message);
        assert_eq!(frame.get(HEADER_SUBSCRIPTION), Some("sub-1"));
        assert_eq!(frame.get(HEADER_DESTINATION), Some("/group/3"));
        assert_eq!(frame.body, "{\"id\":1}");
    }

    #[test]
    fn header_values_are_escaped_outside_handshake() {
        let frame = Frame::new(Command::Send).header("destination", "a:b\nc");
        let wire = frame.encode();
        assert!(wire.contains("destination:a\\cb\\nc\n"));

        let back = Frame::decode(&wire).unwrap().unwrap();
        assert_eq!(back.get("destination"), Some("a:b\nc"));
    }

    #[test]
    fn connect_headers_are_verbatim() {
        let wire = Frame::connect("chat.example", Some("a:b")).encode();
        assert!(wire.contains("Authorization:Bearer a:b\n"));
        let back = Frame::decode(&wire).unwrap().unwrap();
        assert_eq!(back.get(HEADER_AUTHORIZATION), Some("Bearer a:b"));
    }

    #[test]
    fn heartbeat_decodes_to_none() {
        assert_eq!(Frame::decode("\n").unwrap(), None);
        assert_eq!(Frame::decode("\r\n").unwrap(), None);
        assert_eq!(Frame::decode(""), Err(FrameError::Empty));
    }

    #[test]
    fn first_repeated_header_wins() {
        let raw = "MESSAGE\nsubscription:a\nsubscription:b\n\n\0";
        let frame = Frame::decode(raw).unwrap().unwrap();
        assert_eq!(frame.get(HEADER_SUBSCRIPTION), Some("a"));
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            Frame::decode("HELLO\n\n\0"),
            Err(FrameError::UnknownCommand(_))
        ));
        assert!(matches!(
            Frame::decode("MESSAGE\nnocolon\n\n\0"),
            Err(FrameError::MalformedHeader(_))
        ));
        assert_eq!(
            Frame::decode("MESSAGE\nid:1\n\nbody"),
            Err(FrameError::MissingTerminator)
        );
        assert!(matches!(
            Frame::decode("MESSAGE\nid:\\x\n\n\0"),
            Err(FrameError::InvalidEscape(_))
        ));
    }

    #[test]
    fn body_may_contain_nul_when_length_given() {
        let raw = "MESSAGE\ncontent-length:3\n\na\0b\0";
        let frame = Frame::decode(raw).unwrap().unwrap();
        assert_eq!(frame.body, "a\0b");
    }
}
