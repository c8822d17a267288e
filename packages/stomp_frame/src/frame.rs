//! Frame model, builders, and the encode/decode pair.

use std::fmt::Write as _;

use tracing::trace;

use crate::command::Command;
use crate::error::FrameError;

/// Maximum accepted text size for one websocket message (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// A single STOMP frame. Header order is preserved; on repeated headers the
/// first occurrence wins, as STOMP 1.2 requires.
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

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Look up a header value by name (first occurrence).
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// CONNECT frame for a STOMP 1.2 broker. Heart-beating is disabled.
    pub fn connect(host: &str) -> Self {
        Self::new(Command::Connect)
            .with_header("accept-version", "1.2")
            .with_header("host", host)
            .with_header("heart-beat", "0,0")
    }

    /// SEND frame carrying a JSON body.
    pub fn send(destination: &str, body: impl Into<String>) -> Self {
        Self::new(Command::Send)
            .with_header("destination", destination)
            .with_header("content-type", "application/json")
            .with_body(body)
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        Self::new(Command::Subscribe)
            .with_header("id", id)
            .with_header("destination", destination)
            .with_header("ack", "auto")
    }

    pub fn unsubscribe(id: &str) -> Self {
        Self::new(Command::Unsubscribe).with_header("id", id)
    }

    pub fn disconnect() -> Self {
        Self::new(Command::Disconnect)
    }

    /// Serialize to wire text, adding `content-length` for non-empty bodies.
    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(64 + self.body.len());
        out.push_str(self.command.as_str());
        out.push('\n');

        for (name, value) in &self.headers {
            if escape {
                out.push_str(&escape_header(name));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }

        if !self.body.is_empty() && self.get("content-length").is_none() {
            // Writing to a String cannot fail.
            let _ = writeln!(out, "content-length:{}", self.body.len());
        }

        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }
}

/// True if `text` is nothing but end-of-line heart-beats.
pub fn is_heartbeat(text: &str) -> bool {
    !text.is_empty() && text.bytes().all(|b| b == b'\n' || b == b'\r')
}

/// Decode the first frame in `text`.
pub fn decode(text: &str) -> Result<Frame, FrameError> {
    decode_all(text)?.into_iter().next().ok_or(FrameError::Empty)
}

/// Decode every frame in `text`, skipping heart-beat EOLs between frames.
pub fn decode_all(text: &str) -> Result<Vec<Frame>, FrameError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge {
            size: text.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let mut frames = Vec::new();
    let mut rest = text;
    loop {
        rest = rest.trim_start_matches(['\r', '\n']);
        if rest.is_empty() {
            break;
        }
        let (frame, consumed) = parse_frame(rest)?;
        trace!(command = %frame.command, consumed, "decoded frame");
        frames.push(frame);
        rest = &rest[consumed..];
    }
    Ok(frames)
}

/// Parse one frame from the start of `input`; returns the frame and the
/// number of bytes consumed including the NUL terminator.
fn parse_frame(input: &str) -> Result<(Frame, usize), FrameError> {
    let (command_line, mut pos) = next_line(input, 0).ok_or(FrameError::Unterminated)?;
    let command: Command = command_line.parse()?;
    let escape = command.escapes_headers();

    let mut headers = Vec::new();
    loop {
        let (line, next) = next_line(input, pos).ok_or(FrameError::Unterminated)?;
        pos = next;
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| FrameError::MalformedHeader(line.to_string()))?;
        if escape {
            headers.push((unescape_header(name)?, unescape_header(value)?));
        } else {
            headers.push((name.to_string(), value.to_string()));
        }
    }

    let content_length = headers
        .iter()
        .find(|(k, _)| k == "content-length")
        .map(|(_, v)| {
            v.trim()
                .parse::<usize>()
                .map_err(|_| FrameError::InvalidContentLength(v.clone()))
        })
        .transpose()?;

    let body_end = match content_length {
        Some(len) => {
            let end = pos
                .checked_add(len)
                .ok_or_else(|| FrameError::InvalidContentLength(len.to_string()))?;
            if input.as_bytes().get(end) != Some(&0) {
                return Err(if end >= input.len() {
                    FrameError::Unterminated
                } else {
                    FrameError::InvalidContentLength(len.to_string())
                });
            }
            end
        }
        None => pos + input[pos..].find('\0').ok_or(FrameError::Unterminated)?,
    };

    let body = input
        .get(pos..body_end)
        .ok_or_else(|| FrameError::InvalidContentLength((body_end - pos).to_string()))?
        .to_string();

    Ok((
        Frame {
            command,
            headers,
            body,
        },
        body_end + 1,
    ))
}

/// Return the line starting at `start` (without its EOL) and the offset just past it.
fn next_line(input: &str, start: usize) -> Option<(&str, usize)> {
    let rel = input.get(start..)?.find('\n')?;
    let line = &input[start..start + rel];
    Some((line.strip_suffix('\r').unwrap_or(line), start + rel + 1))
}

fn escape_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(raw: &str) -> Result<String, FrameError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('c') => out.push(':'),
            _ => return Err(FrameError::InvalidEscape(raw.to_string())),
        }
    }
    Ok(out)
}
