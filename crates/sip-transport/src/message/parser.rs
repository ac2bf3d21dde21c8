//! Stream framing of SIP messages
//!
//! A [`MessageParser`] pulls complete messages out of an accumulating byte
//! buffer. One parser instance belongs to one connection; it may keep state
//! between calls (start-line hunting after an error on a stream transport).
//!
//! [`TextMessageParser`] frames by the empty line after the headers and the
//! Content-Length header. A malformed header line still yields a message,
//! flagged with a [`ParseError`], so the caller can answer it with an error
//! response built from whatever headers did parse.

use std::fmt;

use bytes::BytesMut;
use nom::branch::alt;
use nom::bytes::complete::{tag, take_till1, take_while_m_n};
use nom::character::complete::{char, space0};
use nom::combinator::{all_consuming, map_res, opt, rest, verify};
use nom::sequence::{preceded, separated_pair, tuple};

use super::grammar::{token, ParseResult};
use super::{headers, Header, SipMessage, StartLine};

const DEFAULT_MAX_HEADER_SIZE: usize = 64 * 1024;
const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// A parse failure and the status code to answer it with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub status_code: u16,
    pub reason: String,
}

impl ParseError {
    pub fn bad_request(reason: impl Into<String>) -> Self {
        Self {
            status_code: 400,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.status_code, self.reason)
    }
}

/// Result of one parse attempt
#[derive(Debug)]
pub enum ParseOutcome {
    /// More bytes are needed; nothing was consumed
    Incomplete,
    /// A message was framed, possibly with a parse error
    Message {
        message: SipMessage,
        error: Option<ParseError>,
    },
    /// Bytes were consumed but no message could be built
    Error(ParseError),
}

/// Frames SIP messages from a byte stream
pub trait MessageParser: Send {
    /// Parse the next message from the front of `buffer`, consuming its bytes
    fn parse(&mut self, buffer: &mut BytesMut) -> ParseOutcome;

    /// After an error on a stream, skip input until something that looks like a start line
    fn set_start_line_hunting(&mut self, hunting: bool);
}

/// Text parser for RFC 3261 messages
#[derive(Debug, Clone)]
pub struct TextMessageParser {
    hunting: bool,
    max_header_size: usize,
    max_message_size: usize,
}

impl Default for TextMessageParser {
    fn default() -> Self {
        Self {
            hunting: false,
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl TextMessageParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Largest accepted message, headers plus body
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Parse a standalone message, such as the body of a failure report
    pub fn parse_bytes(bytes: &[u8]) -> Result<SipMessage, ParseError> {
        let mut buffer = BytesMut::from(bytes);
        match Self::new().parse(&mut buffer) {
            ParseOutcome::Message { message, error: None } => Ok(message),
            ParseOutcome::Message { error: Some(e), .. } | ParseOutcome::Error(e) => Err(e),
            ParseOutcome::Incomplete => Err(ParseError::bad_request("Incomplete message")),
        }
    }

    fn hunt_start_line(&mut self, buffer: &mut BytesMut) -> bool {
        loop {
            let Some(end) = find(buffer, b"\r\n") else {
                return false;
            };
            if looks_like_start_line(&buffer[..end]) {
                self.hunting = false;
                return true;
            }
            let _ = buffer.split_to(end + 2);
        }
    }
}

impl MessageParser for TextMessageParser {
    fn parse(&mut self, buffer: &mut BytesMut) -> ParseOutcome {
        // Keep-alive CRLFs between messages (RFC 5626 3.5.1)
        while buffer.starts_with(b"\r\n") {
            let _ = buffer.split_to(2);
        }
        if buffer.is_empty() {
            return ParseOutcome::Incomplete;
        }
        if self.hunting && !self.hunt_start_line(buffer) {
            return ParseOutcome::Incomplete;
        }

        let Some(header_end) = find(buffer, b"\r\n\r\n") else {
            if buffer.len() > self.max_header_size {
                buffer.clear();
                return ParseOutcome::Error(ParseError::bad_request("Message header too large"));
            }
            return ParseOutcome::Incomplete;
        };

        let head = String::from_utf8_lossy(&buffer[..header_end]).into_owned();
        let mut lines = head.split("\r\n");
        let start = lines.next().unwrap_or_default();
        let Some(start_line) = parse_start_line(start) else {
            let _ = buffer.split_to(header_end + 4);
            return ParseOutcome::Error(ParseError::bad_request(format!("Bad start line [{}]", start)));
        };

        let mut message = SipMessage::from_start_line(start_line);
        let mut error = None;
        for line in lines {
            if line.starts_with(' ') || line.starts_with('\t') {
                if let Some(last) = message.headers.last_mut() {
                    last.value.push(' ');
                    last.value.push_str(line.trim());
                    continue;
                }
            }
            match all_consuming(header_line)(line) {
                Ok((_, (name, value))) => {
                    message.headers.push(Header {
                        name: super::canonical_header_name(name).to_string(),
                        value: value.trim_end().to_string(),
                    });
                }
                Err(_) => {
                    error.get_or_insert_with(|| ParseError::bad_request(format!("Malformed header line [{}]", line)));
                }
            }
        }

        let content_length = match message.header(headers::CONTENT_LENGTH) {
            None => 0,
            Some(v) => match v.trim().parse::<usize>() {
                Ok(len) => len,
                Err(_) => {
                    error.get_or_insert_with(|| ParseError::bad_request("Invalid Content-Length"));
                    0
                }
            },
        };

        let total = match (header_end + 4).checked_add(content_length) {
            Some(total) if total <= self.max_message_size => total,
            _ => {
                buffer.clear();
                return ParseOutcome::Error(ParseError::bad_request(format!(
                    "Content-Length {} exceeds the maximum message size",
                    content_length
                )));
            }
        };
        if buffer.len() < total {
            return ParseOutcome::Incomplete;
        }
        let _ = buffer.split_to(header_end + 4);
        message.body = buffer.split_to(content_length).freeze();

        ParseOutcome::Message { message, error }
    }

    fn set_start_line_hunting(&mut self, hunting: bool) {
        self.hunting = hunting;
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn looks_like_start_line(line: &[u8]) -> bool {
    line.starts_with(b"SIP/2.0 ") || line.ends_with(b" SIP/2.0")
}

/// `SIP-Version SP Status-Code SP Reason-Phrase`
fn status_line(input: &str) -> ParseResult<StartLine> {
    let (input, _) = tag("SIP/2.0 ")(input)?;
    let (input, status) = verify(
        map_res(take_while_m_n(3, 3, |c: char| c.is_ascii_digit()), |code: &str| code.parse::<u16>()),
        |status: &u16| (100..700).contains(status),
    )(input)?;
    let (input, reason) = opt(preceded(char(' '), rest))(input)?;
    Ok((
        input,
        StartLine::Response {
            status,
            reason: reason.unwrap_or_default().to_string(),
        },
    ))
}

/// `Method SP Request-URI SP SIP-Version`
fn request_line(input: &str) -> ParseResult<StartLine> {
    let (input, method) = token(input)?;
    let (input, uri) = preceded(char(' '), take_till1(|c: char| c == ' '))(input)?;
    let (input, _) = tag(" SIP/2.0")(input)?;
    Ok((
        input,
        StartLine::Request {
            method: method.to_string(),
            uri: uri.to_string(),
        },
    ))
}

fn parse_start_line(line: &str) -> Option<StartLine> {
    all_consuming(alt((status_line, request_line)))(line)
        .ok()
        .map(|(_, start_line)| start_line)
}

/// `field-name HCOLON field-value`, folding already undone
fn header_line(input: &str) -> ParseResult<(&str, &str)> {
    separated_pair(token, tuple((space0, char(':'), space0)), rest)(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    const OPTIONS: &[u8] = b"OPTIONS sip:bob@biloxi.com SIP/2.0\r\n\
Via: SIP/2.0/TCP 10.0.0.1:5060;branch=z9hG4bK1\r\n\
Call-ID: abc\r\n\
Content-Length: 4\r\n\r\nbody";

    #[test]
    fn test_parse_complete_message() {
        let mut buf = BytesMut::from(OPTIONS);
        match TextMessageParser::new().parse(&mut buf) {
            ParseOutcome::Message { message, error: None } => {
                assert!(message.is_method("OPTIONS"));
                assert_eq!(&message.body()[..], b"body");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_incomplete_body_consumes_nothing() {
        let mut buf = BytesMut::from(&OPTIONS[..OPTIONS.len() - 2]);
        let before = buf.len();
        assert!(matches!(TextMessageParser::new().parse(&mut buf), ParseOutcome::Incomplete));
        assert_eq!(buf.len(), before);
    }

    #[test]
    fn test_two_messages_in_one_buffer() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(OPTIONS);
        buf.extend_from_slice(b"\r\n\r\n");
        buf.extend_from_slice(OPTIONS);
        let mut parser = TextMessageParser::new();
        assert!(matches!(parser.parse(&mut buf), ParseOutcome::Message { .. }));
        assert!(matches!(parser.parse(&mut buf), ParseOutcome::Message { .. }));
        assert!(matches!(parser.parse(&mut buf), ParseOutcome::Incomplete));
    }

    #[test]
    fn test_malformed_header_yields_partial_message() {
        let raw = b"ACK sip:bob@biloxi.com SIP/2.0\r\nCall-ID: x\r\nthis is not a header\r\n\r\n";
        let mut buf = BytesMut::from(&raw[..]);
        match TextMessageParser::new().parse(&mut buf) {
            ParseOutcome::Message { message, error: Some(e) } => {
                assert!(message.is_method("ACK"));
                assert_eq!(message.call_id(), Some("x"));
                assert_eq!(e.status_code, 400);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_bad_start_line_then_hunting_resyncs() {
        let mut buf = BytesMut::from(&b"GARBAGE\r\n\r\n"[..]);
        let mut parser = TextMessageParser::new();
        assert!(matches!(parser.parse(&mut buf), ParseOutcome::Error(_)));

        parser.set_start_line_hunting(true);
        let mut buf = BytesMut::from(&b"junk line\r\nmore junk\r\n"[..]);
        buf.extend_from_slice(OPTIONS);
        assert!(matches!(parser.parse(&mut buf), ParseOutcome::Message { error: None, .. }));
    }

    #[test]
    fn test_oversized_content_length_is_rejected() {
        for length in ["18446744073709551615", "1000000000"] {
            let raw = format!("OPTIONS sip:bob@biloxi.com SIP/2.0\r\nCall-ID: abc\r\nContent-Length: {}\r\n\r\nbody", length);
            let mut buf = BytesMut::from(raw.as_bytes());
            match TextMessageParser::new().parse(&mut buf) {
                ParseOutcome::Error(e) => assert_eq!(e.status_code, 400),
                other => panic!("unexpected outcome for {}: {:?}", length, other),
            }
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_message_size_limit_is_configurable() {
        let mut buf = BytesMut::from(OPTIONS);
        let mut parser = TextMessageParser::new().with_max_message_size(OPTIONS.len() - 1);
        assert!(matches!(parser.parse(&mut buf), ParseOutcome::Error(_)));

        let mut buf = BytesMut::from(OPTIONS);
        let mut parser = TextMessageParser::new().with_max_message_size(OPTIONS.len());
        assert!(matches!(parser.parse(&mut buf), ParseOutcome::Message { error: None, .. }));
    }

    #[test]
    fn test_start_lines() {
        assert_eq!(
            parse_start_line("SIP/2.0 180 Ringing"),
            Some(StartLine::Response {
                status: 180,
                reason: "Ringing".to_string()
            })
        );
        assert!(parse_start_line("SIP/2.0 2000 OK").is_none());
        assert!(parse_start_line("SIP/2.0 099 Early").is_none());
        assert!(parse_start_line("INVITE sip:bob@biloxi.com SIP/3.0").is_none());
        assert!(parse_start_line("IN VITE sip:bob@biloxi.com SIP/2.0").is_none());
        assert!(matches!(
            parse_start_line("STARTUP sip:10.0.0.1 SIP/2.0"),
            Some(StartLine::Request { ref method, .. }) if method == "STARTUP"
        ));
    }

    #[test]
    fn test_parse_bytes() {
        let msg = TextMessageParser::parse_bytes(OPTIONS).unwrap();
        assert_eq!(msg.call_id(), Some("abc"));
        assert!(TextMessageParser::parse_bytes(b"nonsense\r\n\r\n").is_err());
    }
}
