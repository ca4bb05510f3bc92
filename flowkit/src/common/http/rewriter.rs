// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use bytes::BytesMut;

/// Longest message head accepted before the stream is treated as malformed
pub const DEFAULT_MAX_HEAD_LENGTH: usize = 16 * 1024;
const MAX_HEADERS: usize = 64;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MessageKind {
  Request,
  Response,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Version {
  Http10,
  Http11,
}

impl Version {
  fn from_minor(minor: u8) -> Self {
    match minor {
      0 => Version::Http10,
      _ => Version::Http11,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Version::Http10 => "HTTP/1.0",
      Version::Http11 => "HTTP/1.1",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
  pub name: String,
  pub value: Vec<u8>,
  /// The line this header was parsed from, without its line ending
  raw: Option<Vec<u8>>,
}

impl Header {
  pub fn new(name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
    Self {
      name: name.into(),
      value: value.into(),
      raw: None,
    }
  }

  /// The parsed line, as long as it still spells this header's name and value
  fn original_line(&self) -> Option<&[u8]> {
    let raw = self.raw.as_deref()?;
    let (name, rest) = raw.split_at(raw.iter().position(|b| *b == b':')?);
    let unchanged = name == self.name.as_bytes()
      && trim_whitespace(&rest[1..]) == trim_whitespace(&self.value);
    unchanged.then_some(raw)
  }

  fn write_to(&self, out: &mut Vec<u8>) {
    match self.original_line() {
      Some(line) => out.extend_from_slice(line),
      None => {
        out.extend_from_slice(self.name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(&self.value);
      }
    }
    out.extend_from_slice(b"\r\n");
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
  Request { method: String, target: String },
  Response { status: u16, reason: String },
}

/// A parsed message head which can be edited and serialized back onto the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHead {
  pub start: StartLine,
  pub version: Version,
  pub headers: Vec<Header>,
}

impl MessageHead {
  pub fn method(&self) -> Option<&str> {
    match &self.start {
      StartLine::Request { method, .. } => Some(method),
      StartLine::Response { .. } => None,
    }
  }

  pub fn target(&self) -> Option<&str> {
    match &self.start {
      StartLine::Request { target, .. } => Some(target),
      StartLine::Response { .. } => None,
    }
  }

  pub fn set_target(&mut self, new_target: impl Into<String>) {
    if let StartLine::Request { target, .. } = &mut self.start {
      *target = new_target.into();
    }
  }

  /// The first value of a header, matched case-insensitively
  pub fn header(&self, name: &str) -> Option<&[u8]> {
    self
      .headers
      .iter()
      .find(|header| header.name.eq_ignore_ascii_case(name))
      .map(|header| header.value.as_slice())
  }

  pub fn remove_headers(&mut self, mut matches: impl FnMut(&str) -> bool) {
    self.headers.retain(|header| !matches(&header.name));
  }

  /// Whether the message switches the connection away from HTTP once its head is complete
  pub fn is_upgrade(&self) -> bool {
    match &self.start {
      StartLine::Request { method, .. } if method == "CONNECT" => true,
      StartLine::Request { .. } => {
        self.header("upgrade").is_some()
          && self
            .header("connection")
            .map(|value| contains_token(value, "upgrade"))
            .unwrap_or(false)
      }
      StartLine::Response { status, .. } => *status == 101,
    }
  }

  pub fn serialize(&self) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    match &self.start {
      StartLine::Request { method, target } => {
        out.extend_from_slice(method.as_bytes());
        out.push(b' ');
        out.extend_from_slice(target.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.version.as_str().as_bytes());
      }
      StartLine::Response { status, reason } => {
        out.extend_from_slice(self.version.as_str().as_bytes());
        out.extend_from_slice(format!(" {} ", status).as_bytes());
        out.extend_from_slice(reason.as_bytes());
      }
    }
    out.extend_from_slice(b"\r\n");
    for header in &self.headers {
      header.write_to(&mut out);
    }
    out.extend_from_slice(b"\r\n");
    out
  }
}

fn contains_token(value: &[u8], token: &str) -> bool {
  value
    .split(|b| *b == b',')
    .any(|item| trim_whitespace(item).eq_ignore_ascii_case(token.as_bytes()))
}

fn trim_whitespace(mut value: &[u8]) -> &[u8] {
  while let [first, rest @ ..] = value {
    if !first.is_ascii_whitespace() {
      break;
    }
    value = rest;
  }
  while let [rest @ .., last] = value {
    if !last.is_ascii_whitespace() {
      break;
    }
    value = rest;
  }
  value
}

/// Receives parse events; returning `false` from any of them aborts parsing
pub trait HttpMessageHandler {
  fn on_method(&mut self, _method: &str) -> bool {
    true
  }

  fn on_url(&mut self, _url: &str) -> bool {
    true
  }

  fn on_version(&mut self, _version: Version) -> bool {
    true
  }

  fn on_status(&mut self, _status: u16, _reason: &str) -> bool {
    true
  }

  fn on_header_pair(&mut self, _name: &str, _value: &[u8]) -> bool {
    true
  }

  fn on_header_complete(&mut self) -> bool {
    true
  }

  /// `buffer_offset` is where the body starts within the chunk passed to the completing feed
  fn on_message_complete(&mut self, _buffer_offset: usize, _upgrade: bool) -> bool {
    true
  }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
  #[error("Malformed HTTP message: {0}")]
  Malformed(httparse::Error),
  #[error("HTTP message head exceeds {limit} bytes")]
  TooLarge { limit: usize },
  #[error("Parsing was aborted by the message handler")]
  Aborted,
  #[error("A complete message head was already parsed")]
  AlreadyComplete,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FeedStatus {
  /// More bytes are needed to complete the head
  Partial,
  /// The head completed; bytes of the last chunk from `buffer_offset` on follow it
  Complete { buffer_offset: usize },
}

#[derive(Debug, Default, Clone, Copy)]
struct Progress {
  method: bool,
  url: bool,
  version: bool,
}

#[derive(Debug, Clone)]
enum ParserState {
  Parsing,
  Complete,
  Failed(ParseError),
}

/// Parses one message head fed in arbitrarily split chunks.
///
/// Request-line events fire as soon as their token is complete, so a handler
/// can inspect the method before the rest of the head arrives. Errors are sticky:
/// once a feed fails, every later feed fails the same way.
#[derive(Debug)]
pub struct HttpMessageStreamRewriter {
  kind: MessageKind,
  max_head_length: usize,
  pending: BytesMut,
  progress: Progress,
  state: ParserState,
  head: Option<MessageHead>,
}

impl HttpMessageStreamRewriter {
  pub fn new(kind: MessageKind) -> Self {
    Self {
      kind,
      max_head_length: DEFAULT_MAX_HEAD_LENGTH,
      pending: BytesMut::new(),
      progress: Progress::default(),
      state: ParserState::Parsing,
      head: None,
    }
  }

  pub fn requests() -> Self {
    Self::new(MessageKind::Request)
  }

  pub fn responses() -> Self {
    Self::new(MessageKind::Response)
  }

  pub fn with_max_head_length(mut self, max_head_length: usize) -> Self {
    self.max_head_length = max_head_length;
    self
  }

  pub fn head(&self) -> Option<&MessageHead> {
    self.head.as_ref()
  }

  pub fn take_head(&mut self) -> Option<MessageHead> {
    self.head.take()
  }

  pub fn feed<H>(&mut self, data: &[u8], handler: &mut H) -> Result<FeedStatus, ParseError>
  where
    H: HttpMessageHandler + ?Sized,
  {
    match &self.state {
      ParserState::Failed(error) => return Err(error.clone()),
      ParserState::Complete => return Err(ParseError::AlreadyComplete),
      ParserState::Parsing => {}
    }
    let previous = self.pending.len();
    self.pending.extend_from_slice(data);
    let result = match self.kind {
      MessageKind::Request => self.parse_request(previous, handler),
      MessageKind::Response => self.parse_response(previous, handler),
    };
    match &result {
      Ok(FeedStatus::Partial) => {}
      Ok(FeedStatus::Complete { .. }) => {
        self.pending.clear();
        self.state = ParserState::Complete;
      }
      Err(error) => {
        self.pending.clear();
        self.state = ParserState::Failed(error.clone());
      }
    }
    result
  }

  fn check_length(&self, head_length: Option<usize>) -> Result<(), ParseError> {
    let length = head_length.unwrap_or(self.pending.len());
    if length > self.max_head_length {
      Err(ParseError::TooLarge {
        limit: self.max_head_length,
      })
    } else {
      Ok(())
    }
  }

  fn parse_request<H>(&mut self, previous: usize, handler: &mut H) -> Result<FeedStatus, ParseError>
  where
    H: HttpMessageHandler + ?Sized,
  {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);
    let status = request.parse(&self.pending).map_err(ParseError::Malformed);

    // Start-line tokens are reported even when the rest of the head is still missing
    if let (false, Some(method)) = (self.progress.method, request.method) {
      self.progress.method = true;
      fire(handler.on_method(method))?;
    }
    if let (false, Some(path)) = (self.progress.url, request.path) {
      self.progress.url = true;
      fire(handler.on_url(path))?;
    }
    if let (false, Some(minor)) = (self.progress.version, request.version) {
      self.progress.version = true;
      fire(handler.on_version(Version::from_minor(minor)))?;
    }

    let head_length = match status? {
      httparse::Status::Partial => {
        self.check_length(None)?;
        return Ok(FeedStatus::Partial);
      }
      httparse::Status::Complete(head_length) => head_length,
    };
    self.check_length(Some(head_length))?;

    let head = MessageHead {
      start: StartLine::Request {
        method: request.method.unwrap_or_default().to_string(),
        target: request.path.unwrap_or_default().to_string(),
      },
      version: Version::from_minor(request.version.unwrap_or(1)),
      headers: collect_headers(&self.pending, request.headers),
    };
    self.complete(head, head_length - previous.min(head_length), handler)
  }

  fn parse_response<H>(&mut self, previous: usize, handler: &mut H) -> Result<FeedStatus, ParseError>
  where
    H: HttpMessageHandler + ?Sized,
  {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    let status = response.parse(&self.pending).map_err(ParseError::Malformed);

    if let (false, Some(minor)) = (self.progress.version, response.version) {
      self.progress.version = true;
      fire(handler.on_version(Version::from_minor(minor)))?;
    }

    let head_length = match status? {
      httparse::Status::Partial => {
        self.check_length(None)?;
        return Ok(FeedStatus::Partial);
      }
      httparse::Status::Complete(head_length) => head_length,
    };
    self.check_length(Some(head_length))?;

    let code = response.code.unwrap_or_default();
    let reason = response.reason.unwrap_or_default();
    fire(handler.on_status(code, reason))?;
    let head = MessageHead {
      start: StartLine::Response {
        status: code,
        reason: reason.to_string(),
      },
      version: Version::from_minor(response.version.unwrap_or(1)),
      headers: collect_headers(&self.pending, response.headers),
    };
    self.complete(head, head_length - previous.min(head_length), handler)
  }

  fn complete<H>(
    &mut self,
    head: MessageHead,
    buffer_offset: usize,
    handler: &mut H,
  ) -> Result<FeedStatus, ParseError>
  where
    H: HttpMessageHandler + ?Sized,
  {
    for header in &head.headers {
      fire(handler.on_header_pair(&header.name, &header.value))?;
    }
    fire(handler.on_header_complete())?;
    fire(handler.on_message_complete(buffer_offset, head.is_upgrade()))?;
    self.head = Some(head);
    Ok(FeedStatus::Complete { buffer_offset })
  }
}

fn fire(proceed: bool) -> Result<(), ParseError> {
  if proceed {
    Ok(())
  } else {
    Err(ParseError::Aborted)
  }
}

fn collect_headers(wire: &[u8], headers: &[httparse::Header<'_>]) -> Vec<Header> {
  headers
    .iter()
    .map(|header| Header {
      name: header.name.to_string(),
      value: header.value.to_vec(),
      raw: raw_line(wire, header.name.as_bytes()),
    })
    .collect()
}

/// Finds the full line within `wire` which starts at `name`, a slice borrowed from `wire`
fn raw_line(wire: &[u8], name: &[u8]) -> Option<Vec<u8>> {
  let start = (name.as_ptr() as usize).checked_sub(wire.as_ptr() as usize)?;
  let line = wire.get(start..)?;
  let end = line.iter().position(|b| *b == b'\n')?;
  let line = &line[..end];
  Some(line.strip_suffix(b"\r").unwrap_or(line).to_vec())
}

/// Whether `data` holds at least a complete HTTP request line
pub fn starts_request_line(data: &[u8]) -> bool {
  if !data.contains(&b'\n') {
    return false;
  }
  let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
  let mut request = httparse::Request::new(&mut headers);
  // Header errors after a well-formed request line still count
  let _ = request.parse(data);
  request.version.is_some()
}

#[cfg(test)]
mod tests {
  use super::{
    starts_request_line, FeedStatus, Header, HttpMessageHandler, HttpMessageStreamRewriter,
    ParseError, Version,
  };

  #[derive(Default)]
  struct Recorder {
    events: Vec<String>,
    abort_on_method: bool,
  }

  impl HttpMessageHandler for Recorder {
    fn on_method(&mut self, method: &str) -> bool {
      self.events.push(format!("method {}", method));
      !self.abort_on_method
    }

    fn on_url(&mut self, url: &str) -> bool {
      self.events.push(format!("url {}", url));
      true
    }

    fn on_version(&mut self, version: Version) -> bool {
      self.events.push(format!("version {}", version.as_str()));
      true
    }

    fn on_status(&mut self, status: u16, reason: &str) -> bool {
      self.events.push(format!("status {} {}", status, reason));
      true
    }

    fn on_header_pair(&mut self, name: &str, value: &[u8]) -> bool {
      self
        .events
        .push(format!("header {}={}", name, String::from_utf8_lossy(value)));
      true
    }

    fn on_message_complete(&mut self, buffer_offset: usize, upgrade: bool) -> bool {
      self
        .events
        .push(format!("complete {} {}", buffer_offset, upgrade));
      true
    }
  }

  #[test]
  fn events_fire_across_split_chunks() {
    let mut rewriter = HttpMessageStreamRewriter::requests();
    let mut recorder = Recorder::default();
    assert_eq!(
      rewriter.feed(b"CONNECT exam", &mut recorder),
      Ok(FeedStatus::Partial)
    );
    assert_eq!(recorder.events, vec!["method CONNECT"]);
    assert_eq!(
      rewriter.feed(b"ple.com:443 HTTP/1.1\r\nHost: exa", &mut recorder),
      Ok(FeedStatus::Partial)
    );
    assert_eq!(
      rewriter.feed(b"mple.com:443\r\n\r\nhello", &mut recorder),
      Ok(FeedStatus::Complete { buffer_offset: 16 })
    );
    assert_eq!(
      recorder.events,
      vec![
        "method CONNECT",
        "url example.com:443",
        "version HTTP/1.1",
        "header Host=example.com:443",
        "complete 16 true",
      ]
    );
    let head = rewriter.head().unwrap();
    assert_eq!(head.target(), Some("example.com:443"));
    assert_eq!(rewriter.feed(b"x", &mut recorder), Err(ParseError::AlreadyComplete));
  }

  #[test]
  fn serialized_head_matches_wire_bytes() {
    let wire: &[u8] = b"GET /index.html HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\n";
    let mut rewriter = HttpMessageStreamRewriter::requests();
    rewriter.feed(wire, &mut Recorder::default()).unwrap();
    let head = rewriter.take_head().unwrap();
    assert!(!head.is_upgrade());
    assert_eq!(head.serialize(), wire);
  }

  #[test]
  fn unusual_header_spacing_survives_reserialization() {
    for wire in [
      &b"CONNECT example.com:443 HTTP/1.1\r\nHost:example.com:443\r\n\r\n"[..],
      &b"CONNECT example.com:443 HTTP/1.1\r\nHost:   example.com:443\r\nX-Empty:\r\n\r\n"[..],
    ] {
      let mut rewriter = HttpMessageStreamRewriter::requests();
      rewriter.feed(wire, &mut Recorder::default()).unwrap();
      let head = rewriter.take_head().unwrap();
      assert_eq!(
        String::from_utf8_lossy(&head.serialize()),
        String::from_utf8_lossy(wire)
      );
    }
  }

  #[test]
  fn edited_heads_are_reserialized() {
    let wire: &[u8] =
      b"GET http://example.com/ HTTP/1.1\r\nHost:example.com\r\nProxy-Authorization:x\r\nAccept:*/*\r\n\r\n";
    let mut rewriter = HttpMessageStreamRewriter::requests();
    rewriter.feed(wire, &mut Recorder::default()).unwrap();
    let mut head = rewriter.take_head().unwrap();
    head.set_target("/");
    head.remove_headers(|name| name.eq_ignore_ascii_case("proxy-authorization"));
    head.headers[1].value = b"text/html".to_vec();
    head.headers.push(Header::new("Via", "1.1 flowkit"));
    assert_eq!(
      String::from_utf8_lossy(&head.serialize()),
      "GET / HTTP/1.1\r\nHost:example.com\r\nAccept: text/html\r\nVia: 1.1 flowkit\r\n\r\n"
    );
  }

  #[test]
  fn errors_are_sticky() {
    let mut rewriter = HttpMessageStreamRewriter::requests();
    let mut recorder = Recorder::default();
    let error = rewriter.feed(b"\x00\x01\x02", &mut recorder).unwrap_err();
    assert!(matches!(error, ParseError::Malformed(_)));
    assert_eq!(
      rewriter.feed(b"GET / HTTP/1.1\r\n\r\n", &mut recorder),
      Err(error)
    );
    assert!(recorder.events.is_empty());
  }

  #[test]
  fn handler_can_abort() {
    let mut rewriter = HttpMessageStreamRewriter::requests();
    let mut recorder = Recorder {
      abort_on_method: true,
      ..Default::default()
    };
    assert_eq!(
      rewriter.feed(b"GET / HTTP/1.1\r\n\r\n", &mut recorder),
      Err(ParseError::Aborted)
    );
  }

  #[test]
  fn oversized_heads_are_rejected() {
    let mut rewriter = HttpMessageStreamRewriter::requests().with_max_head_length(32);
    let mut recorder = Recorder::default();
    assert_eq!(
      rewriter.feed(b"GET / HTTP/1.1\r\nX-Padding: aaaaaaaaaaaaaaaaaaaa", &mut recorder),
      Err(ParseError::TooLarge { limit: 32 })
    );
  }

  #[test]
  fn parses_responses() {
    let mut rewriter = HttpMessageStreamRewriter::responses();
    let mut recorder = Recorder::default();
    let status = rewriter
      .feed(b"HTTP/1.1 200 Connection Established\r\n\r\n", &mut recorder)
      .unwrap();
    assert_eq!(status, FeedStatus::Complete { buffer_offset: 39 });
    assert_eq!(
      recorder.events,
      vec![
        "version HTTP/1.1",
        "status 200 Connection Established",
        "complete 39 false"
      ]
    );
  }

  #[test]
  fn detects_request_lines() {
    assert!(starts_request_line(b"GET / HTTP/1.1\r\n"));
    assert!(starts_request_line(b"GET / HTTP/1.1\r\nHost: a\r\n"));
    assert!(!starts_request_line(b"GET / HTTP/1.1"));
    assert!(!starts_request_line(b"hello"));
    assert!(!starts_request_line(b"\x16\x03\x01\x02\x00\n"));
  }
}
