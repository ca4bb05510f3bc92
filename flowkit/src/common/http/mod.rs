// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Incremental HTTP/1.x message head handling

pub mod rewriter;

pub use self::rewriter::{
  FeedStatus, Header, HttpMessageHandler, HttpMessageStreamRewriter, MessageHead, MessageKind,
  ParseError, StartLine, Version,
};
