// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Composable data flows for proxying connections.
//!
//! Accepted connections are wrapped in a chain of protocol layers implementing
//! [common::data_flow::DataFlow], paired with a destination-facing chain, and
//! relayed by a [common::tunnel::Tunnel]. The [instance::Instance] ties the
//! listeners, resolver, and rule set together.
#![warn(unused_imports)]

pub mod common;
pub mod util;

pub mod instance;
