// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
pub mod context;
pub mod data_flow;
pub mod http;
pub mod listener;
pub mod resolver;
pub mod rule;
pub mod session;
pub mod tunnel;
