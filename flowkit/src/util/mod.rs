// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
pub mod buffer;
pub mod cancellation;
pub mod dropkick;
pub mod validators;

/// Default capacity of buffers moved between tunnel pumps
pub const RELAY_BUFFER_CAPACITY: usize = 1024 * 32;
