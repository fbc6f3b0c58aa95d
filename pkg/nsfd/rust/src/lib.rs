// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

// Correctness
#![deny(clippy::indexing_slicing)]
#![deny(clippy::string_slice)]
#![deny(clippy::cast_possible_wrap)]
#![deny(clippy::undocumented_unsafe_blocks)]
// Panicking code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::unimplemented)]
#![deny(clippy::todo)]
// Debug code that shouldn't be in production
#![deny(clippy::dbg_macro)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]

pub mod config;
mod errors;
mod fds;
pub mod host;
mod namespace;
pub mod procfs;
mod report;
mod seq;
mod snapshot;
mod token;

#[cfg(any(test, feature = "test-helpers"))]
pub mod testing;

// Re-export the public API
pub use errors::{Error, PathError};
pub use fds::{DescriptorRow, inspect};
pub use namespace::{Classifier, Scope, translate};
pub use report::{IdentityRow, PassState, PassStats, ReportProducer};
pub use seq::{Overflow, PAGE_SIZE, ReportFile, ReportOptions, SeqBuf, Sink};
pub use snapshot::{Collected, Snapshot, collect};
pub use token::{TOKEN_LEN, Token, tokenize};
