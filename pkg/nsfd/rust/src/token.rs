// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::host::RawHandle;

/// Length of a rendered token: a hex encoded SHA-256 digest.
pub const TOKEN_LEN: usize = 64;

/// Printable stand-in for a raw object handle. Equal handles give equal
/// tokens for the lifetime of the host, without exposing the handle itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Token(String);

impl Token {
    /// Placeholder used when the handle could not be read.
    pub fn degraded() -> Self {
        Token("0".repeat(TOKEN_LEN))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn tokenize(handle: RawHandle) -> Token {
    let digest = Sha256::digest(handle.to_ne_bytes());
    Token(hex::encode(digest))
}
