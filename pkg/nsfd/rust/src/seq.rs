// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

//! Bounded output buffers and the paginated report file built on them.

use std::io;

use log::debug;
use thiserror::Error;

use crate::errors::Error;
use crate::host::Host;
use crate::report::{PassStats, ReportProducer};

/// Size of the first buffer a report pass is attempted with.
pub const PAGE_SIZE: usize = 4096;

const DEFAULT_MAX_PROCESSES: usize = 1024;
const DEFAULT_MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("output buffer is full")]
pub struct Overflow;

/// Destination of report rows.
///
/// Once a write overflows, the rest of the pass is discarded by the caller,
/// who starts over with a larger buffer. Producers check `has_overflowed()`
/// before expensive work instead of relying on write results alone.
pub trait Sink {
    fn write(&mut self, bytes: &[u8]) -> Result<(), Overflow>;

    fn has_overflowed(&self) -> bool;
}

impl Sink for Vec<u8> {
    fn write(&mut self, bytes: &[u8]) -> Result<(), Overflow> {
        self.extend_from_slice(bytes);
        Ok(())
    }

    fn has_overflowed(&self) -> bool {
        false
    }
}

/// A buffer that accepts whole writes up to a fixed limit. A write that does
/// not fit is dropped and marks the buffer as overflowed for good.
#[derive(Debug)]
pub struct SeqBuf {
    buf: Vec<u8>,
    limit: usize,
    overflowed: bool,
}

impl SeqBuf {
    pub fn with_limit(limit: usize) -> Self {
        SeqBuf {
            buf: Vec::new(),
            limit,
            overflowed: false,
        }
    }

    pub fn unbounded() -> Self {
        Self::with_limit(usize::MAX)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

impl Sink for SeqBuf {
    fn write(&mut self, bytes: &[u8]) -> Result<(), Overflow> {
        if self.overflowed {
            return Err(Overflow);
        }
        if bytes.len() > self.limit.saturating_sub(self.buf.len()) {
            self.overflowed = true;
            return Err(Overflow);
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    fn has_overflowed(&self) -> bool {
        self.overflowed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportOptions {
    /// Most containerized processes a single pass reports on.
    pub max_processes: usize,
    /// Largest buffer a pass may grow to before the read fails.
    pub max_buffer_size: usize,
}

impl Default for ReportOptions {
    fn default() -> Self {
        ReportOptions {
            max_processes: DEFAULT_MAX_PROCESSES,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
        }
    }
}

/// The report as a read-only file.
///
/// The whole report is produced by one pass on the first read. A pass that
/// overflows its buffer is thrown away and run again from scratch with twice
/// the buffer, so every retry sees a fresh snapshot. Later reads copy out the
/// next chunk of that output. Reading at offset 0 always starts a new pass.
pub struct ReportFile<H> {
    host: H,
    options: ReportOptions,
    output: Option<Vec<u8>>,
    pos: usize,
    last_stats: Option<PassStats>,
}

impl<H: Host> ReportFile<H> {
    pub fn open(host: H, options: ReportOptions) -> Self {
        ReportFile {
            host,
            options,
            output: None,
            pos: 0,
            last_stats: None,
        }
    }

    /// Copies the report bytes at `offset` into `out` and returns how many
    /// were copied. Returns 0 at the end of the report.
    pub fn read_at(&mut self, offset: usize, out: &mut [u8]) -> Result<usize, Error> {
        if offset == 0 || self.output.is_none() {
            self.fill()?;
        }

        let Some(rest) = self.output.as_deref().and_then(|output| output.get(offset..)) else {
            return Ok(0);
        };
        let count = rest.len().min(out.len());
        if let (Some(dst), Some(src)) = (out.get_mut(..count), rest.get(..count)) {
            dst.copy_from_slice(src);
        }
        Ok(count)
    }

    /// Statistics of the pass that produced the current output.
    pub fn last_stats(&self) -> Option<&PassStats> {
        self.last_stats.as_ref()
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    fn fill(&mut self) -> Result<(), Error> {
        self.output = None;
        let max = self.options.max_buffer_size.max(PAGE_SIZE);
        let mut limit = PAGE_SIZE;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let mut buf = SeqBuf::with_limit(limit);
            let mut stats =
                ReportProducer::new(&self.host, self.options.max_processes).run(&mut buf)?;

            if !buf.has_overflowed() {
                stats.attempts = attempts;
                debug!(
                    "report pass produced {} bytes after {attempts} attempt(s)",
                    buf.as_bytes().len()
                );
                self.output = Some(buf.into_bytes());
                self.last_stats = Some(stats);
                return Ok(());
            }

            if limit >= max {
                return Err(Error::ReportTooLarge { limit: max });
            }
            debug!("report does not fit in {limit} bytes, starting over with a larger buffer");
            limit = limit.saturating_mul(2).min(max);
        }
    }
}

impl<H: Host> io::Read for ReportFile<H> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let count = self
            .read_at(self.pos, buf)
            .map_err(|e| io::Error::from_raw_os_error(e.errno()))?;
        self.pos += count;
        Ok(count)
    }
}
