// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

//! Walks one open-file table and writes a row per live descriptor.

use std::fmt;

use log::{debug, error, trace};

use crate::errors::PathError;
use crate::host::{FileTable, LockedFileTable, OpenFile};
use crate::seq::Sink;
use crate::token::{Token, tokenize};

pub(crate) const O_CLOEXEC: u32 = libc::O_CLOEXEC as u32;

/// One descriptor of the report, formatted as
/// `fd\tclose_on_exec\tobject_token\toffset\tflags\tpath\n`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorRow {
    pub fd: usize,
    pub close_on_exec: bool,
    pub token: Token,
    pub offset: i64,
    pub flags: u32,
    pub path: Result<String, PathError>,
}

impl DescriptorRow {
    /// Reads everything the row needs from `file`. Path resolution may block,
    /// so this must only run once the table lock has been dropped.
    pub fn resolve<F: OpenFile>(fd: usize, close_on_exec: bool, file: &F) -> Self {
        let token = match file.handle() {
            Some(handle) => tokenize(handle),
            None => {
                error!("could not read the identity of fd {fd}, using a placeholder token");
                Token::degraded()
            }
        };

        let mut flags = file.flags();
        if close_on_exec {
            flags |= O_CLOEXEC;
        }

        DescriptorRow {
            fd,
            close_on_exec,
            token,
            offset: file.offset(),
            flags,
            path: file.path(),
        }
    }
}

impl fmt::Display for DescriptorRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\t{}\t{}\t{}\t0{:o}\t",
            self.fd,
            u8::from(self.close_on_exec),
            self.token,
            self.offset,
            self.flags
        )?;
        match &self.path {
            Ok(path) => writeln!(f, "{path}"),
            Err(e) => writeln!(f, "<error: {e}>"),
        }
    }
}

/// Writes one row per live descriptor of `table` to `sink`, in descriptor
/// order, and returns the number of rows written.
///
/// The table lock is only held to find the next live slot and take a
/// reference on its file. It is dropped while the row is resolved and
/// written, and taken again before that reference is released. Slots opened
/// or closed while the lock was dropped are seen (or not) on the next step.
pub fn inspect<T: FileTable, S: Sink>(table: &T, sink: &mut S) -> usize {
    let mut rows = 0;
    let mut fd = 0;
    let mut fdt = table.lock();

    while fd < fdt.max_fds() {
        if sink.has_overflowed() {
            trace!("sink overflowed, stopping at fd {fd}");
            break;
        }

        let Some(file) = fdt.get_file(fd) else {
            fd += 1;
            continue;
        };
        let close_on_exec = fdt.close_on_exec(fd);
        drop(fdt);

        let row = DescriptorRow::resolve(fd, close_on_exec, &file);
        if row.path == Err(PathError::Gone) {
            debug!("fd {fd} was torn down while being read, skipping it");
        } else if sink.write(row.to_string().as_bytes()).is_ok() {
            rows += 1;
        }

        fdt = table.lock();
        drop(file);
        fd += 1;
    }

    rows
}
