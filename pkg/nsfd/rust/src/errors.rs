// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

use thiserror::Error;

/// Failures that abort a whole report request. Everything else is contained
/// in the report itself as a degraded row.
#[derive(Error, Debug)]
pub enum Error {
    #[error("could not reserve a snapshot of {capacity} processes")]
    SnapshotAlloc { capacity: usize },

    #[error("report does not fit in {limit} bytes")]
    ReportTooLarge { limit: usize },

    #[error("could not read the root pid namespace: {source}")]
    RootNamespace {
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Errno-style code handed back to readers of the report file.
    pub fn errno(&self) -> i32 {
        match self {
            Error::SnapshotAlloc { .. } | Error::ReportTooLarge { .. } => libc::ENOMEM,
            Error::RootNamespace { source } => source.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

/// Why the path of an open file could not be resolved.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    /// Pipes, sockets and anonymous inodes have no filesystem path.
    #[error("no path")]
    NoPath,

    #[error("name too long")]
    NameTooLong,

    /// The descriptor was closed or reused while it was being resolved. Its
    /// row is left out of the report.
    #[error("gone")]
    Gone,

    #[error("errno {0}")]
    Os(i32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_exhaustion_maps_to_enomem() {
        assert_eq!(Error::SnapshotAlloc { capacity: 8 }.errno(), libc::ENOMEM);
        assert_eq!(Error::ReportTooLarge { limit: 4096 }.errno(), libc::ENOMEM);
    }

    #[test]
    fn test_root_namespace_keeps_os_error() {
        let err = Error::RootNamespace {
            source: std::io::Error::from_raw_os_error(libc::EACCES),
        };
        assert_eq!(err.errno(), libc::EACCES);

        let err = Error::RootNamespace {
            source: std::io::Error::other("synthetic"),
        };
        assert_eq!(err.errno(), libc::EIO);
    }

    #[test]
    fn test_path_error_display() {
        assert_eq!(PathError::NoPath.to_string(), "no path");
        assert_eq!(PathError::Os(13).to_string(), "errno 13");
    }
}
