// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

use std::fmt;

use log::{debug, trace};
use serde::Serialize;

use crate::errors::Error;
use crate::fds;
use crate::host::{ContainerIds, Host, Pid, Process};
use crate::namespace::{self, Classifier};
use crate::seq::Sink;
use crate::snapshot::{self, Collected};
use crate::token::{Token, tokenize};

/// Where a report pass currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PassState {
    Idle,
    Collecting,
    Emitting(usize),
    /// The sink is full: blocks are released without being written.
    Overflowing(usize),
    Done,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassStats {
    /// Processes collected in the snapshot.
    pub collected: usize,
    /// Process blocks written.
    pub emitted: usize,
    /// Processes that went away between collection and inspection.
    pub torn_down: usize,
    /// Processes released without being written because the sink was full.
    pub discarded: usize,
    pub descriptors: usize,
    pub truncated: bool,
    pub overflowed: bool,
    /// Passes run before the output fit in the buffer.
    pub attempts: u32,
}

/// First row of a process block, formatted as
/// `ns_token\tpid\tcontainer_pid\tcontainer_ppid\tcontainer_pgid\tstate\tcomm\n`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityRow {
    pub ns_token: Token,
    pub pid: Pid,
    pub ids: ContainerIds,
    pub state: char,
    pub comm: String,
}

impl fmt::Display for IdentityRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}",
            self.ns_token,
            self.pid,
            self.ids.pid,
            self.ids.ppid,
            self.ids.pgid,
            self.state,
            self.comm
        )
    }
}

enum Block {
    Written { descriptors: usize },
    TornDown,
    /// The sink overflowed part way through the block.
    Overflowed,
}

/// Produces one report pass: collect, then write a block per process.
///
/// A producer is single use. Running it never changes the inspected
/// processes or files; the only side effect on the host is reference churn.
pub struct ReportProducer<'h, H> {
    host: &'h H,
    capacity: usize,
    state: PassState,
}

impl<'h, H: Host> ReportProducer<'h, H> {
    pub fn new(host: &'h H, capacity: usize) -> Self {
        ReportProducer {
            host,
            capacity,
            state: PassState::Idle,
        }
    }

    pub fn state(&self) -> PassState {
        self.state
    }

    pub fn run<S: Sink>(&mut self, sink: &mut S) -> Result<PassStats, Error> {
        self.transition(PassState::Collecting);
        let classifier = Classifier::capture(self.host)?;
        let snapshot = snapshot::collect(self.host, &classifier, self.capacity)?;

        let mut stats = PassStats {
            collected: snapshot.len(),
            truncated: snapshot.truncated,
            ..Default::default()
        };

        // Every entry is moved out and dropped by the end of its iteration,
        // which releases its process reference whether or not it is written.
        for (index, entry) in snapshot.entries.into_iter().enumerate() {
            if sink.has_overflowed() {
                self.transition(PassState::Overflowing(index));
                stats.discarded += 1;
                continue;
            }

            self.transition(PassState::Emitting(index));
            match write_block(&entry, sink) {
                Block::Written { descriptors } => {
                    stats.emitted += 1;
                    stats.descriptors += descriptors;
                }
                Block::TornDown => stats.torn_down += 1,
                Block::Overflowed => stats.discarded += 1,
            }
        }

        stats.overflowed = sink.has_overflowed();
        self.transition(PassState::Done);
        debug!(
            "report pass done: {} emitted, {} torn down, {} discarded",
            stats.emitted, stats.torn_down, stats.discarded
        );
        Ok(stats)
    }

    fn transition(&mut self, next: PassState) {
        trace!("report pass {:?} -> {:?}", self.state, next);
        self.state = next;
    }
}

fn write_block<P: Process, S: Sink>(entry: &Collected<P>, sink: &mut S) -> Block {
    let process = &entry.process;
    let Some(fields) = process.fields() else {
        debug!("pid {} went away before it could be inspected", process.pid());
        return Block::TornDown;
    };

    let row = IdentityRow {
        ns_token: tokenize(entry.ns.raw_handle()),
        pid: process.pid(),
        ids: namespace::translate(process, entry.ns),
        state: fields.state,
        comm: fields.comm,
    };
    if sink.write(row.to_string().as_bytes()).is_err() {
        return Block::Overflowed;
    }

    // The table reference is released when `files` goes out of scope.
    let descriptors = match process.files() {
        Some(files) => fds::inspect(&files, sink),
        None => 0,
    };

    if sink.write(b"\n").is_err() || sink.has_overflowed() {
        return Block::Overflowed;
    }
    Block::Written { descriptors }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::host::NsId;
    use crate::seq::SeqBuf;
    use crate::testing::{FakeFile, FakeHost, FakeTask};

    fn run(host: &FakeHost, capacity: usize, sink: &mut SeqBuf) -> PassStats {
        let mut producer = ReportProducer::new(host, capacity);
        assert_eq!(producer.state(), PassState::Idle);
        let stats = producer.run(sink).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(producer.state(), PassState::Done);
        stats
    }

    #[test]
    fn test_identity_row_format() {
        let row = IdentityRow {
            ns_token: tokenize(7),
            pid: 50,
            ids: ContainerIds {
                pid: 3,
                ppid: 1,
                pgid: 3,
            },
            state: 'S',
            comm: "worker".to_string(),
        };
        assert_eq!(
            row.to_string(),
            format!("{}\t50\t3\t1\t3\tS\tworker\n", tokenize(7))
        );
    }

    #[test]
    fn test_empty_host_gives_empty_report() {
        let host = FakeHost::new(NsId(1));
        host.spawn(FakeTask::new(1, "init"));

        let mut sink = SeqBuf::unbounded();
        let stats = run(&host, 16, &mut sink);
        assert!(sink.as_bytes().is_empty());
        assert_eq!(stats, PassStats::default());
    }

    #[test]
    fn test_blocks_follow_snapshot_order() {
        let host = FakeHost::new(NsId(1));
        host.spawn(FakeTask::new(60, "b").namespace(NsId(7), 2, 1, 1));
        host.spawn(FakeTask::new(1, "init"));
        host.spawn(FakeTask::new(55, "a").namespace(NsId(7), 1, 0, 1));
        host.open(60, 1, FakeFile::new(0x61).path("/b"));
        host.open(55, 1, FakeFile::new(0x56).path("/a"));

        let mut sink = SeqBuf::unbounded();
        let stats = run(&host, 16, &mut sink);
        let out = String::from_utf8_lossy(sink.as_bytes()).into_owned();
        let blocks: Vec<&str> = out.split_terminator("\n\n").collect();
        assert_eq!(blocks.len(), 2);
        assert!(blocks[0].contains("\t60\t") && blocks[0].ends_with("/b"));
        assert!(blocks[1].contains("\t55\t") && blocks[1].ends_with("/a"));
        assert_eq!(stats.emitted, 2);
        assert_eq!(stats.descriptors, 2);
    }

    #[test]
    fn test_torn_down_process_is_skipped() {
        let host = FakeHost::new(NsId(1));
        host.spawn(FakeTask::new(50, "worker").namespace(NsId(7), 1, 0, 1));
        host.spawn(FakeTask::new(51, "worker").namespace(NsId(7), 2, 1, 1));

        let classifier = Classifier::new(NsId(1));
        let snapshot =
            snapshot::collect(&host, &classifier, 16).unwrap_or_else(|e| panic!("{e}"));
        host.exit(50);

        let mut sink = SeqBuf::unbounded();
        let mut torn_down = 0;
        for entry in &snapshot.entries {
            if let Block::TornDown = write_block(entry, &mut sink) {
                torn_down += 1;
            }
        }
        let out = String::from_utf8_lossy(sink.as_bytes()).into_owned();
        assert_eq!(torn_down, 1);
        assert!(!out.contains("\t50\t"));
        assert!(out.contains("\t51\t"));
    }

    #[test]
    fn test_process_without_files_still_gets_a_block() {
        let host = FakeHost::new(NsId(1));
        host.spawn(
            FakeTask::new(50, "worker")
                .namespace(NsId(7), 1, 0, 1)
                .without_files(),
        );

        let mut sink = SeqBuf::unbounded();
        let stats = run(&host, 16, &mut sink);
        let out = String::from_utf8_lossy(sink.as_bytes()).into_owned();
        assert_eq!(out.lines().count(), 2);
        assert!(out.ends_with("\n\n"));
        assert_eq!(stats.emitted, 1);
    }

    #[test]
    fn test_overflow_discards_remaining_blocks_and_releases_everything() {
        let host = FakeHost::new(NsId(1));
        for pid in 100..110 {
            host.spawn(FakeTask::new(pid, "worker").namespace(NsId(7), pid - 99, 0, 1));
            host.open(pid, 0, FakeFile::new(pid as u128).path("/dev/null"));
        }

        let mut sink = SeqBuf::with_limit(300);
        let stats = run(&host, 16, &mut sink);
        assert!(stats.overflowed);
        assert!(stats.discarded > 0);
        assert_eq!(
            stats.emitted + stats.discarded + stats.torn_down,
            stats.collected
        );
        assert_eq!(host.counts().outstanding_tasks(), 0);
        assert_eq!(host.counts().outstanding_tables(), 0);
        assert_eq!(host.counts().outstanding_files(), 0);
    }

    #[test]
    fn test_block_cut_by_overflow_is_not_counted_as_emitted() {
        let host = FakeHost::new(NsId(1));
        host.spawn(FakeTask::new(50, "worker").namespace(NsId(7), 1, 0, 1));
        host.spawn(FakeTask::new(51, "worker").namespace(NsId(7), 2, 1, 1));

        // Too small for even the first identity row.
        let mut sink = SeqBuf::with_limit(16);
        let stats = run(&host, 16, &mut sink);
        assert!(stats.overflowed);
        assert_eq!(stats.emitted, 0);
        assert_eq!(stats.discarded, 2);
        assert_eq!(stats.descriptors, 0);
    }

    #[test]
    fn test_missing_root_namespace_fails_the_pass() {
        let host = FakeHost::new(NsId(1));
        host.fail_root_namespace();

        let mut sink = SeqBuf::unbounded();
        let result = ReportProducer::new(&host, 16).run(&mut sink);
        assert!(matches!(result, Err(Error::RootNamespace { .. })));
        assert!(sink.as_bytes().is_empty());
    }
}
