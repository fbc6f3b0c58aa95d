// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

//! Fields of /proc/<pid>/status used by the report.

use crate::host::Pid;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Status {
    pub name: String,
    pub state: char,
    pub ppid: Pid,
    /// Pid in every namespace the process is a member of, outermost first.
    pub nspid: Vec<Pid>,
    pub nspgid: Vec<Pid>,
}

fn parse_ids(value: &str) -> Vec<Pid> {
    value
        .split_whitespace()
        .filter_map(|id| id.parse().ok())
        .collect()
}

impl Status {
    /// Returns `None` unless both `Name` and `State` are present.
    pub fn parse(content: &str) -> Option<Self> {
        let mut status = Status::default();
        let mut has_name = false;

        for line in content.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            match key {
                // Names may contain spaces, only the separator is stripped.
                "Name" => {
                    status.name = value.strip_prefix('\t').unwrap_or(value).to_string();
                    has_name = true;
                }
                "State" => status.state = value.trim_start().chars().next()?,
                "PPid" => status.ppid = value.trim().parse().ok()?,
                "NSpid" => status.nspid = parse_ids(value),
                "NSpgid" => status.nspgid = parse_ids(value),
                _ => {}
            }
        }

        (has_name && status.state != '\0').then_some(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTAINER_STATUS: &str = "Name:\tnginx: worker\n\
        Umask:\t0022\n\
        State:\tS (sleeping)\n\
        Tgid:\t4242\n\
        Ngid:\t0\n\
        Pid:\t4242\n\
        PPid:\t4200\n\
        TracerPid:\t0\n\
        NStgid:\t4242\t7\n\
        NSpid:\t4242\t7\n\
        NSpgid:\t4200\t1\n\
        NSsid:\t4200\t1\n";

    #[test]
    fn test_parse_container_process() {
        let status = Status::parse(CONTAINER_STATUS);
        assert_eq!(
            status,
            Some(Status {
                name: "nginx: worker".to_string(),
                state: 'S',
                ppid: 4200,
                nspid: vec![4242, 7],
                nspgid: vec![4200, 1],
            })
        );
    }

    #[test]
    fn test_parse_host_process() {
        let status = Status::parse("Name:\tsystemd\nState:\tS (sleeping)\nPPid:\t0\nNSpid:\t1\nNSpgid:\t1\n");
        let status = status.unwrap_or_default();
        assert_eq!(status.nspid, vec![1]);
        assert_eq!(status.ppid, 0);
    }

    #[test]
    fn test_missing_state_is_rejected() {
        assert_eq!(Status::parse("Name:\tfoo\nPPid:\t1\n"), None);
    }

    #[test]
    fn test_missing_name_is_rejected() {
        assert_eq!(Status::parse("State:\tR (running)\n"), None);
    }

    #[test]
    fn test_empty_name_is_kept() {
        let status = Status::parse("Name:\t\nState:\tZ (zombie)\n").unwrap_or_default();
        assert_eq!(status.name, "");
        assert_eq!(status.state, 'Z');
    }
}
