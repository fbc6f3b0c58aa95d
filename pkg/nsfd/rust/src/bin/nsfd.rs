// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

use std::io::{self, Read, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use dd_nsfd::procfs::ProcfsHost;
use dd_nsfd::{PAGE_SIZE, ReportFile, config};
use log::debug;

#[derive(Parser, Debug)]
#[command(name = "nsfd")]
#[command(about = "Prints the open files of every containerized process", long_about = None)]
struct Args {
    /// Path to the YAML config file
    #[arg(short, long = "config")]
    config_path: Option<PathBuf>,

    /// Size of each read from the report
    #[arg(long, default_value_t = PAGE_SIZE)]
    chunk_size: usize,

    /// Most containerized processes to report on
    #[arg(long)]
    max_processes: Option<usize>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = config::load_config(args.config_path);
    simple_logger::init_with_level(config::get_log_level(&config))?;
    let config = config.unwrap_or_default();

    let mut options = config::get_report_options(&config);
    if let Some(max_processes) = args.max_processes {
        options.max_processes = max_processes;
    }

    let mut report = ReportFile::open(ProcfsHost::new(), options);
    let mut chunk = vec![0u8; args.chunk_size.max(1)];
    let mut stdout = io::stdout().lock();
    loop {
        let read = report.read(&mut chunk).context("Failed to read the report")?;
        if read == 0 {
            break;
        }
        stdout
            .write_all(chunk.get(..read).unwrap_or_default())
            .context("Failed to write the report")?;
    }
    stdout.flush()?;

    if let Some(stats) = report.last_stats() {
        debug!("{stats:?}");
    }
    Ok(())
}
