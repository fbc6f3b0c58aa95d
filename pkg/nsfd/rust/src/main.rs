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

use std::fs::{DirBuilder, OpenOptions, Permissions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt, chown};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use dd_nsfd::procfs::ProcfsHost;
use dd_nsfd::{Error, PAGE_SIZE, PassStats, ReportFile, ReportOptions, config};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{debug, error, info, warn};
use serde_json::json;
use tokio::net::UnixListener;
use tokio::signal::unix::{SignalKind, signal};

type Body = BoxBody<Bytes, std::io::Error>;

static BADREQUEST: &[u8] = b"Bad request";
static NOTFOUND: &[u8] = b"Not found";
static NOTALLOWED: &[u8] = b"Method not allowed";

#[derive(Parser, Debug)]
#[command(name = "nsfd-probe")]
#[command(about = "Serves the open-file report of containerized processes on a unix socket", long_about = None)]
struct Args {
    /// Path to the YAML config file
    #[arg(short, long = "config")]
    config_path: Option<PathBuf>,

    /// Write the daemon's PID to this file
    #[arg(long = "pid")]
    pid_path: Option<PathBuf>,
}

/// State shared by every connection.
struct Shared {
    host: ProcfsHost,
    options: ReportOptions,
    passes: AtomicU64,
    last_stats: Mutex<Option<PassStats>>,
}

impl Shared {
    fn record(&self, stats: Option<&PassStats>) {
        self.passes.fetch_add(1, Ordering::Relaxed);
        *self
            .last_stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = stats.cloned();
    }
}

/// The report file a connection is paging through.
type Cursor = Arc<Mutex<Option<ReportFile<ProcfsHost>>>>;

#[derive(Debug, PartialEq, Eq)]
struct Chunk {
    offset: usize,
    count: usize,
}

/// Parses `offset=N&count=M`. No query means the whole report.
fn parse_chunk_query(query: Option<&str>) -> Result<Option<Chunk>, String> {
    let Some(query) = query.filter(|q| !q.is_empty()) else {
        return Ok(None);
    };

    let mut offset = None;
    let mut count = None;
    for pair in query.split('&') {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| format!("malformed query parameter {pair:?}"))?;
        let value: usize = value
            .parse()
            .map_err(|e| format!("invalid value for {key}: {e}"))?;
        match key {
            "offset" => offset = Some(value),
            "count" => count = Some(value),
            _ => return Err(format!("unknown query parameter {key:?}")),
        }
    }

    match (offset, count) {
        (Some(offset), Some(count)) => Ok(Some(Chunk { offset, count })),
        _ => Err("offset and count must be given together".to_string()),
    }
}

fn write_pid_file(path: &Path) -> Result<()> {
    // Create parent directories if needed
    if let Some(parent) = path.parent() {
        DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(parent)
            .context("Failed to create PID file parent directory")?;
    }

    let pid = std::process::id();
    let mut file = OpenOptions::new()
        .write(true)
        .mode(0o644)
        .truncate(true)
        .create(true)
        .open(path)
        .context("Failed to write PID file")?;
    file.write_all(pid.to_string().as_bytes())
        .context("Failed to write PID to file")?;

    info!("Created PID file at {}", path.display());
    Ok(())
}

fn remove_pid_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        error!("Failed to remove PID file: {}", e);
    } else {
        info!("Removed PID file at {}", path.display());
    }
}

fn setup_socket(socket_path: &str, user: &str, group: Option<u32>) -> Result<UnixListener> {
    std::fs::remove_file(socket_path)
        .or_else(|error| {
            if error.kind() == ErrorKind::NotFound {
                Ok(())
            } else {
                Err(error)
            }
        })
        .context("failed to remove existing socket")?;

    if let Some(parent) = Path::new(socket_path).parent() {
        DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(parent)
            .context("could not create socket directory")?;
    }

    let sock = UnixListener::bind(socket_path).context("could not create nsfd socket")?;
    // Connecting needs write permission, so owner-only is 0600.
    std::fs::set_permissions(socket_path, Permissions::from_mode(0o600))
        .context("could not set socket permissions")?;

    // Try to chown to the report user if it exists, skip if it doesn't
    if let Some(report_user) = uzers::get_user_by_name(user) {
        let gid = group.unwrap_or_else(|| report_user.primary_group_id());
        if let Err(e) = chown(socket_path, Some(report_user.uid()), Some(gid)) {
            warn!("could not set socket ownership: {e}")
        }
    } else {
        info!("{user} user not found, skipping socket ownership change");
    }

    Ok(sock)
}

fn respond(status: StatusCode, content_type: &str, body: Vec<u8>) -> Result<Response<Body>> {
    Response::builder()
        .status(status)
        .header("Content-Type", content_type)
        .body(Full::new(body.into()).map_err(|e| match e {}).boxed())
        .map_err(|e| anyhow!("Failed to build response: {}", e))
}

fn plain(status: StatusCode, body: &'static [u8]) -> Result<Response<Body>> {
    respond(status, "text/plain", body.to_vec())
}

fn report_error(e: &Error) -> Result<Response<Body>> {
    error!("Report pass failed: {e}");
    let status = match e {
        Error::SnapshotAlloc { .. } | Error::ReportTooLarge { .. } => {
            StatusCode::INSUFFICIENT_STORAGE
        }
        Error::RootNamespace { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    respond(status, "text/plain", e.to_string().into_bytes())
}

/// Runs one full pass and reads the whole report.
fn read_full_report(shared: &Shared) -> Result<Vec<u8>, Error> {
    let mut file = ReportFile::open(shared.host.clone(), shared.options);
    let mut out = Vec::new();
    let mut chunk = vec![0u8; PAGE_SIZE];
    loop {
        let read = file.read_at(out.len(), &mut chunk)?;
        if read == 0 {
            break;
        }
        out.extend_from_slice(chunk.get(..read).unwrap_or_default());
    }
    shared.record(file.last_stats());
    Ok(out)
}

/// Reads one chunk of the connection's current pass.
fn read_report_chunk(shared: &Shared, cursor: &Cursor, chunk: &Chunk) -> Result<Vec<u8>, Error> {
    let mut guard = cursor.lock().unwrap_or_else(PoisonError::into_inner);
    let file = guard.get_or_insert_with(|| ReportFile::open(shared.host.clone(), shared.options));

    let mut out = vec![0u8; chunk.count.min(shared.options.max_buffer_size)];
    let read = file.read_at(chunk.offset, &mut out)?;
    out.truncate(read);
    if chunk.offset == 0 {
        shared.record(file.last_stats());
    }
    Ok(out)
}

async fn handle_report(
    req: Request<hyper::body::Incoming>,
    shared: Arc<Shared>,
    cursor: Cursor,
) -> Result<Response<Body>> {
    let chunk = match parse_chunk_query(req.uri().query()) {
        Ok(chunk) => chunk,
        Err(e) => {
            warn!("Bad /report query: {e}");
            return plain(StatusCode::BAD_REQUEST, BADREQUEST);
        }
    };

    // Report passes walk /proc synchronously and must not stall the reactor.
    let result = tokio::task::spawn_blocking(move || match chunk {
        None => read_full_report(&shared),
        Some(chunk) => read_report_chunk(&shared, &cursor, &chunk),
    })
    .await
    .context("report pass panicked")?;

    match result {
        Ok(body) => {
            debug!("Serving {} report bytes", body.len());
            respond(StatusCode::OK, "text/plain", body)
        }
        Err(e) => report_error(&e),
    }
}

fn handle_debug_stats(shared: &Shared) -> Result<Response<Body>> {
    let last = shared
        .last_stats
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    let body = json!({
        "passes": shared.passes.load(Ordering::Relaxed),
        "max_processes": shared.options.max_processes,
        "max_buffer_size": shared.options.max_buffer_size,
        "last_pass": last,
    });
    respond(
        StatusCode::OK,
        "application/json",
        serde_json::to_vec(&body).unwrap_or_else(|e| {
            error!("Failed to serialize response: {e}");
            b"Internal server error".to_vec()
        }),
    )
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    shared: Arc<Shared>,
    cursor: Cursor,
) -> Result<Response<Body>> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/report") => {
            info!("Handling /report request");
            handle_report(req, shared, cursor).await
        }
        (_, "/report") => {
            info!("{} Request to /report rejected", req.method());
            plain(StatusCode::METHOD_NOT_ALLOWED, NOTALLOWED)
        }
        (&Method::GET, "/debug/stats") => handle_debug_stats(&shared),
        _ => {
            info!(
                "{} Request to unknown endpoint: {}",
                req.method(),
                req.uri().path()
            );
            plain(StatusCode::NOT_FOUND, NOTFOUND)
        }
    }
}

async fn run_probe(config: Option<yaml_rust2::Yaml>, pid_path: Option<PathBuf>) -> Result<()> {
    let socket_path = config::get_socket_path(&config);
    info!("Using nsfd socket path: {}", socket_path);
    let sock = setup_socket(
        &socket_path,
        &config::get_report_user(&config),
        config::get_report_group(&config),
    )
    .context("Failed to setup Unix socket")?;

    // Write PID file if needed
    if let Some(ref path) = pid_path {
        write_pid_file(path)?;
    }

    let shared = Arc::new(Shared {
        host: ProcfsHost::new(),
        options: config::get_report_options(&config),
        passes: AtomicU64::new(0),
        last_stats: Mutex::new(None),
    });
    info!(
        "Reporting on up to {} processes, {} bytes at most, from {}",
        shared.options.max_processes,
        shared.options.max_buffer_size,
        shared.host.root().display()
    );

    // Setup signal handlers
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to setup SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to setup SIGINT handler")?;

    loop {
        tokio::select! {
            accept_result = sock.accept() => {
                let (stream, _) = accept_result?;
                let io = TokioIo::new(stream);
                let shared = shared.clone();
                let cursor: Cursor = Arc::new(Mutex::new(None));

                // Spawn a tokio task to serve multiple connections concurrently
                tokio::task::spawn(async move {
                    if let Err(err) = http1::Builder::new()
                        .serve_connection(
                            io,
                            service_fn(|req| {
                                let shared = shared.clone();
                                let cursor = cursor.clone();
                                async move {
                                    Ok::<_, anyhow::Error>(
                                        handle_request(req, shared, cursor).await.unwrap_or_else(|e| {
                                            error!("Request handling failed: {e}");
                                            internal_error()
                                        }),
                                    )
                                }
                            }),
                        )
                        .await
                    {
                        error!("Error serving connection: {err}");
                    }
                });
            }
            // Handle SIGTERM
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
                return Ok(());
            }
            // Handle SIGINT
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down");
                return Ok(());
            }
        }
    }
}

fn internal_error() -> Response<Body> {
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .body(
            Full::new(Bytes::from(&b"Internal Server Error"[..]))
                .map_err(|e| match e {})
                .boxed(),
        )
        .unwrap_or_else(|_| {
            // Last resort if even error response building fails
            Response::new(
                Full::new(Bytes::from(&b"Error"[..]))
                    .map_err(|e| match e {})
                    .boxed(),
            )
        })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = config::load_config(args.config_path);
    let log_level = config::get_log_level(&config);
    simple_logger::init_with_level(log_level)?;
    info!("Log level set to: {:?}", log_level);

    // A broken config file is not fatal: env vars and defaults still apply.
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            warn!("Ignoring config file: {e:#}");
            None
        }
    };

    info!("Starting nsfd-probe");
    let result = run_probe(config, args.pid_path.clone()).await;

    // Cleanup PID file on exit, however the server stopped
    if let Some(path) = args.pid_path {
        remove_pid_file(&path);
    }

    result
}

#[cfg(test)]
#[allow(clippy::panic)] // Tests are allowed to use panic for test failures
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_write_pid_file_creates_file_with_correct_pid() {
        let temp_dir =
            TempDir::new().unwrap_or_else(|e| panic!("Failed to create temp dir: {}", e));
        let pid_path = temp_dir.path().join("test.pid");

        write_pid_file(&pid_path).unwrap_or_else(|e| panic!("Failed to write PID file: {}", e));

        let content = fs::read_to_string(&pid_path)
            .unwrap_or_else(|e| panic!("Failed to read PID file: {}", e));
        let written_pid: u32 = content
            .trim()
            .parse()
            .unwrap_or_else(|e| panic!("Failed to parse PID: {}", e));
        assert_eq!(
            written_pid,
            std::process::id(),
            "PID file should contain current process ID"
        );
    }

    #[test]
    fn test_write_pid_file_creates_parent_directories() {
        let temp_dir =
            TempDir::new().unwrap_or_else(|e| panic!("Failed to create temp dir: {}", e));
        let nested_path = temp_dir.path().join("nested").join("dirs").join("test.pid");

        write_pid_file(&nested_path).unwrap_or_else(|e| panic!("Failed to write PID file: {}", e));

        assert!(
            nested_path.exists(),
            "PID file should exist in nested directory"
        );
    }

    #[test]
    fn test_remove_pid_file_handles_nonexistent() {
        let temp_dir =
            TempDir::new().unwrap_or_else(|e| panic!("Failed to create temp dir: {}", e));
        let nonexistent_path = temp_dir.path().join("nonexistent.pid");

        // Should not panic
        remove_pid_file(&nonexistent_path);
        assert!(!nonexistent_path.exists());
    }

    #[test]
    fn test_setup_socket_is_owner_only() {
        let temp_dir =
            TempDir::new().unwrap_or_else(|e| panic!("Failed to create temp dir: {}", e));
        let socket_path = temp_dir.path().join("run").join("nsfd.sock");
        let socket_path = socket_path.to_string_lossy().into_owned();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap_or_else(|e| panic!("{e}"));
        let _guard = runtime.enter();
        let _sock = setup_socket(&socket_path, "no-such-nsfd-user", None)
            .unwrap_or_else(|e| panic!("Failed to set up socket: {e}"));

        let mode = fs::metadata(&socket_path)
            .unwrap_or_else(|e| panic!("{e}"))
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_parse_chunk_query() {
        assert_eq!(parse_chunk_query(None), Ok(None));
        assert_eq!(parse_chunk_query(Some("")), Ok(None));
        assert_eq!(
            parse_chunk_query(Some("offset=4096&count=512")),
            Ok(Some(Chunk {
                offset: 4096,
                count: 512
            }))
        );
        assert_eq!(
            parse_chunk_query(Some("count=1&offset=0")),
            Ok(Some(Chunk {
                offset: 0,
                count: 1
            }))
        );
    }

    #[test]
    fn test_parse_chunk_query_rejects_bad_input() {
        assert!(parse_chunk_query(Some("offset=1")).is_err());
        assert!(parse_chunk_query(Some("offset=-1&count=2")).is_err());
        assert!(parse_chunk_query(Some("offset=1&count=2&pid=3")).is_err());
        assert!(parse_chunk_query(Some("offset")).is_err());
    }
}
