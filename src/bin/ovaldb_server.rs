//! ovaldb server - Unix socket server for an OVAL store
//!
//! Exposes the query contract over a MessagePack protocol so scanners can
//! share one open database.
//!
//! Usage:
//!   ovaldb-server <dialect> <conn> [--socket /tmp/ovaldb.sock] [--batch-size 50]
//!                 [--read-timeout <secs>] [--debug]
//!
//! Protocol:
//!   Request:  [4-byte length BE] [MessagePack payload]
//!   Response: [4-byte length BE] [MessagePack payload]

use std::collections::HashMap;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use ovaldb::models::{Definition, FetchMeta, Root};
use ovaldb::{new_db, Options, OvalError, OvalStore};

const DEFAULT_SOCKET: &str = "/tmp/ovaldb.sock";
const MAX_MESSAGE: usize = 256 * 1024 * 1024;

// ============================================================================
// Wire Protocol Types
// ============================================================================

/// Request from client
#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "camelCase")]
pub enum Request {
    // Queries
    GetByPackName {
        family: String,
        version: String,
        package: String,
        #[serde(default)]
        arch: String,
    },
    GetByCveId {
        family: String,
        version: String,
        #[serde(rename = "cveId")]
        cve_id: String,
        #[serde(default)]
        arch: String,
    },
    GetAdvisories { family: String, version: String },
    CountDefs { family: String, version: String },
    LastModified { family: String, version: String },
    FetchMeta,

    // Ingest
    InsertRoot { root: Root },
    UpsertFetchMeta {
        #[serde(rename = "lastFetchedAt")]
        last_fetched_at: DateTime<Utc>,
    },

    // Control
    Ping,
    Shutdown,
}

/// Response to client
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum Response {
    Ok { ok: bool },
    Error { error: String, locked: bool },
    Definitions { definitions: Vec<Definition> },
    Advisories { advisories: HashMap<String, Vec<String>> },
    Count { count: usize },
    Timestamp { timestamp: String },
    Meta { meta: WireFetchMeta },
    Pong { pong: bool, version: String, dialect: String },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireFetchMeta {
    pub revision: String,
    pub schema_version: u32,
    pub last_fetched_at: String,
    pub outdated: bool,
}

impl From<FetchMeta> for WireFetchMeta {
    fn from(meta: FetchMeta) -> Self {
        Self {
            outdated: meta.outdated(),
            revision: meta.revision,
            schema_version: meta.schema_version,
            last_fetched_at: format_time(&meta.last_fetched_at),
        }
    }
}

fn format_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

// ============================================================================
// Request Handler
// ============================================================================

fn error_response(err: OvalError) -> Response {
    Response::Error {
        locked: err.is_locked(),
        error: err.to_string(),
    }
}

fn respond<T>(result: ovaldb::Result<T>, ok: impl FnOnce(T) -> Response) -> Response {
    match result {
        Ok(v) => ok(v),
        Err(e) => error_response(e),
    }
}

fn handle_request(db: &dyn OvalStore, request: Request) -> Response {
    match request {
        Request::GetByPackName { family, version, package, arch } => respond(
            db.get_by_package_name(&family, &version, &package, &arch),
            |definitions| Response::Definitions { definitions },
        ),
        Request::GetByCveId { family, version, cve_id, arch } => respond(
            db.get_by_cve_id(&family, &version, &cve_id, &arch),
            |definitions| Response::Definitions { definitions },
        ),
        Request::GetAdvisories { family, version } => respond(
            db.get_advisories(&family, &version),
            |advisories| Response::Advisories { advisories },
        ),
        Request::CountDefs { family, version } => {
            respond(db.count_defs(&family, &version), |count| Response::Count { count })
        }
        Request::LastModified { family, version } => respond(db.last_modified(&family, &version), |t| {
            Response::Timestamp { timestamp: format_time(&t) }
        }),
        Request::FetchMeta => respond(db.fetch_meta(), |meta| Response::Meta { meta: meta.into() }),

        Request::InsertRoot { root } => {
            tracing::info!(family = %root.family, version = %root.os_version, definitions = root.definitions.len(), "insert root");
            respond(db.insert_root(&root), |()| Response::Ok { ok: true })
        }
        Request::UpsertFetchMeta { last_fetched_at } => respond(
            db.upsert_fetch_meta(&FetchMeta::new(last_fetched_at)),
            |()| Response::Ok { ok: true },
        ),

        Request::Ping => Response::Pong {
            pong: true,
            version: env!("CARGO_PKG_VERSION").to_string(),
            dialect: db.name().to_string(),
        },
        // Handled by the client loop after the reply is sent
        Request::Shutdown => Response::Ok { ok: true },
    }
}

// ============================================================================
// Client Connection Handler
// ============================================================================

fn read_message(stream: &mut UnixStream) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Message too large: {} bytes", len),
        ));
    }

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;
    Ok(Some(buf))
}

fn write_message(stream: &mut UnixStream, data: &[u8]) -> std::io::Result<()> {
    let len = u32::try_from(data.len())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "response too large"))?;
    stream.write_all(&len.to_be_bytes())?;
    stream.write_all(data)?;
    stream.flush()
}

fn shutdown(db: &dyn OvalStore, socket_path: &str) -> ! {
    if let Err(e) = db.close() {
        tracing::error!(error = %e, "close failed");
    }
    let _ = std::fs::remove_file(socket_path);
    tracing::info!("Exiting");
    std::process::exit(0);
}

fn handle_client(mut stream: UnixStream, db: Arc<dyn OvalStore>, client_id: usize, socket_path: Arc<str>) {
    tracing::debug!(client_id, "client connected");

    loop {
        let msg = match read_message(&mut stream) {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                tracing::debug!(client_id, "client disconnected");
                break;
            }
            Err(e) => {
                tracing::warn!(client_id, error = %e, "read error");
                break;
            }
        };

        let request: Request = match rmp_serde::from_slice(&msg) {
            Ok(req) => req,
            Err(e) => {
                let response = Response::Error {
                    error: format!("Invalid request: {}", e),
                    locked: false,
                };
                if let Ok(bytes) = rmp_serde::to_vec_named(&response) {
                    let _ = write_message(&mut stream, &bytes);
                }
                continue;
            }
        };

        let is_shutdown = matches!(request, Request::Shutdown);
        let response = handle_request(db.as_ref(), request);

        let resp_bytes = match rmp_serde::to_vec_named(&response) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(error = %e, "serialize error");
                continue;
            }
        };

        if let Err(e) = write_message(&mut stream, &resp_bytes) {
            tracing::warn!(client_id, error = %e, "write error");
            break;
        }

        if is_shutdown {
            tracing::info!(client_id, "Shutdown requested");
            shutdown(db.as_ref(), &socket_path);
        }
    }
}

// ============================================================================
// Main
// ============================================================================

struct Args {
    dialect: String,
    conn: String,
    socket: String,
    debug: bool,
    options: Options,
}

fn flag_value<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
}

fn parse_args(args: &[String]) -> anyhow::Result<Args> {
    if args.len() < 3 {
        bail!(
            "Usage: ovaldb-server <dialect> <conn> [--socket <path>] [--batch-size <n>] [--read-timeout <secs>] [--debug]\n\n\
             Arguments:\n  \
             <dialect>        sqlite3 | mysql | postgres | sled\n  \
             <conn>           file path, directory or connection URL\n  \
             --socket         Unix socket path (default: {})\n  \
             --batch-size     rows per insert batch\n  \
             --read-timeout   per-read deadline for the sled dialect, seconds\n  \
             --debug          verbose logging",
            DEFAULT_SOCKET
        );
    }

    let mut options = Options::from_env().context("reading OVALDB_* environment")?;
    if let Some(v) = flag_value(args, "--batch-size") {
        options = options.batch_size(v.parse().with_context(|| format!("invalid --batch-size {:?}", v))?);
    }
    if let Some(v) = flag_value(args, "--read-timeout") {
        let secs: u64 = v.parse().with_context(|| format!("invalid --read-timeout {:?}", v))?;
        options = options.kv_read_timeout(Duration::from_secs(secs));
    }

    Ok(Args {
        dialect: args[1].clone(),
        conn: args[2].clone(),
        socket: flag_value(args, "--socket").unwrap_or(DEFAULT_SOCKET).to_string(),
        debug: args.iter().any(|a| a == "--debug"),
        options,
    })
}

fn init_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env("OVALDB_LOG").unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> anyhow::Result<()> {
    let argv: Vec<String> = std::env::args().collect();
    let args = parse_args(&argv)?;
    init_logging(args.debug);

    // Remove stale socket file
    let _ = std::fs::remove_file(&args.socket);

    tracing::info!(dialect = %args.dialect, conn = %args.conn, "Opening database");
    let db: Arc<dyn OvalStore> = match new_db(&args.dialect, &args.conn, args.debug, args.options) {
        Ok(db) => Arc::from(db),
        Err(e) if e.is_locked() => bail!("database {} is locked by another process: {}", args.conn, e),
        Err(e) => return Err(e).context("failed to open database"),
    };

    let meta = db.fetch_meta().context("failed to read FetchMeta")?;
    if meta.outdated() {
        tracing::warn!(schema_version = meta.schema_version, "database schema is outdated, fetch again");
    }
    tracing::info!(revision = %meta.revision, last_fetched_at = %format_time(&meta.last_fetched_at), "Database opened");

    let listener = UnixListener::bind(&args.socket).with_context(|| format!("failed to bind {}", args.socket))?;
    tracing::info!(socket = %args.socket, "Listening");
    let socket_path: Arc<str> = Arc::from(args.socket.as_str());

    let mut signals = signal_hook::iterator::Signals::new([signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM])
        .context("failed to register signal handlers")?;
    let db_for_signal = Arc::clone(&db);
    let socket_for_signal = Arc::clone(&socket_path);
    thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            tracing::info!(signal = sig, "Received signal, closing database");
            shutdown(db_for_signal.as_ref(), &socket_for_signal);
        }
    });

    let mut client_id = 0;
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                client_id += 1;
                let db = Arc::clone(&db);
                let socket_path = Arc::clone(&socket_path);
                thread::spawn(move || handle_client(stream, db, client_id, socket_path));
            }
            Err(e) => tracing::warn!(error = %e, "accept error"),
        }
    }
    Ok(())
}
