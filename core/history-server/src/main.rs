//! history-server: line-delimited JSON front end for session history tracking.
//!
//! Reads one request per line from stdin and writes exactly one response per
//! line to stdout. Malformed or failing requests produce error frames; the
//! process only exits when stdin closes.

mod dispatch;
mod logging;

use clap::Parser;
use history_core::{HistoryService, StorageConfig};
use history_protocol::{ErrorInfo, Request, Response, MAX_REQUEST_BYTES};
use std::io::{self, BufRead, Read, Write};
use std::path::PathBuf;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "history-server")]
#[command(about = "Session history tracker for AI coding-assistant CLIs")]
#[command(version)]
struct Cli {
    /// Project directory sessions are keyed on (default: current directory)
    #[arg(long, value_name = "PATH")]
    directory: Option<PathBuf>,

    /// Primary session root (overrides HISTORY_STORAGE_ROOT)
    #[arg(long, value_name = "PATH")]
    storage_root: Option<PathBuf>,

    /// Mirror session root (overrides HISTORY_BACKUP_ROOT)
    #[arg(long, value_name = "PATH")]
    backup_root: Option<PathBuf>,

    /// Hook-driven mode: never reuse sessions implicitly
    #[arg(long)]
    presession: bool,
}

enum Line {
    Request(Vec<u8>),
    TooLarge,
    Eof,
}

fn main() {
    let cli = Cli::parse();

    let storage = storage_config(&cli);
    let _log_guard = logging::init(storage.log_dir());

    let project_dir = match cli.directory.map(Ok).unwrap_or_else(std::env::current_dir) {
        Ok(dir) => dir,
        Err(err) => {
            error!(error = %err, "Failed to resolve project directory");
            std::process::exit(1);
        }
    };

    let service = HistoryService::new(&project_dir, storage).with_presession(cli.presession);
    info!(
        directory = %service.project_dir().display(),
        presession = cli.presession,
        storage_root = %service.storage().storage_root().display(),
        "history-server started"
    );

    let stdin = io::stdin();
    let mut reader = stdin.lock();
    let stdout = io::stdout();
    let mut writer = stdout.lock();

    loop {
        let response = match read_line(&mut reader) {
            Ok(Line::Eof) => break,
            Ok(Line::TooLarge) => Response::error_with_info(
                None,
                ErrorInfo::new("request_too_large", "request exceeded maximum size"),
            ),
            Ok(Line::Request(bytes)) => {
                if bytes.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                match serde_json::from_slice::<Request>(&bytes) {
                    Ok(request) => dispatch::handle_request(request, &service),
                    Err(err) => Response::error(
                        None,
                        "invalid_json",
                        format!("request is not valid JSON: {}", err),
                    ),
                }
            }
            Err(err) => {
                error!(error = %err, "Failed to read from stdin");
                break;
            }
        };

        if let Err(err) = write_response(&mut writer, &response) {
            error!(error = %err, "Failed to write response; stopping");
            break;
        }
    }

    service.shutdown();
    info!("history-server stopped");
}

fn storage_config(cli: &Cli) -> StorageConfig {
    let discovered = StorageConfig::discover();
    if cli.storage_root.is_none() && cli.backup_root.is_none() {
        return discovered;
    }
    StorageConfig::with_roots(
        cli.storage_root
            .clone()
            .unwrap_or_else(|| discovered.storage_root().to_path_buf()),
        cli.backup_root
            .clone()
            .unwrap_or_else(|| discovered.backup_root().to_path_buf()),
    )
}

/// Reads one newline-terminated frame, discarding the rest of any line that
/// exceeds `MAX_REQUEST_BYTES`.
fn read_line<R: BufRead>(reader: &mut R) -> io::Result<Line> {
    let mut buffer = Vec::new();
    let limit = MAX_REQUEST_BYTES as u64 + 1;
    let read = reader.by_ref().take(limit).read_until(b'\n', &mut buffer)?;
    if read == 0 {
        return Ok(Line::Eof);
    }

    if buffer.last() == Some(&b'\n') {
        buffer.pop();
    } else if buffer.len() > MAX_REQUEST_BYTES {
        let mut discarded = Vec::new();
        reader.read_until(b'\n', &mut discarded)?;
        warn!(bytes = buffer.len() + discarded.len(), "Discarded oversized request");
        return Ok(Line::TooLarge);
    }
    Ok(Line::Request(buffer))
}

fn write_response<W: Write>(writer: &mut W, response: &Response) -> io::Result<()> {
    serde_json::to_writer(&mut *writer, response)?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}
