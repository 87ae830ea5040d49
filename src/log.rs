use std::io;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader as TokioBufReader};
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// 10 MB rotation threshold
pub const LOG_ROTATION_SIZE: u64 = 10 * 1024 * 1024;

/// Keep up to 3 rotated files (.1, .2, .3)
pub const LOG_ROTATION_KEEP: u32 = 3;

const LINE_CHANNEL_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    fn as_str(self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

/// Where a backend's console output ends up.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputSink {
    /// Both streams appended to one file, rotated by size, optionally timestamped.
    File {
        path: PathBuf,
        date_format: Option<String>,
    },
    /// Forwarded line by line to the daemon's own log.
    Tracing,
}

type OutputLine = (OutputStream, String);

// ---------------------------------------------------------------------------
// rotate_log: shift rotated files and rename current to .1
// ---------------------------------------------------------------------------

pub async fn rotate_log(path: &Path, max_rotations: u32) -> io::Result<()> {
    let oldest = rotated_path(path, max_rotations);
    if tokio::fs::try_exists(&oldest).await.unwrap_or(false) {
        tokio::fs::remove_file(&oldest).await?;
    }

    for i in (1..max_rotations).rev() {
        let from = rotated_path(path, i);
        let to = rotated_path(path, i + 1);
        if tokio::fs::try_exists(&from).await.unwrap_or(false) {
            tokio::fs::rename(&from, &to).await?;
        }
    }

    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        tokio::fs::rename(path, rotated_path(path, 1)).await?;
    }

    Ok(())
}

fn rotated_path(path: &Path, n: u32) -> PathBuf {
    let mut p = path.as_os_str().to_owned();
    p.push(format!(".{n}"));
    p.into()
}

// ---------------------------------------------------------------------------
// spawn_output_copier: tokio tasks that drain piped child output
// ---------------------------------------------------------------------------

/// Drain a child's stdout and stderr into `sink` until both pipes close.
pub fn spawn_output_copier<O, E>(backend: String, stdout: O, stderr: E, sink: OutputSink)
where
    O: tokio::io::AsyncRead + Unpin + Send + 'static,
    E: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
    spawn_line_reader(stdout, OutputStream::Stdout, tx.clone());
    spawn_line_reader(stderr, OutputStream::Stderr, tx);

    tokio::spawn(async move {
        let result = match sink {
            OutputSink::File { path, date_format } => {
                write_to_file(rx, &path, date_format.as_deref()).await
            }
            OutputSink::Tracing => {
                write_to_tracing(&backend, rx).await;
                Ok(())
            }
        };
        if let Err(e) = result {
            tracing::warn!(backend = %backend, "output copier stopped: {e}");
        }
    });
}

fn spawn_line_reader(
    reader: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    stream: OutputStream,
    tx: mpsc::Sender<OutputLine>,
) {
    tokio::spawn(async move {
        let mut reader = TokioBufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\r', '\n'])
                        .to_string();
                    if tx.send((stream, line)).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
}

async fn write_to_tracing(backend: &str, mut rx: mpsc::Receiver<OutputLine>) {
    while let Some((stream, line)) = rx.recv().await {
        tracing::info!(backend = %backend, stream = stream.as_str(), "{line}");
    }
}

async fn write_to_file(
    mut rx: mpsc::Receiver<OutputLine>,
    log_path: &Path,
    date_format: Option<&str>,
) -> io::Result<()> {
    if let Some(parent) = log_path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut file = open_append(log_path).await?;
    let mut byte_count = tokio::fs::metadata(log_path).await?.len();

    while let Some((_, line)) = rx.recv().await {
        let formatted = match date_format {
            Some(fmt) => format!("{} | {line}\n", chrono::Local::now().format(fmt)),
            None => format!("{line}\n"),
        };

        let line_bytes = formatted.as_bytes();
        if byte_count + line_bytes.len() as u64 > LOG_ROTATION_SIZE {
            file.flush().await?;
            drop(file);
            rotate_log(log_path, LOG_ROTATION_KEEP).await?;
            file = open_append(log_path).await?;
            byte_count = 0;
        }

        file.write_all(line_bytes).await?;
        byte_count += line_bytes.len() as u64;
    }

    file.flush().await?;
    Ok(())
}

async fn open_append(path: &Path) -> io::Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
