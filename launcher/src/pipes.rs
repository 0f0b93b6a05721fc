/// Standard-stream plumbing for the server process.
///
/// Three workers per process:
///   - stdin writer: drains the input queue, one newline-terminated line per command
///   - stdout reader: splits output into lines and republishes them to the correlator
///   - stderr reader: splits error output into lines and logs them with a red marker
///
/// Every worker exits when the process stop signal flips to `true` or when its
/// stream closes. The caller joins the returned handles before treating the
/// process as fully stopped.
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const INPUT_QUEUE: usize = 16;
const OUTPUT_QUEUE: usize = 64;
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

/// Endpoints and worker handles of one process's streams.
pub struct Pipes {
    /// Lines queued here are written to the process's stdin.
    pub input: mpsc::Sender<String>,
    /// Lines read from the process's stdout. Exactly one consumer.
    pub lines: mpsc::Receiver<String>,
    pub handles: Vec<JoinHandle<()>>,
}

/// Spawns the three stream workers.
pub fn start<W, R, E>(stdin: W, stdout: R, stderr: E, stop_rx: &watch::Receiver<bool>) -> Pipes
where
    W: AsyncWrite + Unpin + Send + 'static,
    R: AsyncRead + Unpin + Send + 'static,
    E: AsyncRead + Unpin + Send + 'static,
{
    let (input_tx, input_rx) = mpsc::channel::<String>(INPUT_QUEUE);
    let (lines_tx, lines_rx) = mpsc::channel::<String>(OUTPUT_QUEUE);

    let handles = vec![
        tokio::spawn(write_input(stdin, input_rx, stop_rx.clone())),
        tokio::spawn(read_stdout(stdout, lines_tx, stop_rx.clone())),
        tokio::spawn(read_stderr(stderr, stop_rx.clone())),
    ];

    Pipes {
        input: input_tx,
        lines: lines_rx,
        handles,
    }
}

async fn write_input<W: AsyncWrite + Unpin>(
    mut stdin: W,
    mut rx: mpsc::Receiver<String>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            line = rx.recv() => {
                let Some(line) = line else { break };
                debug!(target: "server::stdin", "> {line}");
                if let Err(e) = write_line(&mut stdin, &line).await {
                    warn!("[stdin] Write failed: {e}");
                    break;
                }
            }
            _ = stopped(&mut stop_rx) => break,
        }
    }
    let _ = stdin.shutdown().await;
    debug!("[stdin] done");
}

async fn write_line<W: AsyncWrite + Unpin>(stdin: &mut W, line: &str) -> std::io::Result<()> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}

async fn read_stdout<R: AsyncRead + Unpin>(
    stdout: R,
    tx: mpsc::Sender<String>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    loop {
        tokio::select! {
            line = next_line(&mut reader, &mut buf) => match line {
                Ok(Some(line)) => {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("[stdout] Read failed: {e}");
                    break;
                }
            },
            _ = stopped(&mut stop_rx) => break,
        }
    }
    debug!("[stdout] done");
}

async fn read_stderr<E: AsyncRead + Unpin>(stderr: E, mut stop_rx: watch::Receiver<bool>) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        tokio::select! {
            line = next_line(&mut reader, &mut buf) => match line {
                Ok(Some(line)) => warn!(target: "server::stderr", "[{RED}Error{RESET}]: {line}"),
                Ok(None) => break,
                Err(e) => {
                    warn!("[stderr] Read failed: {e}");
                    break;
                }
            },
            _ = stopped(&mut stop_rx) => break,
        }
    }
    debug!("[stderr] done");
}

/// Resolves once the stop signal reads `true` or its sender is gone.
pub async fn stopped(stop_rx: &mut watch::Receiver<bool>) {
    let _ = stop_rx.wait_for(|stop| *stop).await;
}

/// Reads one line, decoding lossily so a stray non-UTF-8 byte never stalls
/// the reader (a stalled reader would eventually block the server on a full pipe).
pub async fn next_line<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
    buf: &mut Vec<u8>,
) -> std::io::Result<Option<String>> {
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(None);
    }
    let mut line = String::from_utf8_lossy(buf).into_owned();
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(Some(line))
}
