//! Interactive PTY sessions
//!
//! A second data-plane mode on the same transport: a shell channel bound to
//! an external byte-stream consumer. One pump task owns the SSH channel and
//! is the only writer toward consumers, so stdout and stderr can never
//! interleave mid-buffer even though both arrive concurrently.

use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

use crate::ssh::SshError;

/// Input toward the remote shell.
#[derive(Debug)]
pub enum PtyInput {
    /// Bytes for the shell's stdin.
    Data(Vec<u8>),
    /// Window-change request.
    Resize { cols: u32, rows: u32 },
    /// Close the channel; consumers observe end-of-stream.
    Close,
}

/// Output from the remote shell.
#[derive(Debug, Clone)]
pub enum PtyOutput {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Exit(u32),
}

/// A live shell with an allocated PTY.
///
/// Owned by one external consumer; destroyed when the consumer closes or
/// the transport dies.
pub struct PtySession {
    id: String,
    term: String,
    input_tx: mpsc::Sender<PtyInput>,
    output_tx: broadcast::Sender<PtyOutput>,
}

impl PtySession {
    /// Spawn the pump task over an established shell channel.
    pub(crate) fn spawn(channel: Channel<Msg>, term: &str, cols: u32, rows: u32) -> Self {
        let (input_tx, input_rx) = mpsc::channel::<PtyInput>(256);
        let (output_tx, _) = broadcast::channel::<PtyOutput>(256);

        let id = uuid::Uuid::new_v4().to_string();
        info!("pty session {} started ({} {}x{})", id, term, cols, rows);

        tokio::spawn(pump(channel, input_rx, output_tx.clone(), id.clone()));

        Self {
            id,
            term: term.to_string(),
            input_tx,
            output_tx,
        }
    }

    /// Test-only session backed by raw channels instead of an SSH channel.
    #[cfg(test)]
    pub(crate) fn detached(
        input_tx: mpsc::Sender<PtyInput>,
        output_tx: broadcast::Sender<PtyOutput>,
    ) -> Self {
        Self {
            id: "detached".to_string(),
            term: "xterm".to_string(),
            input_tx,
            output_tx,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn term(&self) -> &str {
        &self.term
    }

    /// Write bytes to the shell's stdin.
    pub async fn write(&self, data: Vec<u8>) -> Result<(), SshError> {
        self.input_tx
            .send(PtyInput::Data(data))
            .await
            .map_err(|_| SshError::TransportDead)
    }

    /// Deliver a window-change request.
    pub async fn resize(&self, cols: u32, rows: u32) -> Result<(), SshError> {
        self.input_tx
            .send(PtyInput::Resize { cols, rows })
            .await
            .map_err(|_| SshError::TransportDead)
    }

    /// Close the channel. Idempotent; racing a dead session is fine.
    pub async fn close(&self) {
        let _ = self.input_tx.send(PtyInput::Close).await;
    }

    /// Subscribe to shell output. Slow subscribers lag and drop old
    /// buffers; they never stall the pump.
    pub fn subscribe(&self) -> broadcast::Receiver<PtyOutput> {
        self.output_tx.subscribe()
    }

    /// Pump a caller-supplied duplex stream (a websocket bridge, a test
    /// pipe) until the consumer or the session ends. Reads feed stdin;
    /// stdout and stderr are written back serialized.
    pub async fn attach<S>(&self, stream: S)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin,
    {
        let (mut rd, mut wr) = tokio::io::split(stream);
        let mut output_rx = self.subscribe();
        let input_tx = self.input_tx.clone();

        let to_consumer = async {
            loop {
                match output_rx.recv().await {
                    Ok(PtyOutput::Stdout(data)) | Ok(PtyOutput::Stderr(data)) => {
                        if wr.write_all(&data).await.is_err() {
                            break;
                        }
                    }
                    Ok(PtyOutput::Exit(_)) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("pty consumer lagged, {} buffers dropped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            let _ = wr.shutdown().await;
        };

        let from_consumer = async {
            let mut buf = vec![0u8; 8192];
            loop {
                match rd.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if input_tx.send(PtyInput::Data(buf[..n].to_vec())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        };

        tokio::select! {
            _ = to_consumer => {}
            _ = from_consumer => {}
        }
        // Either side ending detaches the consumer; close the shell so the
        // other side observes end-of-stream too.
        self.close().await;
        info!("pty session {} detached", self.id);
    }
}

/// The single owner of the shell channel.
async fn pump(
    mut channel: Channel<Msg>,
    mut input_rx: mpsc::Receiver<PtyInput>,
    output_tx: broadcast::Sender<PtyOutput>,
    id: String,
) {
    loop {
        tokio::select! {
            cmd = input_rx.recv() => {
                match cmd {
                    Some(PtyInput::Data(data)) => {
                        if let Err(e) = channel.data(&data[..]).await {
                            debug!("pty {} stdin write failed: {}", id, e);
                            break;
                        }
                    }
                    Some(PtyInput::Resize { cols, rows }) => {
                        if let Err(e) = channel.window_change(cols, rows, 0, 0).await {
                            debug!("pty {} resize failed: {}", id, e);
                        }
                    }
                    Some(PtyInput::Close) | None => {
                        let _ = channel.eof().await;
                        break;
                    }
                }
            }

            msg = channel.wait() => {
                match msg {
                    Some(ChannelMsg::Data { data }) => {
                        let _ = output_tx.send(PtyOutput::Stdout(data.to_vec()));
                    }
                    Some(ChannelMsg::ExtendedData { data, ext }) => {
                        if ext == 1 {
                            let _ = output_tx.send(PtyOutput::Stderr(data.to_vec()));
                        }
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        let _ = output_tx.send(PtyOutput::Exit(exit_status));
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                        break;
                    }
                    Some(_) => {}
                }
            }
        }
    }

    let _ = channel.close().await;
    info!("pty session {} ended", id);
    // Dropping output_tx ends every subscriber with Closed.
}
