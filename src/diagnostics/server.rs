//! # Observer Socket
//!
//! Exposes the [`LogHub`] on a Unix domain socket. Each connection gets its
//! own [`ClientHandle`]; inbound lines are JSON [`WireFrame`]s, outbound
//! lines are the `log` / `log_ring` frames the hub sends to that handle.

use std::path::{Path, PathBuf};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::hub::LogHub;
use super::protocol::{ClientHandle, Message, WireFrame};
use crate::error::Result;

/// Unix socket front end for the diagnostic hub.
#[derive(Debug)]
pub struct ObserverServer {
    listener: UnixListener,
    socket_path: PathBuf,
    hub: LogHub,
    queue_capacity: usize,
}

impl ObserverServer {
    /// Binds the socket, replacing a stale socket file left by a previous run.
    ///
    /// # Errors
    ///
    /// Returns error if the parent directory cannot be created or the socket
    /// cannot be bound.
    pub fn bind<P: AsRef<Path>>(path: P, hub: LogHub, queue_capacity: usize) -> Result<Self> {
        let socket_path = path.as_ref().to_path_buf();
        if let Some(parent) = socket_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)?;
        }

        let listener = UnixListener::bind(&socket_path)?;
        info!("Observer socket listening at {}", socket_path.display());

        Ok(Self {
            listener,
            socket_path,
            hub,
            queue_capacity,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accepts observers until `shutdown` flips to `true`, then removes the
    /// socket file.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accept = self.listener.accept() => {
                    match accept {
                        Ok((stream, _addr)) => {
                            let hub = self.hub.clone();
                            let capacity = self.queue_capacity;
                            tokio::spawn(async move {
                                serve_observer(stream, hub, capacity).await;
                            });
                        }
                        Err(e) => warn!("Observer accept failed: {}", e),
                    }
                }
            }
        }

        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            debug!("Could not remove {}: {}", self.socket_path.display(), e);
        }
        info!("Observer socket closed");
    }
}

async fn serve_observer(stream: UnixStream, hub: LogHub, capacity: usize) {
    let (read_half, write_half) = stream.into_split();
    let (handle, outbound) = ClientHandle::channel(capacity);
    debug!(client = handle.id(), "Observer connected");

    let writer = tokio::spawn(write_frames(write_half, outbound));

    let mut lines = BufReader::new(read_half).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<WireFrame>(line) {
                    Ok(frame) => hub.handle_message(frame.into_message(handle.clone())),
                    Err(e) => debug!(client = handle.id(), "Ignoring malformed frame: {}", e),
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(client = handle.id(), "Observer read failed: {}", e);
                break;
            }
        }
    }

    hub.handle_message(Message::UnregisterClient { reply_to: handle.clone() });
    writer.abort();
    debug!(client = handle.id(), "Observer disconnected");
}

async fn write_frames(mut writer: OwnedWriteHalf, mut outbound: mpsc::Receiver<Message>) {
    while let Some(message) = outbound.recv().await {
        let Some(frame) = WireFrame::from_message(message) else {
            continue;
        };
        let mut line = match serde_json::to_string(&frame) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to encode observer frame: {}", e);
                continue;
            }
        };
        line.push('\n');
        if writer.write_all(line.as_bytes()).await.is_err() {
            // Dropping the receiver closes the handle; the hub prunes it.
            break;
        }
    }
}

/// Observer side of the socket protocol.
#[derive(Debug)]
pub struct ObserverSession {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl ObserverSession {
    /// Connects to an observer socket and registers for diagnostics.
    ///
    /// # Errors
    ///
    /// Returns error if the socket cannot be reached or the registration frame
    /// cannot be written.
    pub async fn attach<P: AsRef<Path>>(path: P) -> Result<Self> {
        let stream = UnixStream::connect(path).await?;
        let (read_half, writer) = stream.into_split();
        let mut session = Self {
            lines: BufReader::new(read_half).lines(),
            writer,
        };
        session.send(&WireFrame::RegisterClient).await?;
        Ok(session)
    }

    /// Next frame from the agent, or `None` once the agent closes the socket.
    pub async fn next_frame(&mut self) -> Result<Option<WireFrame>> {
        match self.lines.next_line().await? {
            Some(line) => Ok(Some(serde_json::from_str(&line)?)),
            None => Ok(None),
        }
    }

    /// Unregisters and closes the session.
    pub async fn detach(mut self) -> Result<()> {
        self.send(&WireFrame::UnregisterClient).await?;
        self.writer.shutdown().await?;
        Ok(())
    }

    async fn send(&mut self, frame: &WireFrame) -> Result<()> {
        let mut line = serde_json::to_string(frame)?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        Ok(())
    }
}
