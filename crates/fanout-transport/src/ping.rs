// Application-level liveness: a 1-byte ping exchanged on a dedicated
// bidirectional stream. The byte value carries no meaning; only arrival
// within the deadline does.
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const PING_BYTE: u8 = b'1';

#[derive(Debug, Clone, Copy)]
pub struct PingerConfig {
    /// Delay between outgoing pings.
    pub interval: Duration,
    /// Read/write deadline; a peer that misses it is considered dead.
    pub timeout: Duration,
}

impl Default for PingerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PingError {
    #[error("network timeout")]
    Timeout,
    #[error("ping stream: {0}")]
    Io(#[source] io::Error),
}

impl PingError {
    fn from_io(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::TimedOut {
            Self::Timeout
        } else {
            Self::Io(err)
        }
    }
}

/// Sends or accepts continuous ping exchanges with a peer.
///
/// Both ends enforce the same `timeout`, so either peer's disappearance is
/// observed by the other as [`PingError::Timeout`] within one deadline of
/// the last successful exchange.
#[derive(Debug, Clone, Copy, Default)]
pub struct Pinger {
    config: PingerConfig,
}

impl Pinger {
    pub fn new(config: PingerConfig) -> Self {
        Self { config }
    }

    /// Write a ping every `interval` and wait for the peer's response.
    /// Serves as a keep-alive and lets the peer know this end is still up.
    /// Returns `Ok(())` when `cancel` fires.
    pub async fn send_pings<R, W>(
        &self,
        cancel: &CancellationToken,
        recv: &mut R,
        send: &mut W,
    ) -> Result<(), PingError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("stopping ping sender, session cancelled");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.config.interval) => {
                    self.send_ping(send).await?;
                    tracing::trace!("sent ping");
                    self.wait_for_ping(recv).await?;
                    tracing::trace!("got response to ping");
                }
            }
        }
    }

    /// Wait for the peer's pings and answer each with one of our own.
    /// Returns `Ok(())` when `cancel` fires.
    pub async fn accept_pings<R, W>(
        &self,
        cancel: &CancellationToken,
        recv: &mut R,
        send: &mut W,
    ) -> Result<(), PingError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("stopping ping acceptor, session cancelled");
                    return Ok(());
                }
                received = self.wait_for_ping(recv) => {
                    received?;
                    tracing::trace!("got ping");
                    self.send_ping(send).await?;
                    tracing::trace!("responded to ping");
                }
            }
        }
    }

    async fn send_ping<W: AsyncWrite + Unpin>(&self, send: &mut W) -> Result<(), PingError> {
        match timeout(self.config.timeout, send.write_all(&[PING_BYTE])).await {
            Ok(result) => result.map_err(PingError::from_io),
            Err(_) => Err(PingError::Timeout),
        }
    }

    async fn wait_for_ping<R: AsyncRead + Unpin>(&self, recv: &mut R) -> Result<(), PingError> {
        let mut buf = [0u8; 1];
        match timeout(self.config.timeout, recv.read_exact(&mut buf)).await {
            Ok(result) => result.map(|_| ()).map_err(PingError::from_io),
            Err(_) => Err(PingError::Timeout),
        }
    }
}

/// Park until the session's ping stream arrives, then ping the peer until
/// the session ends. Any failure cancels the session. A closed channel
/// means the acquisition task already failed and cancelled; exit quietly.
pub async fn send_pings_when_ready(
    cancel: CancellationToken,
    pinger: Pinger,
    stream_rx: oneshot::Receiver<crate::PingStream>,
) {
    let mut stream = tokio::select! {
        _ = cancel.cancelled() => return,
        received = stream_rx => match received {
            Ok(stream) => stream,
            Err(_) => return,
        },
    };
    tracing::info!("starting to send pings");
    if let Err(err) = pinger
        .send_pings(&cancel, &mut stream.recv, &mut stream.send)
        .await
    {
        match err {
            PingError::Timeout => {
                tracing::info!("ping timeout, peer possibly down, shutting session down");
            }
            other => tracing::error!(error = %other, "send pings"),
        }
        cancel.cancel();
    }
}

/// Counterpart of [`send_pings_when_ready`] for the responding side.
/// `timeout_log` names the peer in the timeout log record.
pub async fn accept_pings_when_ready(
    cancel: CancellationToken,
    pinger: Pinger,
    stream_rx: oneshot::Receiver<crate::PingStream>,
    timeout_log: &'static str,
) {
    let mut stream = tokio::select! {
        _ = cancel.cancelled() => return,
        received = stream_rx => match received {
            Ok(stream) => stream,
            Err(_) => return,
        },
    };
    tracing::info!("accepting pings");
    if let Err(err) = pinger
        .accept_pings(&cancel, &mut stream.recv, &mut stream.send)
        .await
    {
        match err {
            PingError::Timeout => tracing::info!("{timeout_log}"),
            other => tracing::error!(error = %other, "accept pings"),
        }
        cancel.cancel();
    }
}
