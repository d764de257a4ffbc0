//! Byte relay for CONNECT tunnels.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::debug;

use crate::lifecycle::{aborted, ShutdownRx};

const BUFFER_SIZE: usize = 16 * 1024;

/// Bytes moved by a finished tunnel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelStats {
    pub client_to_server: u64,
    pub server_to_client: u64,
}

/// Last time either direction made progress.
struct Activity {
    start: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = self.start.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    fn last(&self) -> Instant {
        self.start + Duration::from_millis(self.last_ms.load(Ordering::Relaxed))
    }

    /// Resolves once nothing has moved for `timeout`.
    async fn idle_for(&self, timeout: Duration) {
        loop {
            let deadline = self.last() + timeout;
            if Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep_until(deadline).await;
        }
    }
}

/// Copies one direction until EOF, then shuts down the write side.
async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    moved: &AtomicU64,
    activity: &Activity,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        activity.touch();
        if n == 0 {
            let _ = writer.shutdown().await;
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        moved.fetch_add(n as u64, Ordering::Relaxed);
        activity.touch();
    }
}

/// Copies bytes both ways until both sides close, the tunnel sits idle for
/// `idle_timeout`, or the server aborts.
///
/// The two directions run concurrently. A half-close on one side is
/// forwarded as a write shutdown to the other. Idle and abort are watched
/// outside the copies, so a peer that stops reading cannot pin the tunnel.
pub(crate) async fn relay<C, S>(
    client: C,
    server: S,
    idle_timeout: Duration,
    mut shutdown: ShutdownRx,
) -> std::io::Result<TunnelStats>
where
    C: AsyncRead + AsyncWrite + Unpin,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (server_read, server_write) = tokio::io::split(server);

    let activity = Activity::new();
    let upstream = AtomicU64::new(0);
    let downstream = AtomicU64::new(0);

    let copy = async {
        tokio::try_join!(
            pump(client_read, server_write, &upstream, &activity),
            pump(server_read, client_write, &downstream, &activity),
        )
    };

    tokio::select! {
        copied = copy => {
            copied?;
        }
        _ = activity.idle_for(idle_timeout) => {
            debug!("Tunnel idle for {:?}, closing", idle_timeout);
        }
        _ = aborted(&mut shutdown) => {
            debug!("Tunnel aborted by shutdown");
        }
    }

    Ok(TunnelStats {
        client_to_server: upstream.load(Ordering::Relaxed),
        server_to_client: downstream.load(Ordering::Relaxed),
    })
}
