//! Bidirectional relay between a proxied client stream and its upstream.
//!
//! Each direction is copied independently. EOF or an error in one direction
//! half-closes the opposite write side while the other direction keeps
//! draining. A shared activity clock enforces an idle timeout across both
//! directions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::trace;
use tokio::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Bytes moved in each direction, reported with every outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub to_upstream: u64,
    pub to_client: u64,
}

/// How a relay ended.
#[derive(Debug)]
pub enum RelayOutcome {
    /// Both directions reached EOF.
    Complete(RelayStats),
    /// Neither direction moved bytes within the idle timeout.
    IdleTimeout(RelayStats),
    /// One direction failed; the other was torn down with it.
    Error(RelayStats, std::io::Error),
}

struct Activity {
    start: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Activity {
            start: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.start.elapsed().as_millis() as u64;
        self.last_ms.store(now, Ordering::Relaxed);
    }

    fn idle(&self) -> Duration {
        let now = self.start.elapsed().as_millis() as u64;
        let last = self.last_ms.load(Ordering::Relaxed);
        Duration::from_millis(now.saturating_sub(last))
    }
}

/// Copy bytes both ways until both directions finish or the idle timeout
/// fires.
pub async fn relay<C, U>(client: C, upstream: U, idle_timeout: Duration) -> RelayOutcome
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_r, mut client_w) = tokio::io::split(client);
    let (mut upstream_r, mut upstream_w) = tokio::io::split(upstream);

    let activity = Arc::new(Activity::new());
    let to_upstream = Arc::new(AtomicU64::new(0));
    let to_client = Arc::new(AtomicU64::new(0));

    let up = copy_half(&mut client_r, &mut upstream_w, &to_upstream, &activity);
    let down = copy_half(&mut upstream_r, &mut client_w, &to_client, &activity);
    tokio::pin!(up, down);

    let mut up_result: Option<std::io::Result<()>> = None;
    let mut down_result: Option<std::io::Result<()>> = None;

    let stats = |tu: &AtomicU64, tc: &AtomicU64| RelayStats {
        to_upstream: tu.load(Ordering::Relaxed),
        to_client: tc.load(Ordering::Relaxed),
    };

    loop {
        tokio::select! {
            r = &mut up, if up_result.is_none() => up_result = Some(r),
            r = &mut down, if down_result.is_none() => down_result = Some(r),
            _ = tokio::time::sleep(Duration::from_secs(1)) => {
                if activity.idle() >= idle_timeout {
                    trace!("relay idle for {:?}, closing both ends", idle_timeout);
                    return RelayOutcome::IdleTimeout(stats(&to_upstream, &to_client));
                }
                continue;
            }
        }
        if up_result.is_some() && down_result.is_some() {
            let s = stats(&to_upstream, &to_client);
            let err = up_result
                .take()
                .and_then(Result::err)
                .or_else(|| down_result.take().and_then(Result::err));
            return match err {
                Some(e) => RelayOutcome::Error(s, e),
                None => RelayOutcome::Complete(s),
            };
        }
    }
}

/// One copy direction. Half-closes the write side on exit so the far reader
/// sees EOF even while the opposite direction keeps flowing.
async fn copy_half<R, W>(
    reader: &mut R,
    writer: &mut W,
    count: &AtomicU64,
    activity: &Activity,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 16 * 1024];
    let result = loop {
        match reader.read(&mut buf).await {
            Ok(0) => break Ok(()),
            Ok(n) => {
                if let Err(e) = writer.write_all(&buf[..n]).await {
                    break Err(e);
                }
                count.fetch_add(n as u64, Ordering::Relaxed);
                activity.touch();
            }
            Err(e) => break Err(e),
        }
    };
    let _ = writer.shutdown().await;
    result
}
