use std::{fmt, io, net::SocketAddr};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};

use crate::porthole::tracker::ConnGuard;

/// Direction of a single copy inside a relay pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Public peer -> local service.
    Ingress,
    /// Local service -> public peer.
    Egress,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Ingress => write!(f, "public->local"),
            Direction::Egress => write!(f, "local->public"),
        }
    }
}

/// How a relay pair ended.
///
/// `first` is the direction whose copy finished first and decided the outcome;
/// the byte totals cover both directions up to that point.
#[derive(Debug)]
pub struct RelayOutcome {
    pub first: Direction,
    pub ingress: u64,
    pub egress: u64,
    pub result: io::Result<()>,
}

const COPY_BUF_SIZE: usize = 16 * 1024;

/// Relay worker for one accepted public connection.
///
/// Dials the local service, pairs the two streams and copies until either side
/// is done. Nothing is returned: failures only affect this connection and are
/// logged here. The guard keeps the connection counted until this returns.
pub async fn handle(
    mut public: TcpStream,
    local_addr: SocketAddr,
    conn_id: String,
    _guard: ConnGuard,
) {
    let client = public
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();

    let local = match TcpStream::connect(local_addr).await {
        Ok(s) => s,
        Err(err) => {
            metrics::counter!("porthole_dial_failures_total").increment(1);
            tracing::warn!(
                conn = %conn_id,
                client = %client,
                local = %local_addr,
                err = %err,
                "relay: local dial failed"
            );
            let _ = public.shutdown().await;
            return;
        }
    };

    tracing::debug!(conn = %conn_id, client = %client, local = %local_addr, "relay: paired");

    let outcome = relay_pair(public, local).await;
    metrics::counter!("porthole_bytes_ingress_total").increment(outcome.ingress);
    metrics::counter!("porthole_bytes_egress_total").increment(outcome.egress);

    match outcome.result {
        Ok(()) => {
            tracing::debug!(
                conn = %conn_id,
                client = %client,
                first = %outcome.first,
                ingress = outcome.ingress,
                egress = outcome.egress,
                "relay: closed"
            );
        }
        Err(err) => {
            tracing::debug!(
                conn = %conn_id,
                client = %client,
                first = %outcome.first,
                ingress = outcome.ingress,
                egress = outcome.egress,
                err = %err,
                "relay: ended with error"
            );
        }
    }
}

/// Copies bytes both ways between `public` and `local` until the first
/// direction reaches EOF or fails, then closes both streams.
///
/// A half-close from one peer ends the whole pair; bytes still in flight on
/// the other direction may be dropped.
pub async fn relay_pair(public: TcpStream, local: TcpStream) -> RelayOutcome {
    let (mut public_rd, mut public_wr) = public.into_split();
    let (mut local_rd, mut local_wr) = local.into_split();

    // Totals live outside the copy futures so the losing direction keeps its count.
    let mut ingress = 0u64;
    let mut egress = 0u64;

    let (first, result) = tokio::select! {
        res = copy_counted(&mut public_rd, &mut local_wr, &mut ingress) => {
            (Direction::Ingress, res)
        }
        res = copy_counted(&mut local_rd, &mut public_wr, &mut egress) => {
            (Direction::Egress, res)
        }
    };

    // Best-effort; the halves are dropped right after, which closes the sockets.
    let _ = public_wr.shutdown().await;
    let _ = local_wr.shutdown().await;

    RelayOutcome {
        first,
        ingress,
        egress,
        result,
    }
}

/// Like `tokio::io::copy`, but adds to `total` after every chunk written.
async fn copy_counted<R, W>(reader: &mut R, writer: &mut W, total: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            writer.flush().await?;
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        *total += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use tokio::net::TcpListener;

    use super::*;
    use crate::porthole::tracker::ConnTracker;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), ln.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn relay_pair_copies_both_ways_in_order() {
        // peer <-> public ... relay ... local <-> service
        let (mut peer, public) = socket_pair().await;
        let (local, mut service) = socket_pair().await;

        let relay = tokio::spawn(relay_pair(public, local));

        peer.write_all(b"ping").await.unwrap();
        peer.write_all(b"-1-2-3").await.unwrap();
        let mut got = [0u8; 10];
        service.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"ping-1-2-3");

        service.write_all(b"pong").await.unwrap();
        let mut got = [0u8; 4];
        peer.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"pong");

        drop(peer);
        let outcome = tokio::time::timeout(Duration::from_secs(2), relay)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.first, Direction::Ingress);
        assert!(outcome.result.is_ok());
        assert_eq!(outcome.ingress, 10);
        assert_eq!(outcome.egress, 4);

        // The service side sees the pair torn down.
        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(2), service.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn relay_pair_ends_when_local_side_closes() {
        let (mut peer, public) = socket_pair().await;
        let (local, service) = socket_pair().await;

        let relay = tokio::spawn(relay_pair(public, local));
        drop(service);

        let outcome = tokio::time::timeout(Duration::from_secs(2), relay)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.first, Direction::Egress);
        assert_eq!(outcome.ingress, 0);
        assert_eq!(outcome.egress, 0);

        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(2), peer.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn relay_pair_counts_the_direction_that_lost_the_race() {
        let (mut peer, public) = socket_pair().await;
        let (local, mut service) = socket_pair().await;

        let relay = tokio::spawn(relay_pair(public, local));

        peer.write_all(b"hello").await.unwrap();
        let mut got = [0u8; 5];
        service.read_exact(&mut got).await.unwrap();

        service.write_all(b"0123456789").await.unwrap();
        let mut got = [0u8; 10];
        peer.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"0123456789");

        // Public side closes first; the local->public copy is the one abandoned.
        drop(peer);
        let outcome = tokio::time::timeout(Duration::from_secs(2), relay)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.first, Direction::Ingress);
        assert_eq!(outcome.ingress, 5);
        assert_eq!(outcome.egress, 10);
    }

    #[tokio::test]
    async fn dial_failure_closes_public_and_releases_guard() {
        // Reserve a port, then free it so nothing is listening there.
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);

        let tracker = Arc::new(ConnTracker::new());
        let (mut peer, public) = socket_pair().await;

        let guard = tracker.track();
        assert_eq!(tracker.live(), 1);
        tokio::time::timeout(
            Duration::from_secs(2),
            handle(public, dead_addr, "c-test".into(), guard),
        )
        .await
        .unwrap();
        assert_eq!(tracker.live(), 0);

        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(2), peer.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[test]
    fn direction_display() {
        assert_eq!(Direction::Ingress.to_string(), "public->local");
        assert_eq!(Direction::Egress.to_string(), "local->public");
    }
}
