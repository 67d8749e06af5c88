use std::{
    fmt, io,
    time::{Duration, Instant},
};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::sokken::tunnel::error::TunnelError;

const BUFFER_SIZE: usize = 16 * 1024;

/// Upper bound on closing each side once the relay is over; a peer that stopped
/// reading must not keep the session alive.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    AToB,
    BToA,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::AToB => write!(f, "a->b"),
            Direction::BToA => write!(f, "b->a"),
        }
    }
}

#[derive(Debug)]
pub struct RelayStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
    pub elapsed: Duration,
    /// The direction whose copy finished first and ended the session.
    pub ended_by: Direction,
    /// Set when that copy stopped on an I/O error rather than EOF. Informational only.
    pub error: Option<TunnelError>,
}

/// Copies `a -> b` and `b -> a` concurrently until either direction stops.
///
/// As soon as one copy finishes (EOF or error) the other one is dropped and both
/// streams are shut down and released, so a half that is still blocked can never
/// hold the session open. Each direction moves data through one fixed-size buffer.
pub async fn relay<A, B>(a: A, b: B) -> RelayStats
where
    A: AsyncRead + AsyncWrite + Send + Unpin,
    B: AsyncRead + AsyncWrite + Send + Unpin,
{
    let start = Instant::now();

    let (mut a_rd, mut a_wr) = tokio::io::split(a);
    let (mut b_rd, mut b_wr) = tokio::io::split(b);

    let mut a_to_b = 0u64;
    let mut b_to_a = 0u64;

    let (ended_by, res) = {
        let up = pump(&mut a_rd, &mut b_wr, &mut a_to_b);
        let down = pump(&mut b_rd, &mut a_wr, &mut b_to_a);
        tokio::pin!(up, down);

        tokio::select! {
            res = &mut up => (Direction::AToB, res),
            res = &mut down => (Direction::BToA, res),
        }
    };

    let _ = tokio::time::timeout(CLOSE_TIMEOUT, a_wr.shutdown()).await;
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, b_wr.shutdown()).await;
    drop((a_rd, a_wr, b_rd, b_wr));

    RelayStats {
        a_to_b,
        b_to_a,
        elapsed: start.elapsed(),
        ended_by,
        error: res.err().map(TunnelError::RelayIo),
    }
}

async fn pump<R, W>(rd: &mut R, wr: &mut W, moved: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let n = rd.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        wr.write_all(&buf[..n]).await?;
        wr.flush().await?;
        *moved += n as u64;
    }
}
