//! Post-authentication byte relay
//!
//! Once both sides are authenticated the framing is abandoned and the
//! two sockets are spliced: two reader tasks produce owned chunks, a
//! select loop writes each chunk to the opposite side and flushes so
//! interactive command turnaround is not stalled by buffering. Either
//! side reaching EOF or erroring stops both directions; both sockets
//! are closed when the relay returns.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::mpsc;

const CHUNK_SIZE: usize = 512;

/// Pump bytes between the two authenticated sockets until either side
/// closes.
///
/// `client_pending` and `upstream_pending` are bytes the handshake
/// codecs read past the last parsed line; each is forwarded to the
/// opposite side before anything newly read.
pub async fn run<C, U>(
    client: C,
    client_pending: Vec<u8>,
    upstream: U,
    upstream_pending: Vec<u8>,
) -> io::Result<()>
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    U: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_read, mut client_write) = tokio::io::split(client);
    let (upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let (client_tx, mut client_rx) = mpsc::channel::<Vec<u8>>(1);
    let (upstream_tx, mut upstream_rx) = mpsc::channel::<Vec<u8>>(1);

    let client_task = tokio::spawn(read_chunks(client_read, client_pending, client_tx));
    let upstream_task = tokio::spawn(read_chunks(upstream_read, upstream_pending, upstream_tx));

    let result = async {
        loop {
            tokio::select! {
                chunk = client_rx.recv() => match chunk {
                    Some(chunk) => deliver(&mut upstream_write, &chunk).await?,
                    None => return Ok(()),
                },
                chunk = upstream_rx.recv() => match chunk {
                    Some(chunk) => deliver(&mut client_write, &chunk).await?,
                    None => return Ok(()),
                },
            }
        }
    }
    .await;

    client_task.abort();
    upstream_task.abort();

    // Best-effort close so TLS peers see a clean shutdown.
    let _ = client_write.shutdown().await;
    let _ = upstream_write.shutdown().await;

    result
}

async fn deliver<W>(writer: &mut WriteHalf<W>, chunk: &[u8]) -> io::Result<()>
where
    W: AsyncWrite,
{
    writer.write_all(chunk).await?;
    writer.flush().await
}

/// Read ≤512-byte chunks and hand them to the consumer. Each chunk is
/// an independent copy, so the next read cannot mutate bytes in
/// flight. EOF or a read error ends the task; the dropped sender tells
/// the consumer to stop.
async fn read_chunks<R>(mut reader: R, pending: Vec<u8>, tx: mpsc::Sender<Vec<u8>>)
where
    R: AsyncRead + Unpin,
{
    if !pending.is_empty() && tx.send(pending).await.is_err() {
        return;
    }

    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
        }
    }
}
