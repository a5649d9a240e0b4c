//! Traffic simulators: a client that streams zeros and reads back the echo,
//! and an observer that drains whatever it is sent.
//!
//! They run on their own thread with a current-thread tokio runtime and share
//! nothing with the engine but sockets.

use crate::transport::Stream;
use bytes::{Bytes, BytesMut};
use std::io;
use std::thread::{self, JoinHandle};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

/// Bytes moved by one simulator run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Traffic {
    pub sent: u64,
    pub echoed: u64,
    pub observed: u64,
}

/// Read until end-of-stream, discarding the data. Returns the byte count.
pub async fn sink<R>(mut reader: R, bufsize: usize) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(bufsize.max(1));
    let mut total = 0u64;
    loop {
        buf.clear();
        let n = reader.read_buf(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        total += n as u64;
    }
}

/// Write zero-filled blocks until `limit` bytes are sent and half-close.
/// Without a limit this never returns successfully.
async fn source<W>(mut writer: W, bufsize: usize, limit: Option<u64>) -> io::Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let block = Bytes::from(vec![0u8; bufsize.max(1)]);
    let mut sent = 0u64;
    loop {
        let chunk = match limit {
            Some(limit) if sent >= limit => break,
            Some(limit) => block.slice(..(limit - sent).min(block.len() as u64) as usize),
            None => block.clone(),
        };
        writer.write_all(&chunk).await?;
        sent += chunk.len() as u64;
    }
    writer.shutdown().await?;
    debug!(sent, "Source finished");
    Ok(sent)
}

/// Stream zeros into `stream` while draining its responses.
///
/// Returns `(sent, received)` once the peer closes after the source stopped.
pub async fn source_and_sink<S>(
    stream: S,
    bufsize: usize,
    limit: Option<u64>,
) -> io::Result<(u64, u64)>
where
    S: AsyncRead + AsyncWrite,
{
    let (reader, writer) = tokio::io::split(stream);
    tokio::try_join!(source(writer, bufsize, limit), sink(reader, bufsize))
}

/// Run the client (on `primary`) and the observer (on `observer`) on a
/// dedicated thread.
pub fn spawn(
    primary: Stream,
    observer: Stream,
    bufsize: usize,
    limit: Option<u64>,
) -> io::Result<JoinHandle<io::Result<Traffic>>> {
    thread::Builder::new()
        .name("simulator".into())
        .spawn(move || -> io::Result<Traffic> {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            runtime.block_on(async move {
                let primary = primary.into_tokio()?;
                let observer = observer.into_tokio()?;
                let ((sent, echoed), observed) = tokio::try_join!(
                    source_and_sink(primary, bufsize, limit),
                    sink(observer, bufsize)
                )?;
                info!(sent, echoed, observed, "Simulators finished");
                Ok::<_, io::Error>(Traffic {
                    sent,
                    echoed,
                    observed,
                })
            })
        })
}
