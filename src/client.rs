//! Client Session — one task per connected frontend, reading its query
//! stream, running it through the [`FrontendFilter`], and writing both
//! backend-relayed replies and spoofed replies back to the socket.

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::backend::BackendHandle;
use crate::error::Result;
use crate::filter::frontend::FrontendFilter;
use crate::framer::MessageFramer;

const OUTBOUND_DEPTH: usize = 64;
const READ_CHUNK: usize = 16 * 1024;

/// Runs one client connection to completion: registers with the backend
/// session, relays frontend messages through the filter, and tears down
/// cleanly (detaching from the backend) however the connection ends.
pub async fn run(id: u64, socket: TcpStream, backend: BackendHandle) {
    let (read_half, write_half) = socket.into_split();
    let (outbound_tx, outbound_rx) = mpsc::channel::<Bytes>(OUTBOUND_DEPTH);

    if let Err(e) = backend.attach(id, outbound_tx.clone()).await {
        tracing::warn!(client_id = id, error = %e, "failed to attach to backend session");
        return;
    }

    let writer = tokio::spawn(run_writer(write_half, outbound_rx));

    let result = run_reader(id, read_half, backend.clone(), outbound_tx).await;
    if let Err(e) = &result {
        tracing::info!(client_id = id, error = %e, "client session ended");
    }

    backend.detach(id).await;
    let _ = writer.await;
}

async fn run_writer(mut write_half: tokio::net::tcp::OwnedWriteHalf, mut rx: mpsc::Receiver<Bytes>) {
    while let Some(bytes) = rx.recv().await {
        if let Err(e) = write_half.write_all(&bytes).await {
            tracing::debug!(error = %e, "client write failed, closing");
            break;
        }
    }
}

async fn run_reader(
    id: u64,
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    backend: BackendHandle,
    outbound_tx: mpsc::Sender<Bytes>,
) -> Result<()> {
    let mut framer = MessageFramer::new();
    let mut filter = FrontendFilter::new();
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        let n = read_half.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        let msgs = framer.data_received(&buf[..n])?;
        for msg in msgs {
            backend.activate(id).await;
            let action = filter.filter(msg, &backend).await?;

            if let Some(to_backend) = action.to_backend {
                backend.write_to_backend(to_backend).await?;
            }
            if let Some(spoof) = action.spoof {
                // Deferred: lands after this message's synchronous effects
                // but before the next network event.
                tokio::task::yield_now().await;
                if outbound_tx.send(spoof).await.is_err() {
                    return Ok(());
                }
            }
        }
    }
}
