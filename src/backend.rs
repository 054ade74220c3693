//! Backend Session — owns the single connection to the real PostgreSQL
//! backend and the stack of clients currently multiplexed onto it.
//!
//! Runs as its own task (an actor, in the sense that all of its state is
//! private to the task and only reachable through [`BackendHandle`]) so that
//! concurrently running client tasks never need a lock to attach, detach, or
//! activate themselves, or to read authentication/transaction state.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

use crate::error::{ProxyError, Result};
use crate::filter::backend::BackendFilter;
use crate::framer::MessageFramer;
use crate::message::{self, Message, TxStatus};

const COMMAND_CHANNEL_DEPTH: usize = 64;
const READ_CHUNK: usize = 16 * 1024;

struct ClientEntry {
    id: u64,
    outbound: mpsc::Sender<Bytes>,
}

enum BackendCommand {
    Attach {
        id: u64,
        outbound: mpsc::Sender<Bytes>,
        resp: oneshot::Sender<Result<()>>,
    },
    Detach {
        id: u64,
    },
    Activate {
        id: u64,
    },
    SignalTest(bool),
    InTest(oneshot::Sender<bool>),
    TransactionStatus(oneshot::Sender<TxStatus>),
    AuthenticationComplete(oneshot::Sender<bool>),
    AuthSnapshot(oneshot::Sender<Vec<Message>>),
    IgnoreMessages(Vec<u8>),
    WriteToBackend(Bytes),
    Terminate,
}

/// A cheap, cloneable, non-owning reference to a running [`BackendSession`].
///
/// Every client task holds one of these instead of the session itself,
/// which resolves the otherwise-cyclic backend-to-clients/clients-to-backend
/// reference: neither side owns the other, both sides just hold channel
/// endpoints.
#[derive(Clone)]
pub struct BackendHandle {
    tx: mpsc::Sender<BackendCommand>,
    dead: Arc<AtomicBool>,
}

impl BackendHandle {
    pub async fn attach(&self, id: u64, outbound: mpsc::Sender<Bytes>) -> Result<()> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.send(BackendCommand::Attach {
            id,
            outbound,
            resp: resp_tx,
        })
        .await?;
        resp_rx.await.map_err(|_| ProxyError::BackendGone)?
    }

    pub async fn detach(&self, id: u64) {
        let _ = self.tx.send(BackendCommand::Detach { id }).await;
    }

    pub async fn activate(&self, id: u64) {
        let _ = self.tx.send(BackendCommand::Activate { id }).await;
    }

    pub async fn signal_test(&self, active: bool) {
        let _ = self.tx.send(BackendCommand::SignalTest(active)).await;
    }

    pub async fn in_test(&self) -> bool {
        self.request(BackendCommand::InTest).await.unwrap_or(false)
    }

    pub async fn transaction_status(&self) -> TxStatus {
        self.request(BackendCommand::TransactionStatus)
            .await
            .unwrap_or(TxStatus::Idle)
    }

    pub async fn authentication_complete(&self) -> bool {
        self.request(BackendCommand::AuthenticationComplete)
            .await
            .unwrap_or(false)
    }

    pub async fn auth_snapshot(&self) -> Vec<Message> {
        self.request(BackendCommand::AuthSnapshot).await.unwrap_or_default()
    }

    pub async fn ignore_messages(&self, codes: &[u8]) {
        let _ = self
            .tx
            .send(BackendCommand::IgnoreMessages(codes.to_vec()))
            .await;
    }

    pub async fn write_to_backend(&self, data: Bytes) -> Result<()> {
        self.send(BackendCommand::WriteToBackend(data)).await
    }

    pub async fn terminate(&self) {
        let _ = self.tx.send(BackendCommand::Terminate).await;
    }

    async fn send(&self, cmd: BackendCommand) -> Result<()> {
        self.tx.send(cmd).await.map_err(|_| ProxyError::BackendGone)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> BackendCommand,
    ) -> Result<T> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.send(make(resp_tx)).await?;
        resp_rx.await.map_err(|_| ProxyError::BackendGone)
    }

    /// True once the session actor has exited, for any reason. A cached
    /// handle that reports dead must be discarded and the backend re-dialed.
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }
}

/// Spawns the session actor over an already-connected upstream socket and
/// returns a handle to it.
pub async fn spawn(upstream: TcpStream) -> BackendHandle {
    let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_DEPTH);
    let dead = Arc::new(AtomicBool::new(false));
    let handle = BackendHandle { tx, dead: dead.clone() };
    tokio::spawn(async move {
        run(upstream, rx).await;
        dead.store(true, Ordering::Release);
    });
    handle
}

async fn run(upstream: TcpStream, mut commands: mpsc::Receiver<BackendCommand>) {
    let (mut read_half, mut write_half) = upstream.into_split();
    let mut framer = MessageFramer::new();
    let filter = BackendFilter::new();
    let mut clients: Vec<ClientEntry> = Vec::new();
    let mut auth_response: Vec<Message> = Vec::new();
    let mut transaction_status = TxStatus::Idle;
    let mut in_test = false;
    let mut drop_list: VecDeque<u8> = VecDeque::new();
    let mut read_buf = vec![0u8; READ_CHUNK];

    let result: Result<()> = 'session: loop {
        tokio::select! {
            n = read_half.read(&mut read_buf) => {
                let n = match n {
                    Ok(n) => n,
                    Err(e) => break 'session Err(e.into()),
                };
                if n == 0 {
                    tracing::info!("backend connection closed by upstream");
                    break 'session Ok(());
                }
                let msgs = match framer.data_received(&read_buf[..n]) {
                    Ok(m) => m,
                    Err(e) => break 'session Err(e),
                };
                for msg in msgs {
                    match filter.filter(msg, &mut auth_response, &mut transaction_status, &mut drop_list) {
                        Ok(Some(out)) => {
                            if let Some(entry) = clients.last() {
                                if entry.outbound.send(out.serialize()).await.is_err() {
                                    tracing::warn!(client_id = entry.id, "dropping backend message, client writer gone");
                                }
                            } else {
                                tracing::warn!("dropping backend message, no attached client");
                            }
                        }
                        Ok(None) => {}
                        Err(e) => break 'session Err(e),
                    }
                }
            }
            cmd = commands.recv() => {
                let Some(cmd) = cmd else { break 'session Ok(()) };
                match cmd {
                    BackendCommand::Attach { id, outbound, resp } => {
                        if framer.parsing_message() {
                            let _ = resp.send(Err(ProxyError::AttachWhileParsing));
                        } else {
                            clients.push(ClientEntry { id, outbound });
                            let _ = resp.send(Ok(()));
                        }
                    }
                    BackendCommand::Detach { id } => {
                        if framer.parsing_message() {
                            framer.discard_message();
                        }
                        clients.retain(|c| c.id != id);
                    }
                    BackendCommand::Activate { id } => {
                        if let Some(pos) = clients.iter().position(|c| c.id == id) {
                            let entry = clients.remove(pos);
                            clients.push(entry);
                        }
                    }
                    BackendCommand::SignalTest(active) => in_test = active,
                    BackendCommand::InTest(resp) => {
                        let _ = resp.send(in_test);
                    }
                    BackendCommand::TransactionStatus(resp) => {
                        let _ = resp.send(transaction_status);
                    }
                    BackendCommand::AuthenticationComplete(resp) => {
                        let _ = resp.send(matches!(auth_response.last(), Some(Message::ReadyForQuery { .. })));
                    }
                    BackendCommand::AuthSnapshot(resp) => {
                        let _ = resp.send(auth_response.clone());
                    }
                    BackendCommand::IgnoreMessages(codes) => drop_list.extend(codes),
                    BackendCommand::WriteToBackend(bytes) => {
                        if let Err(e) = write_half.write_all(&bytes).await {
                            break 'session Err(e.into());
                        }
                    }
                    BackendCommand::Terminate => {
                        let _ = write_half.write_all(&message::terminate().serialize()).await;
                        break 'session Ok(());
                    }
                }
            }
        }
    };

    if let Err(e) = result {
        tracing::warn!(error = %e, "backend session ended with an error");
    }
}
