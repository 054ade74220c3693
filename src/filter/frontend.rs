//! Frontend Filter — rewrites client-issued `BEGIN`/`COMMIT`/`ROLLBACK` (and
//! the `BEGIN TEST`/`ROLLBACK TEST` extension syntax) into savepoint
//! operations against the single shared backend transaction, spoofing the
//! matching replies back to the client without a backend round trip.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use bytes::{Bytes, BytesMut};
use regex::Regex;

use crate::backend::BackendHandle;
use crate::error::Result;
use crate::message::{self, Message, TxStatus};

static SAVEPOINT_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_savepoint_name() -> String {
    let n = SAVEPOINT_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("sp_{}_{}", n / 1_000_000, n % 1_000_000)
}

fn begin_test_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^begin test '([^']*)';?$").unwrap())
}

fn rollback_test_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^rollback test '([^']*)';?$").unwrap())
}

/// What a client session should do with one frontend message after it has
/// passed through the filter.
#[derive(Default)]
pub struct FilterAction {
    /// Bytes to forward to the backend, if any (`None` means drop).
    pub to_backend: Option<Bytes>,
    /// Bytes to write straight back to the originating client, after
    /// yielding once so it lands after the current message's synchronous
    /// effects but before the next network event.
    pub spoof: Option<Bytes>,
}

impl FilterAction {
    fn drop_message() -> Self {
        Self::default()
    }

    fn to_backend(bytes: Bytes) -> Self {
        Self {
            to_backend: Some(bytes),
            spoof: None,
        }
    }

    fn spoof_only(bytes: Bytes) -> Self {
        Self {
            to_backend: None,
            spoof: Some(bytes),
        }
    }
}

fn concat_serialize(msgs: &[Message]) -> Bytes {
    let mut buf = BytesMut::new();
    for m in msgs {
        buf.extend_from_slice(&m.serialize());
    }
    buf.freeze()
}

fn transaction_aborted_messages() -> Vec<Message> {
    vec![
        message::error_response(&[
            (b'S', "ERROR"),
            (b'C', "25P02"),
            (
                b'M',
                "current transaction is aborted, commands ignored until end of transaction block",
            ),
            (b'F', "postgres.c"),
            (b'L', "906"),
            (b'R', "exec_simple_query"),
        ]),
        message::ready_for_query(TxStatus::Failed),
    ]
}

/// Per-client savepoint stack and extension-syntax state. One instance per
/// attached client; never shared.
#[derive(Default)]
pub struct FrontendFilter {
    savepoints: Vec<String>,
}

impl FrontendFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn filter(&mut self, msg: Message, backend: &BackendHandle) -> Result<FilterAction> {
        match &msg {
            Message::Startup { .. } => self.filter_startup(msg, backend).await,
            Message::Terminate { .. } => Ok(FilterAction::drop_message()),
            Message::Query { sql, .. } => {
                let sql = sql.clone();
                self.filter_query(&sql, backend).await
            }
            _ => Ok(FilterAction {
                to_backend: Some(msg.serialize()),
                spoof: None,
            }),
        }
    }

    async fn filter_startup(&mut self, msg: Message, backend: &BackendHandle) -> Result<FilterAction> {
        if backend.authentication_complete().await {
            let snapshot = backend.auth_snapshot().await;
            Ok(FilterAction::spoof_only(concat_serialize(&snapshot)))
        } else {
            Ok(FilterAction::to_backend(msg.serialize()))
        }
    }

    async fn filter_query(&mut self, sql: &str, backend: &BackendHandle) -> Result<FilterAction> {
        let lower = sql.to_lowercase();

        if let Some(caps) = begin_test_re().captures(&lower) {
            let name = caps[1].to_string();
            backend.signal_test(true).await;
            let translated = message::query(&format!("BEGIN; -- {name}"));
            return Ok(FilterAction::to_backend(translated.serialize()));
        }
        if let Some(caps) = rollback_test_re().captures(&lower) {
            let name = caps[1].to_string();
            backend.signal_test(false).await;
            let translated = message::query(&format!("ROLLBACK; -- {name}"));
            return Ok(FilterAction::to_backend(translated.serialize()));
        }

        if lower.starts_with("begin") {
            return self.handle_begin(&lower, backend).await;
        }
        if lower.starts_with("commit") {
            let spoof = vec![
                message::command_complete("COMMIT"),
                message::ready_for_query(TxStatus::Transaction),
            ];
            return self.release_savepoint(backend, spoof).await;
        }
        if lower.starts_with("end work") || lower.starts_with("end transaction") {
            let spoof = vec![
                message::command_complete("END WORK"),
                message::ready_for_query(TxStatus::Transaction),
            ];
            return self.release_savepoint(backend, spoof).await;
        }
        if lower.starts_with("rollback") {
            return self.handle_rollback(backend).await;
        }

        Ok(FilterAction::to_backend(message::query(sql).serialize()))
    }

    async fn handle_begin(&mut self, lower: &str, backend: &BackendHandle) -> Result<FilterAction> {
        let spoof_msgs = if lower.contains("set transaction") {
            vec![
                message::command_complete("BEGIN"),
                message::command_complete("SET"),
                message::ready_for_query(TxStatus::Transaction),
            ]
        } else {
            vec![
                message::command_complete("BEGIN"),
                message::ready_for_query(TxStatus::Transaction),
            ]
        };
        let spoof_bytes = concat_serialize(&spoof_msgs);

        if backend.in_test().await {
            let name = next_savepoint_name();
            self.savepoints.push(name.clone());
            let translated = message::query(&format!("SAVEPOINT {name}"));
            backend.ignore_messages(&[b'C', b'Z']).await;
            Ok(FilterAction {
                to_backend: Some(translated.serialize()),
                spoof: Some(spoof_bytes),
            })
        } else {
            Ok(FilterAction::spoof_only(spoof_bytes))
        }
    }

    async fn handle_rollback(&mut self, backend: &BackendHandle) -> Result<FilterAction> {
        let spoof = concat_serialize(&[
            message::command_complete("ROLLBACK"),
            message::ready_for_query(TxStatus::Transaction),
        ]);
        let to_backend = self
            .translate_savepoint(backend, "ROLLBACK TO SAVEPOINT {}")
            .await;
        Ok(FilterAction {
            to_backend,
            spoof: Some(spoof),
        })
    }

    /// Shared by COMMIT and END WORK: both spoof success unconditionally
    /// unless the shared transaction has already failed, in which case the
    /// canonical "transaction is aborted" error is spoofed instead and
    /// nothing reaches the backend.
    async fn release_savepoint(
        &mut self,
        backend: &BackendHandle,
        success_spoof: Vec<Message>,
    ) -> Result<FilterAction> {
        if backend.transaction_status().await == TxStatus::Failed {
            return Ok(FilterAction::spoof_only(concat_serialize(
                &transaction_aborted_messages(),
            )));
        }
        let spoof = concat_serialize(&success_spoof);
        let to_backend = self
            .translate_savepoint(backend, "RELEASE SAVEPOINT {}")
            .await;
        Ok(FilterAction {
            to_backend,
            spoof: Some(spoof),
        })
    }

    /// Pops the top savepoint and builds `sql_template` with its name,
    /// enqueuing a "CZ" drop-list entry for the synthetic command's own
    /// reply. Drops the original message instead when not inside a test or
    /// the stack is already empty.
    async fn translate_savepoint(&mut self, backend: &BackendHandle, sql_template: &str) -> Option<Bytes> {
        if backend.in_test().await {
            if let Some(name) = self.savepoints.pop() {
                let sql = sql_template.replace("{}", &name);
                backend.ignore_messages(&[b'C', b'Z']).await;
                return Some(message::query(&sql).serialize());
            }
        }
        None
    }
}
