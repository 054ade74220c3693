//! Backend Filter — watches messages arriving from the real PostgreSQL
//! backend, capturing the authentication handshake and tracking transaction
//! status on the way through.

use std::collections::VecDeque;

use crate::error::{ProxyError, Result};
use crate::message::{Message, TxStatus};

/// Stateless with respect to its own fields — all mutable state it touches
/// (`auth_response`, `transaction_status`, `drop_list`) lives on the backend
/// session and is threaded through explicitly, since the session owns it
/// across many calls to `filter`.
#[derive(Default)]
pub struct BackendFilter;

impl BackendFilter {
    pub fn new() -> Self {
        Self
    }

    /// Applies the backend-direction filter to one message, returning the
    /// message to deliver to the currently attached client, or `None` if it
    /// was consumed by the drop-list.
    pub fn filter(
        &self,
        msg: Message,
        auth_response: &mut Vec<Message>,
        transaction_status: &mut TxStatus,
        drop_list: &mut VecDeque<u8>,
    ) -> Result<Option<Message>> {
        if let Some(&next) = drop_list.front() {
            if msg.type_byte() == Some(next) {
                drop_list.pop_front();
                return Ok(None);
            }
        }

        let complete = is_authentication_complete(auth_response);

        match &msg {
            Message::AuthenticationRequest { .. } => {
                if complete {
                    return Err(ProxyError::UnexpectedAuthMessage('R'));
                }
                auth_response.push(msg.clone());
            }
            Message::Other { type_byte: b'K', .. } => {
                if complete {
                    return Err(ProxyError::UnexpectedAuthMessage('K'));
                }
                auth_response.push(msg.clone());
            }
            Message::ParameterStatus { name, .. } => {
                if complete {
                    overwrite_parameter(auth_response, name, &msg);
                } else {
                    auth_response.push(msg.clone());
                }
            }
            Message::ReadyForQuery { status, .. } => {
                *transaction_status = *status;
                if !complete {
                    auth_response.push(msg.clone());
                }
            }
            _ => {}
        }

        Ok(Some(msg))
    }
}

/// Mirrors the source's `authenticationComplete` property: the handshake is
/// over once the last captured message is a `ReadyForQuery`.
fn is_authentication_complete(auth_response: &[Message]) -> bool {
    matches!(auth_response.last(), Some(Message::ReadyForQuery { .. }))
}

fn overwrite_parameter(auth_response: &mut [Message], name: &str, incoming: &Message) {
    for entry in auth_response.iter_mut() {
        if let Message::ParameterStatus { name: existing, .. } = entry {
            if existing == name {
                *entry = incoming.clone();
                return;
            }
        }
    }
}
