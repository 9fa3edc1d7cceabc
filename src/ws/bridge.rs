// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    error::Severity,
    ws::hooks::{Activity, Agent, EndDirection, Hooks, StreamEvent},
};

/// One engine event forwarded into the async world.
#[derive(Debug, Clone)]
pub enum SessionNotice {
    Active {
        bid: u64,
        activity: Activity,
    },
    Stream {
        sid: u16,
        bid: u64,
        event: StreamEvent,
    },
    Handshake {
        sid: u16,
        bid: u64,
        agent: Agent,
    },
    Message {
        bid: u64,
        payload: Bytes,
        is_text: bool,
    },
    Error {
        bid: u64,
        severity: Severity,
        code: u16,
        text: String,
    },
    Erased {
        bid: u64,
    },
    End {
        sid: u16,
        bid: u64,
        direction: EndDirection,
    },
}

/// Awaitable view over the callback surface.
///
/// The callback API stays primary; this adapter only repackages hook
/// invocations as an unbounded channel so tasks can `await` the handshake
/// and the message stream instead of wiring closures.
pub struct SessionChannel {
    rx: mpsc::UnboundedReceiver<SessionNotice>,
    cancel: CancellationToken,
}

/// Builds the hook set plus the channel fed by it.
pub fn channel() -> (Hooks, SessionChannel) {
    let (tx, rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    let hooks = Hooks::new()
        .on_active({
            let tx = tx.clone();
            move |bid, activity| {
                let _ = tx.send(SessionNotice::Active { bid, activity });
            }
        })
        .on_stream({
            let tx = tx.clone();
            move |sid, bid, event| {
                let _ = tx.send(SessionNotice::Stream { sid, bid, event });
            }
        })
        .on_handshake({
            let tx = tx.clone();
            move |sid, bid, agent| {
                let _ = tx.send(SessionNotice::Handshake { sid, bid, agent });
            }
        })
        .on_message({
            let tx = tx.clone();
            move |bid, payload: &Bytes, is_text| {
                let _ = tx.send(SessionNotice::Message {
                    bid,
                    payload: payload.clone(),
                    is_text,
                });
            }
        })
        .on_error({
            let tx = tx.clone();
            move |bid, severity, error| {
                let _ = tx.send(SessionNotice::Error {
                    bid,
                    severity,
                    code: error.close_code(),
                    text: error.to_string(),
                });
            }
        })
        .on_end({
            let tx = tx.clone();
            move |sid, bid, direction| {
                let _ = tx.send(SessionNotice::End {
                    sid,
                    bid,
                    direction,
                });
            }
        })
        .on_erase(move |bid| {
            let _ = tx.send(SessionNotice::Erased { bid });
        });

    (hooks, SessionChannel { rx, cancel })
}

impl SessionChannel {
    /// Token that aborts every pending `await` on this channel.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Next engine event, `None` after cancellation or engine teardown.
    pub async fn next(&mut self) -> Option<SessionNotice> {
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            notice = self.rx.recv() => notice,
        }
    }

    /// Waits until some connection reports `stream(OPEN)`.
    pub async fn await_open(&mut self) -> Option<(u16, u64)> {
        while let Some(notice) = self.next().await {
            if let SessionNotice::Stream {
                sid,
                bid,
                event: StreamEvent::Open,
            } = notice
            {
                return Some((sid, bid));
            }
        }
        None
    }

    /// Waits for the next finished message, skipping other notices.
    pub async fn next_message(&mut self) -> Option<(u64, Bytes, bool)> {
        while let Some(notice) = self.next().await {
            if let SessionNotice::Message {
                bid,
                payload,
                is_text,
            } = notice
            {
                return Some((bid, payload, is_text));
            }
        }
        None
    }
}
