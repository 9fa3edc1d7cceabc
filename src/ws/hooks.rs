// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::Bytes;

use crate::error::{Severity, WsError};

/// Connection-level activity reported through `active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Connect,
    Disconnect,
}

/// Stream lifecycle reported through `stream`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    Open,
    Close,
}

/// Protocol agent active on the connection after a handshake step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Agent {
    Http,
    Websocket,
}

/// Transfer direction reported through `end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndDirection {
    Recv,
    Send,
}

type ActiveFn = dyn Fn(u64, Activity) + Send + Sync;
type StreamFn = dyn Fn(u16, u64, StreamEvent) + Send + Sync;
type HandshakeFn = dyn Fn(u16, u64, Agent) + Send + Sync;
type MessageFn = dyn Fn(u64, &Bytes, bool) + Send + Sync;
type ErrorFn = dyn Fn(u64, Severity, &WsError) + Send + Sync;
type EraseFn = dyn Fn(u64) + Send + Sync;
type RawFn = dyn Fn(u64, &[u8]) -> bool + Send + Sync;
type EndFn = dyn Fn(u16, u64, EndDirection) + Send + Sync;

/// Callback set surfaced upward by servers and clients.
///
/// Every hook runs on the reactor thread with no session lock held, except
/// `raw`, which filters inbound bytes in-line and therefore must not call
/// back into session controls.
#[derive(Default)]
pub struct Hooks {
    pub(crate) active: Option<Box<ActiveFn>>,
    pub(crate) stream: Option<Box<StreamFn>>,
    pub(crate) handshake: Option<Box<HandshakeFn>>,
    pub(crate) message: Option<Box<MessageFn>>,
    pub(crate) error: Option<Box<ErrorFn>>,
    pub(crate) erase: Option<Box<EraseFn>>,
    pub(crate) raw: Option<Box<RawFn>>,
    pub(crate) end: Option<Box<EndFn>>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_active(mut self, f: impl Fn(u64, Activity) + Send + Sync + 'static) -> Self {
        self.active = Some(Box::new(f));
        self
    }

    pub fn on_stream(
        mut self,
        f: impl Fn(u16, u64, StreamEvent) + Send + Sync + 'static,
    ) -> Self {
        self.stream = Some(Box::new(f));
        self
    }

    pub fn on_handshake(
        mut self,
        f: impl Fn(u16, u64, Agent) + Send + Sync + 'static,
    ) -> Self {
        self.handshake = Some(Box::new(f));
        self
    }

    pub fn on_message(
        mut self,
        f: impl Fn(u64, &Bytes, bool) + Send + Sync + 'static,
    ) -> Self {
        self.message = Some(Box::new(f));
        self
    }

    pub fn on_error(
        mut self,
        f: impl Fn(u64, Severity, &WsError) + Send + Sync + 'static,
    ) -> Self {
        self.error = Some(Box::new(f));
        self
    }

    pub fn on_erase(mut self, f: impl Fn(u64) + Send + Sync + 'static) -> Self {
        self.erase = Some(Box::new(f));
        self
    }

    pub fn on_raw(
        mut self,
        f: impl Fn(u64, &[u8]) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.raw = Some(Box::new(f));
        self
    }

    pub fn on_end(
        mut self,
        f: impl Fn(u16, u64, EndDirection) + Send + Sync + 'static,
    ) -> Self {
        self.end = Some(Box::new(f));
        self
    }
}

/// Deferred hook invocation produced while a session lock was held; the
/// owner fires these after releasing the lock so hooks can re-enter
/// controls freely.
#[derive(Debug)]
pub enum Emit {
    Active(Activity),
    Stream(StreamEvent),
    Handshake(Agent),
    Message(Bytes, bool),
    Error(Severity, WsError),
    End(EndDirection),
}

impl Hooks {
    /// Fires one deferred emission for a connection.
    pub(crate) fn dispatch(&self, sid: u16, bid: u64, emit: Emit) {
        match emit {
            Emit::Active(activity) => {
                if let Some(f) = &self.active {
                    f(bid, activity);
                }
            },
            Emit::Stream(event) => {
                if let Some(f) = &self.stream {
                    f(sid, bid, event);
                }
            },
            Emit::Handshake(agent) => {
                if let Some(f) = &self.handshake {
                    f(sid, bid, agent);
                }
            },
            Emit::Message(payload, is_text) => {
                if let Some(f) = &self.message {
                    f(bid, &payload, is_text);
                }
            },
            Emit::Error(severity, error) => {
                if let Some(f) = &self.error {
                    f(bid, severity, &error);
                }
            },
            Emit::End(direction) => {
                if let Some(f) = &self.end {
                    f(sid, bid, direction);
                }
            },
        }
    }
}
