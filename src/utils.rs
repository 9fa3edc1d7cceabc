// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use rand::RngExt;

static NEXT_BID: AtomicU64 = AtomicU64::new(1);
static NEXT_SID: AtomicU16 = AtomicU16::new(1);

/// Allocates the next 64-bit connection identifier.
///
/// Identifiers are process-global and never reused, so a PONG addressed to a
/// replaced connection can never be mistaken for the replacement's.
pub fn next_bid() -> u64 {
    NEXT_BID.fetch_add(1, Ordering::Relaxed)
}

/// Allocates the next 16-bit acceptor identifier.
pub fn next_sid() -> u16 {
    NEXT_SID.fetch_add(1, Ordering::Relaxed)
}

/// Generates the `Sec-WebSocket-Key` value: 16 random bytes, base64-encoded.
pub fn generate_ws_key() -> String {
    let mut nonce = [0u8; 16];
    rand::rng().fill(&mut nonce);
    STANDARD.encode(nonce)
}

/// Generates a fresh 4-byte masking key for one client frame.
pub fn generate_mask_key() -> [u8; 4] {
    let mut key = [0u8; 4];
    rand::rng().fill(&mut key);
    key
}
