// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Cipher identifier handed to the external crypto collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CipherKind {
    Aes128,
    Aes192,
    #[default]
    Aes256,
}

/// Payload encryption settings; the engine only plumbs these through, the
/// actual primitives live behind [`PayloadCipher`].
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Encryption {
    #[serde(default, rename = "Enabled")]
    pub enabled: bool,
    #[serde(default, rename = "Pass")]
    pub pass: String,
    #[serde(default, rename = "Salt")]
    pub salt: String,
    #[serde(default, rename = "Cipher")]
    pub cipher: CipherKind,
}

impl Default for Encryption {
    fn default() -> Self {
        Self {
            enabled: false,
            pass: String::new(),
            salt: String::new(),
            cipher: CipherKind::Aes256,
        }
    }
}

/// External crypto collaborator: symmetric transform of finished message
/// payloads, applied after compression on send and before decompression on
/// receive.
pub trait PayloadCipher: Send + Sync {
    fn encode(&self, data: &[u8]) -> Result<Vec<u8>>;
    fn decode(&self, data: &[u8]) -> Result<Vec<u8>>;
}
