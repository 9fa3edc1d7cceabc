// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod bridge;
pub mod cipher;
pub mod deflate;
pub mod extension;
pub mod frame;
pub mod handshake;
pub mod hooks;
pub mod session;
