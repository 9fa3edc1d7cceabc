// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Resolves a config path relative to the working directory, honouring the
/// `WS_ENGINE_CONFIG` override used by the test harness.
pub fn resolve_config_path(rel: &str) -> Result<PathBuf> {
    let requested = std::env::var("WS_ENGINE_CONFIG").unwrap_or_else(|_| rel.to_string());
    let p = Path::new(&requested);

    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .context("cannot get current working dir")?
            .join(p)
    };

    let canon = abs
        .canonicalize()
        .with_context(|| format!("failed to canonicalize path {abs:?}"))?;

    Ok(canon)
}
