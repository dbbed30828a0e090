// Copyright (c) 2025 Lakestream Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Diagnostic log setup for embedding applications.
//!
//! The crate itself only emits `tracing` events and never installs a
//! subscriber on its own; an application that wants to see them calls
//! [`init_logging`] once at startup. Applications with their own subscriber
//! skip this module entirely.
//!
//! Filter resolution: an explicit [`LogConfig::level`] wins, then `RUST_LOG`,
//! then `lakestream=warn`. A level of `"OFF"` disables setup.

use std::path::PathBuf;
use std::sync::Arc;

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

/// Log destination and verbosity for [`init_logging`].
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// Level for this crate's events: "OFF", "ERROR", "WARN", "INFO",
    /// "DEBUG" or "TRACE". Unset falls back to `RUST_LOG`.
    pub level: Option<String>,
    /// Append log lines to this file instead of stderr.
    pub file: Option<PathBuf>,
}

impl LogConfig {
    fn filter(&self) -> Option<EnvFilter> {
        match &self.level {
            Some(level) if level.eq_ignore_ascii_case("off") => None,
            Some(level) => Some(EnvFilter::new(format!(
                "lakestream={}",
                level.to_lowercase()
            ))),
            None => Some(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new("lakestream=warn")),
            ),
        }
    }
}

/// Installs the global `tracing` subscriber described by `config`.
///
/// Returns `true` when this call installed the subscriber. Returns `false`
/// when the level is `"OFF"`, when the log file cannot be opened, or when a
/// global subscriber was already set (this call then changes nothing).
pub fn init_logging(config: &LogConfig) -> bool {
    let Some(filter) = config.filter() else {
        return false;
    };

    let (writer, ansi) = match &config.file {
        Some(path) => {
            let file = match std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
            {
                Ok(file) => file,
                Err(e) => {
                    eprintln!("lakestream: cannot open log file {}: {e}", path.display());
                    return false;
                }
            };
            (BoxMakeWriter::new(Arc::new(file)), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), true),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(false)
        .try_init()
        .is_ok()
}
