//! 🔧 App Configuration -- the TOML-to-struct pipeline.
//!
//! 📡 "Config not found: We looked everywhere. Under the couch. Behind the fridge." 🦆
//!
//! 🏗️ Figment layers `ELASTOUT_*` environment variables with an optional TOML file.
//! Nested keys use a double underscore: `ELASTOUT_OUTPUT__BULK_ACTIONS=500`.
//!
//! ⚠️ Not to be confused with `%{VAR}` placeholders *inside* values. Figment decides which
//! string ends up in `output.url`. The resolver decides what `%{ES_URL}` inside it means.

use anyhow::Context;
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::Deserialize;
use std::path::Path;
use tracing::info;

use crate::resolver::OutputConfig;

/// 📦 Everything the host process needs: the output itself plus how deep the channels are.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub output: OutputConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// 🧵 Channel sizing between the pipeline and the dispatcher.
///
/// A full events channel is how backpressure reaches the producer: when all bulk workers
/// are busy, the dispatcher stops reading, the channel fills, `send().await` waits.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    #[serde(default = "default_queue_capacity", alias = "channel_size")]
    pub queue_capacity: usize,
    #[serde(default = "default_report_capacity")]
    pub report_capacity: usize,
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_report_capacity() -> usize {
    1024
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            report_capacity: default_report_capacity(),
        }
    }
}

/// 🚀 Load the config from env vars and, if given, a TOML file. TOML wins on conflicts.
///
/// 💀 Returns an error if config is unparseable, with a message that says where we looked.
pub fn load_config(config_file_name: Option<&Path>) -> anyhow::Result<AppConfig> {
    info!(
        "🔧 Loading configuration: {:#?}",
        config_file_name.unwrap_or(Path::new(""))
    );

    let config = Figment::new().merge(Env::prefixed("ELASTOUT_").split("__"));

    let config = match config_file_name {
        Some(file_name) => config.merge(Toml::file(file_name)),
        None => config,
    };

    let context_msg = match config_file_name {
        Some(path) => format!(
            "💀 Failed to parse configuration from file '{}' and environment variables (ELASTOUT_*). \
             The file exists in our hearts, but apparently not on disk.",
            path.display()
        ),
        None => "💀 Failed to parse configuration from environment variables (ELASTOUT_*). \
                 No file was provided, so this one's all on the environment."
            .to_string(),
    };

    config.extract().context(context_msg)
}
