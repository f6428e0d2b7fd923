//! CLI argument parsing using clap.

use clap::Parser;
use std::path::PathBuf;

use crate::model::claude::DEFAULT_MODEL;

/// Persona Relay - answer, deflect and reach out as a configured persona
#[derive(Parser, Debug, Clone)]
#[command(name = "persona-relay")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Enable verbose/debug logging
    #[arg(short, long, env = "PERSONA_VERBOSE")]
    pub verbose: bool,

    /// Custom data directory for conversations and bridge session
    #[arg(long, value_name = "DIR", env = "PERSONA_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Settings file (default: <data-dir>/settings.json)
    #[arg(long, value_name = "FILE", env = "PERSONA_SETTINGS")]
    pub settings: Option<PathBuf>,

    /// Path to persona-bridge binary (auto-detected by default)
    #[arg(long, value_name = "PATH", env = "PERSONA_BRIDGE_PATH")]
    pub bridge_path: Option<PathBuf>,

    /// Anthropic API key for reply generation
    #[arg(long, env = "ANTHROPIC_API_KEY", hide_env_values = true)]
    pub anthropic_api_key: String,

    /// Model used for generation
    #[arg(long, default_value = DEFAULT_MODEL, env = "PERSONA_MODEL")]
    pub model: String,

    /// Thread that receives operator notifications
    #[arg(long, value_name = "THREAD_ID", env = "PERSONA_OPERATOR_THREAD", allow_negative_numbers = true)]
    pub operator_thread: Option<i64>,

    /// Import the history of one thread after connecting, then exit
    #[arg(long, value_name = "THREAD_ID", allow_negative_numbers = true)]
    pub collect_history: Option<i64>,

    /// Import the history of every dialog after connecting, then exit
    #[arg(long, conflicts_with = "collect_history")]
    pub collect_all: bool,
}

impl Args {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
