use crate::FelixError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// An LLM vendor that can execute tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Anthropic models, locally through the `claude` CLI.
    Anthropic,
    /// OpenAI models, locally through the `codex` CLI.
    OpenAi,
    /// Google models, locally through the `gemini` CLI.
    Google,
}

impl Provider {
    /// Every known provider, in default fallback order.
    pub const ALL: [Provider; 3] = [Provider::Anthropic, Provider::OpenAi, Provider::Google];

    /// Name of the local executable used by the CLI backend.
    pub fn executable(&self) -> &'static str {
        match self {
            Provider::Anthropic => "claude",
            Provider::OpenAi => "codex",
            Provider::Google => "gemini",
        }
    }

    /// Environment variable holding the API key for the HTTP backend.
    pub fn api_key_env(&self) -> &'static str {
        match self {
            Provider::Anthropic => "ANTHROPIC_API_KEY",
            Provider::OpenAi => "OPENAI_API_KEY",
            Provider::Google => "GEMINI_API_KEY",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Provider::Anthropic => write!(f, "anthropic"),
            Provider::OpenAi => write!(f, "openai"),
            Provider::Google => write!(f, "google"),
        }
    }
}

impl FromStr for Provider {
    type Err = FelixError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "anthropic" | "claude" => Ok(Provider::Anthropic),
            "openai" | "codex" => Ok(Provider::OpenAi),
            "google" | "gemini" => Ok(Provider::Google),
            other => Err(FelixError::Config(format!("unknown provider '{other}'"))),
        }
    }
}

/// How a worker reaches its model: a local CLI process or a remote HTTP API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Local agent CLI spawned as a child process.
    Cli,
    /// Remote HTTP API.
    Api,
}

impl Backend {
    /// The other backend.
    pub fn alternate(&self) -> Backend {
        match self {
            Backend::Cli => Backend::Api,
            Backend::Api => Backend::Cli,
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Cli => write!(f, "cli"),
            Backend::Api => write!(f, "api"),
        }
    }
}

impl FromStr for Backend {
    type Err = FelixError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cli" => Ok(Backend::Cli),
            "api" => Ok(Backend::Api),
            other => Err(FelixError::Config(format!("unknown backend '{other}'"))),
        }
    }
}
