//! Persistent settings and interview configuration
//!
//! `settings.json` holds the provider choice and voice overrides. API keys
//! are never part of it: they come from the command line, the keyring or
//! the environment (see [`ApiConfig::resolve_api_key`]).

use std::fmt;
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::live::{SessionConfig, DEFAULT_LIVE_MODEL, DEFAULT_VOICE_NAME};
use crate::paths;

const SETTINGS_FILE_NAME: &str = "settings.json";

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Failed to write settings {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to serialize settings: {0}")]
    Json(#[from] serde_json::Error),
}

/// Text-chat backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    Gemini,
    #[value(name = "openai")]
    OpenAi,
    Groq,
    Custom,
}

impl Provider {
    pub fn all() -> [Provider; 4] {
        [
            Provider::Gemini,
            Provider::OpenAi,
            Provider::Groq,
            Provider::Custom,
        ]
    }

    /// Stable identifier used in settings and keyring entries
    pub fn id(&self) -> &'static str {
        match self {
            Provider::Gemini => "gemini",
            Provider::OpenAi => "openai",
            Provider::Groq => "groq",
            Provider::Custom => "custom",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Provider::Gemini => "SteadyCoach Free (Gemini)",
            Provider::OpenAi => "OpenAI",
            Provider::Groq => "Groq",
            Provider::Custom => "Custom / Other",
        }
    }

    /// Preset endpoint. Empty for Gemini (fixed endpoint) and Custom.
    pub fn default_base_url(&self) -> &'static str {
        match self {
            Provider::Gemini => "",
            Provider::OpenAi => "https://api.openai.com/v1",
            Provider::Groq => "https://api.groq.com/openai/v1",
            Provider::Custom => "",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            Provider::Gemini => "gemini-3-flash-preview",
            Provider::OpenAi => "gpt-4o",
            Provider::Groq => "llama3-8b-8192",
            Provider::Custom => "",
        }
    }

    /// Environment variables checked for a key, in order
    pub fn env_vars(&self) -> &'static [&'static str] {
        match self {
            Provider::Gemini => &["GEMINI_API_KEY", "API_KEY", "STEADYCOACH_API_KEY"],
            Provider::OpenAi => &["OPENAI_API_KEY", "STEADYCOACH_API_KEY"],
            Provider::Groq => &["GROQ_API_KEY", "STEADYCOACH_API_KEY"],
            Provider::Custom => &["STEADYCOACH_API_KEY"],
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Connection settings for the text chat backend
#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ApiConfig {
    pub provider: Provider,
    /// Resolved at runtime, never persisted
    #[serde(skip)]
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    /// Let the model consult web search (Gemini only)
    pub enable_contextual_grounding: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self::for_provider(Provider::Gemini)
    }
}

impl fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiConfig")
            .field("provider", &self.provider)
            .field("api_key", &if self.api_key.is_empty() { "<unset>" } else { "<redacted>" })
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("enable_contextual_grounding", &self.enable_contextual_grounding)
            .finish()
    }
}

impl ApiConfig {
    /// Preset values for `provider`
    pub fn for_provider(provider: Provider) -> Self {
        Self {
            provider,
            api_key: String::new(),
            base_url: provider.default_base_url().to_string(),
            model: provider.default_model().to_string(),
            enable_contextual_grounding: false,
        }
    }

    /// Switch provider, resetting endpoint and model to its preset
    pub fn switch_provider(&mut self, provider: Provider) {
        let grounding = self.enable_contextual_grounding;
        *self = Self::for_provider(provider);
        self.enable_contextual_grounding = grounding;
    }

    /// Fill `api_key` from, in order: `flag`, the keyring, the environment.
    ///
    /// Returns whether a key was found.
    pub fn resolve_api_key(&mut self, flag: Option<&str>) -> bool {
        let provider = self.provider;
        self.resolve_api_key_with(
            flag,
            || crate::credentials::get_api_key(provider),
            |var| std::env::var(var).ok(),
        )
    }

    fn resolve_api_key_with(
        &mut self,
        flag: Option<&str>,
        keyring: impl FnOnce() -> Option<String>,
        env: impl Fn(&str) -> Option<String>,
    ) -> bool {
        let key = flag
            .map(str::to_string)
            .filter(|k| !k.is_empty())
            .or_else(|| keyring().filter(|k| !k.is_empty()))
            .or_else(|| {
                self.provider
                    .env_vars()
                    .iter()
                    .find_map(|var| env(var).filter(|k| !k.is_empty()))
            });

        match key {
            Some(key) => {
                self.api_key = key;
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
pub enum ExperienceLevel {
    Entry,
    #[default]
    #[serde(rename = "Mid-Senior")]
    #[value(name = "mid-senior")]
    MidSenior,
    Executive,
}

impl fmt::Display for ExperienceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExperienceLevel::Entry => "Entry",
            ExperienceLevel::MidSenior => "Mid-Senior",
            ExperienceLevel::Executive => "Executive",
        })
    }
}

/// How the interview is conducted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum InterviewMode {
    #[default]
    Text,
    Voice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PracticeMode {
    #[default]
    Structured,
    Refinement,
    Simulation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackDepth {
    Light,
    #[default]
    Standard,
    Deep,
}

impl FeedbackDepth {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackDepth::Light => "light",
            FeedbackDepth::Standard => "standard",
            FeedbackDepth::Deep => "deep",
        }
    }
}

/// What the candidate is practising for
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InterviewSettings {
    pub role: String,
    pub company: String,
    pub description: String,
    pub experience_level: ExperienceLevel,
    pub mode: InterviewMode,
    pub practice_mode: PracticeMode,
    pub feedback_depth: FeedbackDepth,
}

/// Contents of settings.json
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppSettings {
    pub api: ApiConfig,
    /// Overrides the realtime voice model
    pub voice_model: Option<String>,
    /// Overrides the prebuilt voice
    pub voice_name: Option<String>,
}

impl AppSettings {
    /// Voice session parameters for a call with the given instruction
    pub fn voice_session_config(
        &self,
        api_key: impl Into<String>,
        instruction: impl Into<String>,
    ) -> SessionConfig {
        let mut config = SessionConfig::new(api_key, instruction);
        config.model = self
            .voice_model
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_LIVE_MODEL.to_string());
        config.voice_name = self
            .voice_name
            .clone()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_VOICE_NAME.to_string());
        config
    }
}

pub fn settings_path() -> PathBuf {
    paths::config_dir().join(SETTINGS_FILE_NAME)
}

pub fn load_settings() -> AppSettings {
    load_settings_from(&settings_path())
}

/// Missing file gives defaults; unreadable or invalid files are logged and
/// also give defaults.
pub fn load_settings_from(path: &Path) -> AppSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<AppSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                AppSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            AppSettings::default()
        }
    }
}

pub fn save_settings(settings: &AppSettings) -> Result<(), SettingsError> {
    save_settings_to(&settings_path(), settings)
}

pub fn save_settings_to(path: &Path, settings: &AppSettings) -> Result<(), SettingsError> {
    let contents = serde_json::to_string_pretty(settings)?;
    paths::write_atomic(path, contents.as_bytes()).map_err(|source| SettingsError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    log::debug!("Settings: saved {:?}", path);
    Ok(())
}
