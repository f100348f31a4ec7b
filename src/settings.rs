use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_BACKEND_URL: &str = "http://localhost:8000";
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    Database,
    Internet,
    #[default]
    Both,
}

impl SourceMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceMode::Database => "database",
            SourceMode::Internet => "internet",
            SourceMode::Both => "both",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ResponseMode {
    #[default]
    Streaming,
    Sync,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum QueryField {
    #[default]
    #[value(name = "input_query")]
    InputQuery,
    Query,
}

impl QueryField {
    pub fn key(self) -> &'static str {
        match self {
            QueryField::InputQuery => "input_query",
            QueryField::Query => "query",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct ParseSettingError {
    kind: &'static str,
    value: String,
}

fn parse_choice<T: clap::ValueEnum>(kind: &'static str, s: &str) -> Result<T, ParseSettingError> {
    T::from_str(s.trim(), true).map_err(|_| ParseSettingError { kind, value: s.to_string() })
}

impl FromStr for SourceMode {
    type Err = ParseSettingError;
    fn from_str(s: &str) -> Result<Self, Self::Err> { parse_choice("source", s) }
}

impl FromStr for ResponseMode {
    type Err = ParseSettingError;
    fn from_str(s: &str) -> Result<Self, Self::Err> { parse_choice("response mode", s) }
}

impl FromStr for QueryField {
    type Err = ParseSettingError;
    fn from_str(s: &str) -> Result<Self, Self::Err> { parse_choice("query field", s) }
}

impl fmt::Display for SourceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SettingsLayer {
    pub backend_url: Option<String>,
    pub source: Option<SourceMode>,
    pub response_mode: Option<ResponseMode>,
    pub query_field: Option<QueryField>,
    pub connect_timeout_secs: Option<u64>,
}

impl SettingsLayer {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    // unparseable values are logged and ignored
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: FromStr>(key: &str, raw: Option<String>) -> Option<T>
        where
            T::Err: fmt::Display,
        {
            let raw = raw.filter(|v| !v.trim().is_empty())?;
            match raw.parse() {
                Ok(v) => Some(v),
                Err(e) => {
                    tracing::warn!(key, error = %e, "ignoring invalid setting");
                    None
                }
            }
        }

        Self {
            backend_url: lookup("NITI_BACKEND_URL").filter(|v| !v.trim().is_empty()),
            source: parsed("NITI_SOURCE", lookup("NITI_SOURCE")),
            response_mode: parsed("NITI_RESPONSE_MODE", lookup("NITI_RESPONSE_MODE")),
            query_field: parsed("NITI_QUERY_FIELD", lookup("NITI_QUERY_FIELD")),
            connect_timeout_secs: parsed("NITI_CONNECT_TIMEOUT_SECS", lookup("NITI_CONNECT_TIMEOUT_SECS")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveSettings {
    pub backend_url: String,
    pub source: SourceMode,
    pub response_mode: ResponseMode,
    pub query_field: QueryField,
    pub connect_timeout: Duration,
}

pub fn resolve_effective_settings(env: &SettingsLayer, cli: &SettingsLayer) -> anyhow::Result<EffectiveSettings> {
    let backend_url = cli
        .backend_url
        .clone()
        .or_else(|| env.backend_url.clone())
        .unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string());
    let parsed = url::Url::parse(backend_url.trim())?;
    if !matches!(parsed.scheme(), "http" | "https") {
        anyhow::bail!("backend url must be http or https: {}", backend_url);
    }

    let connect_timeout_secs = cli
        .connect_timeout_secs
        .or(env.connect_timeout_secs)
        .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS);

    Ok(EffectiveSettings {
        backend_url: parsed.as_str().trim_end_matches('/').to_string(),
        source: cli.source.or(env.source).unwrap_or_default(),
        response_mode: cli.response_mode.or(env.response_mode).unwrap_or_default(),
        query_field: cli.query_field.or(env.query_field).unwrap_or_default(),
        connect_timeout: Duration::from_secs(connect_timeout_secs),
    })
}
