//! 🔧 Config Resolver -- the one moment in the adapter's life when it looks at the environment.
//!
//! 🎬 *[INT. STARTUP -- 0.003s after boot. A config file says `url = ["%{ES_URL}"]`.]*
//! *[The resolver reads the environment exactly once. It will never look again. It has moved on.]*
//!
//! [`OutputConfig`] is what serde hands us: strings with placeholders, numbers with opinions.
//! [`ResolvedOutputConfig`] is what everyone else reads: URLs substituted, credentials
//! substituted, per-event templates parsed, thresholds normalised. Same URL count, same order.
//!
//! ⚠️ Event templates (`index`, `document_type`, `document_id`) are parsed here but rendered
//! per event by the mapper, against event fields. The environment never leaks into them.

use reqwest::Url;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::errors::InitError;
use crate::templating::{Lookup, Missing, Template};

/// 📋 The output's raw configuration, straight off the figment conveyor belt.
///
/// Key names follow the classic logstash-style output (`bulk_actions`, `document_id`,
/// `ssl_certificate_validation`) because muscle memory is a feature.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct OutputConfig {
    /// 📡 Candidate nodes. May contain `%{VAR}` placeholders, resolved from the environment.
    #[serde(alias = "urls")]
    pub url: Vec<String>,
    /// 📦 Index name template, rendered per event.
    pub index: String,
    /// Document type template. Empty means typeless, which is what modern clusters want anyway.
    #[serde(default)]
    pub document_type: String,
    /// Document id template. Empty means "cluster, pick one".
    #[serde(default)]
    pub document_id: String,
    /// 🔒 Basic auth. Templated like URLs.
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// 🔒 API key. Beats basic auth when both are set. This is not a democracy.
    #[serde(default)]
    pub api_key: Option<String>,
    /// 🎯 Documents per bulk request. Zero or negative: every document flushes alone.
    #[serde(default = "default_bulk_actions")]
    pub bulk_actions: i64,
    /// Bytes per bulk request, measured on the NDJSON we build.
    #[serde(default = "default_bulk_size")]
    pub bulk_size: usize,
    /// ⏱️ A non-empty batch older than this gets flushed, full or not.
    #[serde(default = "default_bulk_flush_interval_ms")]
    pub bulk_flush_interval_ms: u64,
    /// How many bulk requests may be in flight at once.
    #[serde(default = "default_bulk_workers")]
    pub bulk_workers: usize,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// 🩺 How often the health worker re-probes the nodes.
    #[serde(default = "default_healthcheck_interval_ms")]
    pub healthcheck_interval_ms: u64,
    /// 🔐 Verify the cluster's certificate. On unless you explicitly, knowingly, say `false`.
    #[serde(default = "default_ssl_certificate_validation")]
    pub ssl_certificate_validation: bool,
}

// 📦 1000 docs: the classic default, chosen by people with more ES scars than us
fn default_bulk_actions() -> i64 {
    1000
}

// 📦 5 MiB -- the bulk API's comfort zone
fn default_bulk_size() -> usize {
    5 * 1024 * 1024
}

fn default_bulk_flush_interval_ms() -> u64 {
    30_000
}

fn default_bulk_workers() -> usize {
    2
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

// 🔧 if the cluster can't handshake in 10 seconds, it's not having a good time and neither are we
fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_healthcheck_interval_ms() -> u64 {
    10_000
}

fn default_ssl_certificate_validation() -> bool {
    true
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            url: vec!["http://127.0.0.1:9200".to_string()],
            index: "elastout-%{+%Y.%m.%d}".to_string(),
            document_type: String::new(),
            document_id: String::new(),
            username: None,
            password: None,
            api_key: None,
            bulk_actions: default_bulk_actions(),
            bulk_size: default_bulk_size(),
            bulk_flush_interval_ms: default_bulk_flush_interval_ms(),
            bulk_workers: default_bulk_workers(),
            request_timeout_ms: default_request_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            healthcheck_interval_ms: default_healthcheck_interval_ms(),
            ssl_certificate_validation: default_ssl_certificate_validation(),
        }
    }
}

/// 🔒 Who we say we are to the cluster.
#[derive(Clone, PartialEq, Eq, Default)]
pub enum Credentials {
    #[default]
    Anonymous,
    Basic {
        username: String,
        password: Option<String>,
    },
    ApiKey(String),
}

// 🙈 hand-rolled so a stray {:?} never prints a password into the logs
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Anonymous => f.write_str("Anonymous"),
            Credentials::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Credentials::ApiKey(_) => f.write_str("ApiKey(<redacted>)"),
        }
    }
}

impl Credentials {
    /// Attach ourselves to a request. API key first, basic auth second, nothing third.
    pub(crate) fn apply(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self {
            Credentials::Anonymous => request,
            Credentials::Basic { username, password } => request.basic_auth(username, password.as_ref()),
            Credentials::ApiKey(key) => request.header("Authorization", format!("ApiKey {}", key)),
        }
    }
}

/// 🎯 When a batch stops accumulating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPolicy {
    /// Always at least 1.
    pub max_actions: usize,
    pub max_bytes: usize,
    pub flush_interval: Duration,
}

/// ✅ The config everyone else reads. Immutable once built.
#[derive(Debug, Clone)]
pub struct ResolvedOutputConfig {
    pub raw_urls: Vec<String>,
    /// Same length and order as `raw_urls`, exactly as substituted. Unresolved placeholders
    /// stay in verbatim.
    pub resolved_urls: Vec<String>,
    pub credentials: Credentials,
    pub index: Template,
    pub document_type: Template,
    pub document_id: Template,
    pub tls_verify: bool,
    pub batch: BatchPolicy,
    pub bulk_workers: usize,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub healthcheck_interval: Duration,
}

impl OutputConfig {
    /// 🚀 Resolve against `lookup` (usually [`crate::EnvLookup`]). Pure: same env, same answer.
    pub fn resolve(&self, lookup: &dyn Lookup) -> Result<ResolvedOutputConfig, InitError> {
        if self.url.is_empty() {
            return Err(InitError::config("url", "at least one backend URL is required"));
        }

        let mut resolved_urls = Vec::with_capacity(self.url.len());
        for raw in &self.url {
            let resolved = resolve_setting("url", raw, lookup)?;
            if resolved.contains("%{") {
                // 🔁 left verbatim; connecting will fail and a restart can pick the variable up
                warn!("⚠️ '{}' still has an unresolved placeholder after resolution: '{}'", raw, resolved);
            } else {
                validate_url(&resolved)?;
            }
            resolved_urls.push(resolved);
        }

        let credentials = self.resolve_credentials(lookup)?;

        let index = parse_event_template("index", &self.index)?;
        if self.index.trim().is_empty() {
            return Err(InitError::config("index", "index template must not be empty"));
        }
        let document_type = parse_event_template("document_type", &self.document_type)?;
        let document_id = parse_event_template("document_id", &self.document_id)?;

        // 🎯 zero or negative means "flush every single document, right now, no chit-chat"
        let max_actions = if self.bulk_actions <= 0 {
            1
        } else {
            usize::try_from(self.bulk_actions).unwrap_or(usize::MAX)
        };

        if !self.ssl_certificate_validation {
            warn!("⚠️ ssl_certificate_validation = false: untrusted certificates will be accepted. You asked for it.");
        }

        let resolved = ResolvedOutputConfig {
            raw_urls: self.url.clone(),
            resolved_urls,
            credentials,
            index,
            document_type,
            document_id,
            tls_verify: self.ssl_certificate_validation,
            batch: BatchPolicy {
                max_actions,
                max_bytes: self.bulk_size.max(1),
                flush_interval: millis_at_least_one(self.bulk_flush_interval_ms),
            },
            bulk_workers: self.bulk_workers.max(1),
            request_timeout: millis_at_least_one(self.request_timeout_ms),
            connect_timeout: millis_at_least_one(self.connect_timeout_ms),
            healthcheck_interval: millis_at_least_one(self.healthcheck_interval_ms),
        };
        debug!("🔧 Resolved output config: {:?}", resolved.resolved_urls);
        Ok(resolved)
    }

    fn resolve_credentials(&self, lookup: &dyn Lookup) -> Result<Credentials, InitError> {
        if let Some(ref api_key) = self.api_key {
            return Ok(Credentials::ApiKey(resolve_setting("api_key", api_key, lookup)?));
        }
        match self.username {
            Some(ref username) => Ok(Credentials::Basic {
                username: resolve_setting("username", username, lookup)?,
                password: self
                    .password
                    .as_deref()
                    .map(|p| resolve_setting("password", p, lookup))
                    .transpose()?,
            }),
            None => Ok(Credentials::Anonymous),
        }
    }
}

fn resolve_setting(key: &str, raw: &str, lookup: &dyn Lookup) -> Result<String, InitError> {
    let template = Template::parse(raw).map_err(|e| InitError::config(key, e.to_string()))?;
    Ok(template.render(lookup, Missing::Verbatim))
}

fn parse_event_template(key: &str, raw: &str) -> Result<Template, InitError> {
    Template::parse(raw).map_err(|e| InitError::config(key, e.to_string()))
}

fn validate_url(resolved: &str) -> Result<(), InitError> {
    let url = Url::parse(resolved)
        .map_err(|e| InitError::config("url", format!("'{resolved}' is not a URL: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(InitError::config(
            "url",
            format!("'{resolved}' uses scheme '{other}', only http and https are spoken here"),
        )),
    }
}

fn millis_at_least_one(ms: u64) -> Duration {
    Duration::from_millis(ms.max(1))
}
