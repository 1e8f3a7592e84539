//! Runtime configuration sourced from the process environment.
//!
//! The whole configuration is resolved once at startup into a
//! [`MonitorConfig`] and handed down by reference. Nothing else in the crate
//! reads environment variables.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

pub const ENV_SITE_USER: &str = "EMIRATES_USER";
pub const ENV_SITE_PASS: &str = "EMIRATES_PASS";
pub const ENV_EMAIL_FROM: &str = "EMAIL_FROM";
pub const ENV_EMAIL_TO: &str = "EMAIL_TO";
pub const ENV_EMAIL_PASSWORD: &str = "EMAIL_PASSWORD";
pub const ENV_SMTP_SERVER: &str = "SMTP_SERVER";
pub const ENV_SMTP_PORT: &str = "SMTP_PORT";
pub const ENV_CHECK_TIMEOUT_MS: &str = "CHECK_TIMEOUT_MS";
pub const ENV_CYCLE_TIMEOUT_MS: &str = "CYCLE_TIMEOUT_MS";
pub const ENV_STATUS_FILE: &str = "STATUS_FILE";
pub const ENV_TARGET_URL: &str = "TARGET_URL";
pub const ENV_BROWSER_HEADLESS: &str = "BROWSER_HEADLESS";

/// Port on which the relay expects TLS from the first byte.
pub const IMPLICIT_TLS_PORT: u16 = 465;

/// How long to wait for the cookie banner. Not configurable.
pub const COOKIE_WAIT: Duration = Duration::from_millis(8000);

/// How long to wait for the cookie banner to go away after accepting it.
pub const COOKIE_DISMISS_WAIT: Duration = Duration::from_millis(5000);

pub const DEFAULT_TARGET_URL: &str =
    "https://external.emiratesgroupcareers.com/en_US/careersmarketplace/ProfileJobApplications";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("environment variable {var} is required but missing")]
    Missing { var: &'static str },

    #[error("environment variable {var} has invalid value '{value}': {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// A credential that never shows up in logs or `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

/// How the SMTP session is encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TlsMode {
    /// TLS from connect (SMTPS, port 465).
    Implicit,
    /// Plain connect upgraded with STARTTLS.
    StartTls,
}

impl TlsMode {
    pub fn for_port(port: u16) -> Self {
        if port == IMPLICIT_TLS_PORT {
            TlsMode::Implicit
        } else {
            TlsMode::StartTls
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            TlsMode::Implicit => "implicit-tls",
            TlsMode::StartTls => "starttls",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SiteCredentials {
    pub username: String,
    pub password: Secret,
}

#[derive(Debug, Clone)]
pub struct MailSettings {
    /// Sender address. Also used as the SMTP login.
    pub from: String,
    pub to: String,
    pub password: Secret,
    pub server: String,
    pub port: u16,
}

impl MailSettings {
    pub fn tls_mode(&self) -> TlsMode {
        TlsMode::for_port(self.port)
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub site: SiteCredentials,
    pub mail: MailSettings,
    pub target_url: String,
    /// Budget for each bounded page wait.
    pub check_timeout: Duration,
    /// Budget for a whole cycle, browser launch to store write.
    pub cycle_timeout: Duration,
    pub status_file: PathBuf,
    pub headless: bool,
}

fn default_smtp_server() -> String {
    "smtp.gmail.com".to_string()
}

fn default_smtp_port() -> u16 {
    IMPLICIT_TLS_PORT
}

fn default_check_timeout_ms() -> u64 {
    60_000
}

fn default_cycle_timeout_ms() -> u64 {
    300_000
}

fn default_status_file() -> PathBuf {
    PathBuf::from("latest_status.txt")
}

fn default_headless() -> bool {
    true
}

impl MonitorConfig {
    /// Resolve the configuration from the real process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve the configuration through an arbitrary variable lookup.
    ///
    /// Empty values count as missing, matching how operators usually blank
    /// out a variable in a `.env`-style deployment file.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &'static str| lookup(var).filter(|value| !value.trim().is_empty());
        let require = |var: &'static str| get(var).ok_or(ConfigError::Missing { var });

        let site = SiteCredentials {
            username: require(ENV_SITE_USER)?,
            password: Secret::new(require(ENV_SITE_PASS)?),
        };

        let mail = MailSettings {
            from: require(ENV_EMAIL_FROM)?,
            to: require(ENV_EMAIL_TO)?,
            password: Secret::new(require(ENV_EMAIL_PASSWORD)?),
            server: get(ENV_SMTP_SERVER).unwrap_or_else(default_smtp_server),
            port: match get(ENV_SMTP_PORT) {
                Some(raw) => parse_number(ENV_SMTP_PORT, &raw)?,
                None => default_smtp_port(),
            },
        };

        let check_timeout_ms = match get(ENV_CHECK_TIMEOUT_MS) {
            Some(raw) => parse_number(ENV_CHECK_TIMEOUT_MS, &raw)?,
            None => default_check_timeout_ms(),
        };
        let cycle_timeout_ms = match get(ENV_CYCLE_TIMEOUT_MS) {
            Some(raw) => parse_number(ENV_CYCLE_TIMEOUT_MS, &raw)?,
            None => default_cycle_timeout_ms(),
        };

        let headless = match get(ENV_BROWSER_HEADLESS) {
            Some(raw) => parse_bool(ENV_BROWSER_HEADLESS, &raw)?,
            None => default_headless(),
        };

        Ok(Self {
            site,
            mail,
            target_url: get(ENV_TARGET_URL).unwrap_or_else(|| DEFAULT_TARGET_URL.to_string()),
            check_timeout: Duration::from_millis(check_timeout_ms),
            cycle_timeout: Duration::from_millis(cycle_timeout_ms),
            status_file: get(ENV_STATUS_FILE)
                .map(PathBuf::from)
                .unwrap_or_else(default_status_file),
            headless,
        })
    }
}

fn parse_number<T>(var: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        var,
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

fn parse_bool(var: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            var,
            value: raw.to_string(),
            reason: "expected true or false".to_string(),
        }),
    }
}

fn push_kv(output: &mut String, key: &str, value: impl fmt::Display) {
    output.push_str(&format!("  {key:<20} {value}\n"));
}

/// Render the effective configuration for `status-watch config`.
pub fn render_human(config: &MonitorConfig) -> String {
    let mut output = String::new();
    output.push_str("Site\n");
    push_kv(&mut output, "target_url", &config.target_url);
    push_kv(&mut output, "username", &config.site.username);
    push_kv(&mut output, "password", &config.site.password);
    output.push('\n');

    output.push_str("Mail\n");
    push_kv(&mut output, "from", &config.mail.from);
    push_kv(&mut output, "to", &config.mail.to);
    push_kv(&mut output, "password", &config.mail.password);
    push_kv(
        &mut output,
        "relay",
        format!("{}:{}", config.mail.server, config.mail.port),
    );
    push_kv(&mut output, "tls", config.mail.tls_mode().label());
    output.push('\n');

    output.push_str("Timing\n");
    push_kv(
        &mut output,
        "check_timeout",
        format!("{}ms", config.check_timeout.as_millis()),
    );
    push_kv(
        &mut output,
        "cookie_wait",
        format!("{}ms", COOKIE_WAIT.as_millis()),
    );
    push_kv(
        &mut output,
        "cycle_timeout",
        format!("{}ms", config.cycle_timeout.as_millis()),
    );
    output.push('\n');

    output.push_str("State\n");
    push_kv(&mut output, "status_file", config.status_file.display());
    push_kv(&mut output, "headless", config.headless);

    output
}

pub fn render_json(config: &MonitorConfig) -> serde_json::Result<String> {
    let payload = serde_json::json!({
        "site": {
            "target_url": &config.target_url,
            "username": &config.site.username,
            "password": config.site.password.to_string(),
        },
        "mail": {
            "from": &config.mail.from,
            "to": &config.mail.to,
            "password": config.mail.password.to_string(),
            "server": &config.mail.server,
            "port": config.mail.port,
            "tls": config.mail.tls_mode(),
        },
        "timing": {
            "check_timeout_ms": config.check_timeout.as_millis() as u64,
            "cookie_wait_ms": COOKIE_WAIT.as_millis() as u64,
            "cycle_timeout_ms": config.cycle_timeout.as_millis() as u64,
        },
        "state": {
            "status_file": config.status_file.display().to_string(),
            "headless": config.headless,
        }
    });

    serde_json::to_string_pretty(&payload)
}
