//! Configuration — CLI flags, environment variables, config file, defaults.
//!
//! Precedence, highest first: CLI flags > config file > environment
//! variables > built-in defaults.

use clap::Parser;
use std::fmt;
use std::fs;
use std::path::Path;

/// What the observation sink does with spliced traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkMode {
    /// No observation — the default.
    None,
    /// Hex-dump every captured chunk via `tracing`.
    Log,
}

impl fmt::Display for SinkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Log => write!(f, "log"),
        }
    }
}

fn parse_sink_mode(value: &str) -> SinkMode {
    match value.trim().to_ascii_lowercase().as_str() {
        "log" => SinkMode::Log,
        _ => SinkMode::None,
    }
}

/// pgghost — a transparent, intercepting proxy for the Postgres wire protocol
#[derive(Parser, Debug)]
#[command(name = "pgghost", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(long, default_value = "pgghost.conf")]
    pub config: String,

    /// Listen port
    #[arg(long, short = 'p')]
    pub port: Option<u16>,

    /// Bind address
    #[arg(long)]
    pub listen_host: Option<String>,

    /// Upstream Postgres host
    #[arg(long)]
    pub upstream_host: Option<String>,

    /// Upstream Postgres port
    #[arg(long)]
    pub upstream_port: Option<u16>,

    /// Username the proxy presents on the forward leg
    #[arg(long)]
    pub forward_username: Option<String>,

    /// Password the proxy presents on the forward leg
    #[arg(long)]
    pub forward_password: Option<String>,

    /// Database name the proxy presents on the forward leg
    #[arg(long)]
    pub forward_database: Option<String>,

    /// application_name the proxy presents on the forward leg
    #[arg(long)]
    pub forward_application_name: Option<String>,

    /// server_version reported to clients in the synthetic handshake burst
    #[arg(long)]
    pub server_version: Option<String>,

    /// Log level
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to TLS certificate (PEM) used to terminate the reverse leg
    #[arg(long)]
    pub tls_cert: Option<String>,

    /// Path to TLS private key (PEM) used to terminate the reverse leg
    #[arg(long)]
    pub tls_key: Option<String>,

    /// Require TLS on the forward leg regardless of PGSSLMODE
    #[arg(long)]
    pub upstream_tls: bool,

    /// Verify upstream TLS certificate (default: true)
    #[arg(long)]
    pub upstream_tls_verify: Option<bool>,

    /// Path to custom CA certificate for upstream TLS
    #[arg(long)]
    pub upstream_tls_ca: Option<String>,

    /// Handshake timeout in seconds
    #[arg(long)]
    pub handshake_timeout: Option<u64>,

    /// Observation sink mode: none or log
    #[arg(long)]
    pub sink_mode: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_host: String,
    pub listen_port: u16,
    pub upstream_host: String,
    pub upstream_port: u16,

    pub forward_username: String,
    pub forward_password: String,
    pub forward_database: String,
    pub forward_application_name: String,

    pub server_version: String,
    pub log_level: String,

    pub tls_cert: String,
    pub tls_key: String,

    pub upstream_tls: bool,
    pub upstream_tls_verify: bool,
    pub upstream_tls_ca: Option<String>,

    pub handshake_timeout_secs: u64,
    pub sink_mode: SinkMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_host: "127.0.0.1".to_string(),
            listen_port: 6432,
            upstream_host: "127.0.0.1".to_string(),
            upstream_port: 5432,

            forward_username: "postgres".to_string(),
            forward_password: "postgres".to_string(),
            forward_database: "postgres".to_string(),
            forward_application_name: "psql".to_string(),

            server_version: "12.14 (Debian 12.14-1.pgdg110+1)".to_string(),
            log_level: "info".to_string(),

            tls_cert: "/opt/bin/proxy-crt.pem".to_string(),
            tls_key: "/opt/bin/proxy-key.pem".to_string(),

            upstream_tls: false,
            upstream_tls_verify: true,
            upstream_tls_ca: None,

            handshake_timeout_secs: 30,
            sink_mode: SinkMode::None,
        }
    }
}

impl PartialEq for Config {
    fn eq(&self, other: &Self) -> bool {
        self.listen_host == other.listen_host
            && self.listen_port == other.listen_port
            && self.upstream_host == other.upstream_host
            && self.upstream_port == other.upstream_port
            && self.forward_username == other.forward_username
            && self.forward_password == other.forward_password
            && self.forward_database == other.forward_database
            && self.forward_application_name == other.forward_application_name
            && self.server_version == other.server_version
            && self.log_level == other.log_level
            && self.tls_cert == other.tls_cert
            && self.tls_key == other.tls_key
            && self.upstream_tls == other.upstream_tls
            && self.upstream_tls_verify == other.upstream_tls_verify
            && self.upstream_tls_ca == other.upstream_tls_ca
            && self.handshake_timeout_secs == other.handshake_timeout_secs
            && self.sink_mode == other.sink_mode
    }
}

impl Config {
    /// Load configuration by layering, in increasing priority: defaults,
    /// environment variables, config file, CLI flags.
    pub fn load() -> Self {
        let cli = Cli::parse();
        let mut config = Config::default();

        apply_env(&mut config);

        if Path::new(&cli.config).exists() {
            if let Ok(content) = fs::read_to_string(&cli.config) {
                apply_config_file(&mut config, &content);
            }
        }

        apply_cli(&mut config, &cli);
        config
    }

    /// Whether the forward leg must use TLS. `PGSSLMODE`, when present in
    /// the environment, decides outright (`require` → true, anything else
    /// → false), taking precedence over the `upstream_tls` config flag;
    /// `upstream_tls` is only consulted when `PGSSLMODE` is unset.
    pub fn forward_tls_required(&self) -> bool {
        match std::env::var("PGSSLMODE") {
            Ok(mode) => mode == "require",
            Err(_) => self.upstream_tls,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.handshake_timeout_secs == 0 {
            return Err("handshake_timeout must be greater than 0".to_string());
        }
        if self.tls_cert.is_empty() || self.tls_key.is_empty() {
            return Err("tls_cert and tls_key must both be set".to_string());
        }
        Ok(())
    }
}

fn apply_cli(config: &mut Config, cli: &Cli) {
    if let Some(v) = &cli.listen_host {
        config.listen_host = v.clone();
    }
    if let Some(v) = cli.port {
        config.listen_port = v;
    }
    if let Some(v) = &cli.upstream_host {
        config.upstream_host = v.clone();
    }
    if let Some(v) = cli.upstream_port {
        config.upstream_port = v;
    }
    if let Some(v) = &cli.forward_username {
        config.forward_username = v.clone();
    }
    if let Some(v) = &cli.forward_password {
        config.forward_password = v.clone();
    }
    if let Some(v) = &cli.forward_database {
        config.forward_database = v.clone();
    }
    if let Some(v) = &cli.forward_application_name {
        config.forward_application_name = v.clone();
    }
    if let Some(v) = &cli.server_version {
        config.server_version = v.clone();
    }
    if let Some(v) = &cli.log_level {
        config.log_level = v.clone();
    }
    if let Some(v) = &cli.tls_cert {
        config.tls_cert = v.clone();
    }
    if let Some(v) = &cli.tls_key {
        config.tls_key = v.clone();
    }
    if cli.upstream_tls {
        config.upstream_tls = true;
    }
    if let Some(v) = cli.upstream_tls_verify {
        config.upstream_tls_verify = v;
    }
    if let Some(v) = &cli.upstream_tls_ca {
        config.upstream_tls_ca = Some(v.clone());
    }
    if let Some(v) = cli.handshake_timeout {
        config.handshake_timeout_secs = v;
    }
    if let Some(v) = &cli.sink_mode {
        config.sink_mode = parse_sink_mode(v);
    }
}

/// Parse a simple `key = value` config file: `#` starts a comment, blank
/// lines are skipped, surrounding quotes on values are stripped, unknown
/// keys are ignored.
fn apply_config_file(config: &mut Config, content: &str) {
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim().trim_matches('"').trim_matches('\'');

        match key {
            "listen_host" | "host" => config.listen_host = value.to_string(),
            "listen_port" | "port" => {
                if let Ok(v) = value.parse() {
                    config.listen_port = v;
                }
            }
            "upstream_host" => config.upstream_host = value.to_string(),
            "upstream_port" => {
                if let Ok(v) = value.parse() {
                    config.upstream_port = v;
                }
            }
            "forward_username" | "username" => config.forward_username = value.to_string(),
            "forward_password" | "password" => config.forward_password = value.to_string(),
            "forward_database" | "database" => config.forward_database = value.to_string(),
            "forward_application_name" | "application_name" => {
                config.forward_application_name = value.to_string()
            }
            "server_version" => config.server_version = value.to_string(),
            "log_level" => config.log_level = value.to_string(),
            "tls_cert" => config.tls_cert = value.to_string(),
            "tls_key" => config.tls_key = value.to_string(),
            "upstream_tls" => config.upstream_tls = parse_bool(value),
            "upstream_tls_verify" => config.upstream_tls_verify = parse_bool(value),
            "upstream_tls_ca" => config.upstream_tls_ca = Some(value.to_string()),
            "handshake_timeout" | "handshake_timeout_secs" => {
                if let Ok(v) = value.parse() {
                    config.handshake_timeout_secs = v;
                }
            }
            "sink_mode" => config.sink_mode = parse_sink_mode(value),
            _ => {}
        }
    }
}

fn apply_env(config: &mut Config) {
    if let Ok(v) = std::env::var("PGGHOST_LISTEN_HOST") {
        config.listen_host = v;
    }
    if let Ok(v) = std::env::var("PGGHOST_LISTEN_PORT") {
        if let Ok(v) = v.parse() {
            config.listen_port = v;
        }
    }
    if let Ok(v) = std::env::var("PGGHOST_UPSTREAM_HOST") {
        config.upstream_host = v;
    }
    if let Ok(v) = std::env::var("PGGHOST_UPSTREAM_PORT") {
        if let Ok(v) = v.parse() {
            config.upstream_port = v;
        }
    }
    if let Ok(v) = std::env::var("PGGHOST_FORWARD_USERNAME") {
        config.forward_username = v;
    }
    if let Ok(v) = std::env::var("PGGHOST_FORWARD_PASSWORD") {
        config.forward_password = v;
    }
    if let Ok(v) = std::env::var("PGGHOST_FORWARD_DATABASE") {
        config.forward_database = v;
    }
    if let Ok(v) = std::env::var("PGGHOST_FORWARD_APPLICATION_NAME") {
        config.forward_application_name = v;
    }
    if let Ok(v) = std::env::var("PGGHOST_LOG_LEVEL") {
        config.log_level = v;
    }
    if let Ok(v) = std::env::var("PGGHOST_TLS_CERT") {
        config.tls_cert = v;
    }
    if let Ok(v) = std::env::var("PGGHOST_TLS_KEY") {
        config.tls_key = v;
    }
    if let Ok(v) = std::env::var("PGGHOST_UPSTREAM_TLS") {
        config.upstream_tls = parse_bool(&v);
    }
    if let Ok(v) = std::env::var("PGGHOST_UPSTREAM_TLS_VERIFY") {
        config.upstream_tls_verify = parse_bool(&v);
    }
    if let Ok(v) = std::env::var("PGGHOST_UPSTREAM_TLS_CA") {
        config.upstream_tls_ca = Some(v);
    }
    if let Ok(v) = std::env::var("PGGHOST_HANDSHAKE_TIMEOUT") {
        if let Ok(v) = v.parse() {
            config.handshake_timeout_secs = v;
        }
    }
    if let Ok(v) = std::env::var("PGGHOST_SINK_MODE") {
        config.sink_mode = parse_sink_mode(&v);
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.listen_host, "127.0.0.1");
        assert_eq!(config.listen_port, 6432);
        assert_eq!(config.upstream_port, 5432);
        assert_eq!(config.handshake_timeout_secs, 30);
        assert!(config.upstream_tls_verify);
        assert_eq!(config.sink_mode, SinkMode::None);
    }

    #[test]
    fn config_file_parses_simple_keys() {
        let mut config = Config::default();
        apply_config_file(
            &mut config,
            "listen_port = 7000\nupstream_host = db.internal\n# a comment\n\nforward_database = \"appdb\"\n",
        );
        assert_eq!(config.listen_port, 7000);
        assert_eq!(config.upstream_host, "db.internal");
        assert_eq!(config.forward_database, "appdb");
    }

    #[test]
    fn config_file_ignores_unknown_keys() {
        let mut config = Config::default();
        apply_config_file(&mut config, "bogus_key = whatever\n");
        assert_eq!(config, Config::default());
    }

    #[test]
    fn config_file_accepts_key_aliases() {
        let mut config = Config::default();
        apply_config_file(&mut config, "port = 9999\nusername = alice\n");
        assert_eq!(config.listen_port, 9999);
        assert_eq!(config.forward_username, "alice");
    }

    #[test]
    fn config_file_parses_booleans_case_insensitively() {
        let mut config = Config::default();
        apply_config_file(&mut config, "upstream_tls = YES\nupstream_tls_verify = 0\n");
        assert!(config.upstream_tls);
        assert!(!config.upstream_tls_verify);
    }

    #[test]
    fn parse_sink_mode_defaults_to_none_for_garbage() {
        assert_eq!(parse_sink_mode("log"), SinkMode::Log);
        assert_eq!(parse_sink_mode("LOG"), SinkMode::Log);
        assert_eq!(parse_sink_mode("nonsense"), SinkMode::None);
    }

    #[test]
    fn sink_mode_display() {
        assert_eq!(SinkMode::None.to_string(), "none");
        assert_eq!(SinkMode::Log.to_string(), "log");
    }

    #[test]
    fn validate_rejects_zero_timeout() {
        let mut config = Config::default();
        config.handshake_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_accepts_defaults() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn env_vars_override_defaults() {
        // SAFETY: tests run single-threaded within this process by default;
        // this test does not run concurrently with others touching these vars.
        unsafe {
            std::env::set_var("PGGHOST_LISTEN_PORT", "5555");
            std::env::set_var("PGGHOST_SINK_MODE", "log");
        }
        let mut config = Config::default();
        apply_env(&mut config);
        assert_eq!(config.listen_port, 5555);
        assert_eq!(config.sink_mode, SinkMode::Log);
        unsafe {
            std::env::remove_var("PGGHOST_LISTEN_PORT");
            std::env::remove_var("PGGHOST_SINK_MODE");
        }
    }
}
