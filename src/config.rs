//! Server configuration: TOML loading, defaults, and the legacy
//! `processN=CODE,handler` command list format.
//!
//! ```toml
//! host = "0.0.0.0"
//! port = 7800
//! log_level = "info"
//!
//! [journal]
//! path = "data/transactions.log"
//! workers = 2
//!
//! [[inbound]]
//! command = "ADD_USER"
//! handler = "user.create"
//! ```
//!
//! When neither `[[inbound]]` nor `inbound_process_file` is present the
//! built-in command table is served.

use crate::commands::CommandBinding;
use crate::journal::JournalConfig;
use serde::Deserialize;
use std::borrow::Cow;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse TOML from '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("line {line}: {reason}")]
    Legacy { line: usize, reason: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level server configuration.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Default `EnvFilter` directive when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// How long shutdown waits for connections and the journal.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// Upper bound for one connection's unparsed input.
    #[serde(default = "default_max_buffer_size")]
    pub max_buffer_size: usize,
    #[serde(default)]
    pub files: FileConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub journal: JournalConfig,
    /// `None` serves [`default_inbound`].
    #[serde(default)]
    pub inbound: Option<Vec<CommandBinding>>,
    #[serde(default)]
    pub outbound: Vec<CommandBinding>,
    /// Legacy `processN=CODE,handler` file appended to `inbound`.
    #[serde(default)]
    pub inbound_process_file: Option<PathBuf>,
    /// Legacy `processN=CODE,handler` file appended to `outbound`.
    #[serde(default)]
    pub outbound_process_file: Option<PathBuf>,
    /// Peer addresses allowed to connect.
    #[serde(default)]
    pub accept: AcceptList,
}

/// Peer addresses the listener accepts. An empty list accepts everyone.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct AcceptList(Vec<IpAddr>);

impl AcceptList {
    pub fn new(addrs: impl IntoIterator<Item = IpAddr>) -> Self {
        Self(addrs.into_iter().collect())
    }

    pub fn is_open(&self) -> bool {
        self.0.is_empty()
    }

    /// IPv4-mapped IPv6 peers match their IPv4 entry.
    pub fn allows(&self, ip: IpAddr) -> bool {
        if self.0.is_empty() {
            return true;
        }
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(ip, IpAddr::V4),
            v4 => v4,
        };
        self.0.contains(&ip)
    }
}

/// `[files]`: where uploaded assets live.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct FileConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Served by `file.view` when the requested file does not exist.
    #[serde(default)]
    pub placeholder_image: Option<PathBuf>,
}

/// `[store]`: process-wide attribute store policy.
#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
pub struct StoreConfig {
    /// TTL applied to every write. 0 means entries never expire.
    #[serde(default)]
    pub default_ttl_secs: u64,
}

impl StoreConfig {
    pub fn default_ttl(&self) -> Option<Duration> {
        (self.default_ttl_secs > 0).then(|| Duration::from_secs(self.default_ttl_secs))
    }
}

fn default_host() -> String {
    crate::DEFAULT_HOST.to_string()
}
fn default_port() -> u16 {
    crate::DEFAULT_PORT
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_shutdown_grace_ms() -> u64 {
    5_000
}
fn default_max_buffer_size() -> usize {
    64 * 1024 * 1024 // 64 MiB
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

/// The built-in command table used when the file lists no inbound commands.
pub fn default_inbound() -> Vec<CommandBinding> {
    [
        ("PING", "system.ping"),
        ("ADD_USER", "user.create"),
        ("UPDATE_USER", "user.update"),
        ("DELETE_USER", "user.delete"),
        ("LOAD_VIEW_USER", "user.view"),
        ("GET_CAPTCHA", "captcha.issue"),
        ("VERIFY_CAPTCHA", "captcha.verify"),
        ("UPLOAD_USER_PIC", "file.upload"),
        ("VIEW_USER_IMAGE", "file.view"),
    ]
    .into_iter()
    .map(|(command, handler)| CommandBinding::new(command, handler))
    .collect()
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            placeholder_image: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            max_buffer_size: default_max_buffer_size(),
            files: FileConfig::default(),
            store: StoreConfig::default(),
            journal: JournalConfig::default(),
            inbound: None,
            outbound: Vec::new(),
            inbound_process_file: None,
            outbound_process_file: None,
            accept: AcceptList::default(),
        }
    }
}

impl ServerConfig {
    /// Loads a TOML file, then appends any legacy process files it names.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        if let Some(file) = config.inbound_process_file.clone() {
            let bindings = load_process_file(&file)?;
            info!(path = %file.display(), count = bindings.len(), "Loaded inbound process list");
            config.inbound.get_or_insert_with(Vec::new).extend(bindings);
        }
        if let Some(file) = config.outbound_process_file.clone() {
            let bindings = load_process_file(&file)?;
            info!(path = %file.display(), count = bindings.len(), "Loaded outbound process list");
            config.outbound.extend(bindings);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Checks values serde cannot check on its own.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid("host must not be empty".into()));
        }
        if self.max_buffer_size == 0 {
            return Err(ConfigError::Invalid("max_buffer_size must be positive".into()));
        }
        if self.journal.workers == 0 {
            return Err(ConfigError::Invalid("journal.workers must be at least 1".into()));
        }
        if self.inbound_commands().is_empty() {
            warn!("No inbound commands configured; every request will be unknown");
        }
        Ok(())
    }

    /// The inbound command table this configuration serves.
    pub fn inbound_commands(&self) -> Cow<'_, [CommandBinding]> {
        match &self.inbound {
            Some(bindings) => Cow::Borrowed(bindings),
            None => Cow::Owned(default_inbound()),
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Reads a legacy process file from disk.
pub fn load_process_file(path: &Path) -> Result<Vec<CommandBinding>, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_process_list(&contents)
}

/// Parses `processN=CODE,handler` lines.
///
/// Entries are read in order `process1`, `process2`, ... and reading stops at
/// the first missing number. Blank lines and lines starting with `#` or `!`
/// are ignored, as are keys that are not `processN`.
pub fn parse_process_list(contents: &str) -> Result<Vec<CommandBinding>, ConfigError> {
    let mut entries = std::collections::HashMap::new();

    for (idx, raw) in contents.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(ConfigError::Legacy {
                line: idx + 1,
                reason: format!("expected key=value, got '{}'", line),
            });
        };
        let Some(number) = key.trim().strip_prefix("process") else {
            continue;
        };
        let Ok(number) = number.parse::<usize>() else {
            continue;
        };

        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        let Some((command, handler)) = value.split_once(',') else {
            return Err(ConfigError::Legacy {
                line: idx + 1,
                reason: format!("expected CODE,handler, got '{}'", value),
            });
        };
        let (command, handler) = (command.trim(), handler.trim());
        if command.is_empty() || handler.is_empty() {
            return Err(ConfigError::Legacy {
                line: idx + 1,
                reason: "command code and handler must not be empty".into(),
            });
        }
        entries.insert(number, CommandBinding::new(command, handler));
    }

    let mut bindings = Vec::with_capacity(entries.len());
    let mut n = 1;
    while let Some(binding) = entries.remove(&n) {
        bindings.push(binding);
        n += 1;
    }
    if !entries.is_empty() {
        warn!(
            skipped = entries.len(),
            "Process entries after a gap in numbering were ignored"
        );
    }
    Ok(bindings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::from_toml_str("").unwrap();
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.bind_address(), "127.0.0.1:7800");
        assert_eq!(config.store.default_ttl(), None);
        assert!(config
            .inbound_commands()
            .iter()
            .any(|b| b.command == "ADD_USER" && b.handler == "user.create"));
    }

    #[test]
    fn test_full_file() {
        let config = ServerConfig::from_toml_str(
            r#"
            host = "0.0.0.0"
            port = 9000
            shutdown_grace_ms = 250

            [files]
            data_dir = "/srv/assets"
            placeholder_image = "/srv/no-image.jpg"

            [store]
            default_ttl_secs = 3600

            [journal]
            workers = 4
            high_water_mark = 1000
            sampled_commands = ["GET_CAPTCHA"]

            [[inbound]]
            command = "PING"
            handler = "system.ping"

            [[outbound]]
            command = "PING"
            handler = "system.ping"
            "#,
        )
        .unwrap();

        assert_eq!(config.port, 9000);
        assert_eq!(config.shutdown_grace(), Duration::from_millis(250));
        assert_eq!(config.files.data_dir, PathBuf::from("/srv/assets"));
        assert_eq!(config.store.default_ttl(), Some(Duration::from_secs(3600)));
        assert_eq!(config.journal.workers, 4);
        assert_eq!(config.journal.max_retries, 3);
        assert_eq!(config.journal.sampled_commands, vec!["GET_CAPTCHA"]);
        assert_eq!(&*config.inbound_commands(), [CommandBinding::new("PING", "system.ping")]);
        assert_eq!(config.outbound.len(), 1);
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut config = ServerConfig::default();
        config.journal.workers = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_parse_process_list() {
        let bindings = parse_process_list(
            "# server processes\n\
             process2=GET_CAPTCHA,captcha.issue\n\
             process1 = ADD_USER , user.create\n\
             listen_port=7800\n\
             \n\
             process3=UPLOAD_USER_PIC,file.upload\n",
        )
        .unwrap();

        assert_eq!(
            bindings,
            vec![
                CommandBinding::new("ADD_USER", "user.create"),
                CommandBinding::new("GET_CAPTCHA", "captcha.issue"),
                CommandBinding::new("UPLOAD_USER_PIC", "file.upload"),
            ]
        );
    }

    #[test]
    fn test_parse_process_list_stops_at_gap() {
        let bindings = parse_process_list("process1=A,x\nprocess3=C,z\n").unwrap();
        assert_eq!(bindings, vec![CommandBinding::new("A", "x")]);
    }

    #[test]
    fn test_parse_process_list_errors() {
        assert!(matches!(
            parse_process_list("process1=ADD_USER"),
            Err(ConfigError::Legacy { line: 1, .. })
        ));
        assert!(matches!(
            parse_process_list("\nnot a pair"),
            Err(ConfigError::Legacy { line: 2, .. })
        ));
    }

    #[test]
    fn test_from_file_appends_legacy_list() {
        let dir = tempfile::tempdir().unwrap();
        let legacy = dir.path().join("server.process");
        std::fs::write(&legacy, "process1=PING,system.ping\n").unwrap();

        let config_path = dir.path().join("switchboard.toml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "inbound = []").unwrap();
        writeln!(file, "inbound_process_file = {:?}", legacy.display().to_string()).unwrap();
        drop(file);

        let config = ServerConfig::from_file(&config_path).unwrap();
        assert_eq!(&*config.inbound_commands(), [CommandBinding::new("PING", "system.ping")]);
    }

    #[test]
    fn test_legacy_list_alone_replaces_builtin_table() {
        let dir = tempfile::tempdir().unwrap();
        let legacy = dir.path().join("server.process");
        std::fs::write(&legacy, "process1=ADD_USER,user.create\n").unwrap();

        let config_path = dir.path().join("switchboard.toml");
        std::fs::write(
            &config_path,
            format!("inbound_process_file = {:?}\n", legacy.display().to_string()),
        )
        .unwrap();

        let config = ServerConfig::from_file(&config_path).unwrap();
        assert_eq!(&*config.inbound_commands(), [CommandBinding::new("ADD_USER", "user.create")]);
        assert!(crate::commands::CommandRegistry::bootstrap(
            &crate::commands::builtin::catalog(),
            &config.inbound_commands(),
            &config.outbound,
        )
        .is_ok());
    }

    #[test]
    fn test_accept_list() {
        let config = ServerConfig::from_toml_str(r#"accept = ["10.0.0.5", "::1"]"#).unwrap();
        assert!(config.accept.allows("10.0.0.5".parse().unwrap()));
        assert!(config.accept.allows("::ffff:10.0.0.5".parse().unwrap()));
        assert!(config.accept.allows("::1".parse().unwrap()));
        assert!(!config.accept.allows("10.0.0.6".parse().unwrap()));

        assert!(ServerConfig::default().accept.allows("192.0.2.1".parse().unwrap()));
        assert!(ServerConfig::from_toml_str(r#"accept = ["not-an-ip"]"#).is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = ServerConfig::from_file("/nonexistent/switchboard.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
