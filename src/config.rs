use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ClusterError, Result};

/// Sections the Manager refuses to start without, in validation order.
pub const MANAGER_SECTIONS: [&str; 7] = [
    "cluster",
    "zeromq",
    "authentication",
    "streamer",
    "slavedriver",
    "worker",
    "sink",
];

/// Sections handed to a SlaveDriver as its `localconf`.
pub const LOCALCONF_SECTIONS: [&str; 6] = [
    "authentication",
    "streamer",
    "sink",
    "worker",
    "slavedriver",
    "zeromq",
];

/// Prefix of per-node override sections, e.g. `[node:10.0.0.7]`.
pub const NODE_SECTION_PREFIX: &str = "node:";

pub const DEFAULT_REPLY_PORT: u16 = 5557;
pub const DEFAULT_STATUS_PORT: u16 = 5558;
pub const DEFAULT_CONF_PORT: u16 = 5559;
pub const DEFAULT_STREAMER_PORT: u16 = 5571;
pub const DEFAULT_SINK_PORT: u16 = 5572;

pub type Section = BTreeMap<String, String>;

/// The per-node subset of the configuration document.
pub type LocalConf = BTreeMap<String, Section>;

/// A parsed configuration document: named sections of option -> value.
///
/// The accepted syntax is the classic INI dialect:
/// - `[section]` headers
/// - `option = value` or `option: value` (option names are case-insensitive)
/// - full-line comments starting with `#` or `;`
/// - indented lines continue the previous value
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigDocument {
    sections: BTreeMap<String, Section>,
}

impl ConfigDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut doc = Self::new();
        let mut current: Option<String> = None;
        let mut last_key: Option<String> = None;

        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let trimmed = raw.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with(';') {
                continue;
            }

            let indented = raw.starts_with(' ') || raw.starts_with('\t');
            if indented {
                if let (Some(section), Some(key)) = (&current, &last_key) {
                    if let Some(value) = doc
                        .sections
                        .get_mut(section)
                        .and_then(|s| s.get_mut(key))
                    {
                        if !value.is_empty() {
                            value.push('\n');
                        }
                        value.push_str(trimmed);
                        continue;
                    }
                }
            }

            if let Some(rest) = trimmed.strip_prefix('[') {
                let name = rest.strip_suffix(']').ok_or_else(|| ClusterError::ConfigParse {
                    line: line_no,
                    reason: format!("unterminated section header {:?}", trimmed),
                })?;
                let name = name.trim();
                if name.is_empty() {
                    return Err(ClusterError::ConfigParse {
                        line: line_no,
                        reason: "empty section name".to_string(),
                    });
                }
                doc.sections.entry(name.to_string()).or_default();
                current = Some(name.to_string());
                last_key = None;
                continue;
            }

            let section = current.as_ref().ok_or_else(|| ClusterError::ConfigParse {
                line: line_no,
                reason: "option defined before any section header".to_string(),
            })?;

            let split_at = match (trimmed.find('='), trimmed.find(':')) {
                (Some(a), Some(b)) => a.min(b),
                (Some(a), None) => a,
                (None, Some(b)) => b,
                (None, None) => {
                    return Err(ClusterError::ConfigParse {
                        line: line_no,
                        reason: format!("expected `option = value`, got {:?}", trimmed),
                    })
                }
            };

            let key = trimmed[..split_at].trim().to_lowercase();
            let value = trimmed[split_at + 1..].trim().to_string();
            if key.is_empty() {
                return Err(ClusterError::ConfigParse {
                    line: line_no,
                    reason: "empty option name".to_string(),
                });
            }

            doc.sections
                .entry(section.clone())
                .or_default()
                .insert(key.clone(), value);
            last_key = Some(key);
        }

        Ok(doc)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let doc = Self::parse(&text)?;
        tracing::debug!(path = %path.display(), sections = doc.sections.len(), "Loaded configuration");
        Ok(doc)
    }

    pub fn has_section(&self, name: &str) -> bool {
        self.sections.contains_key(name)
    }

    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.get(name)
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|s| s.get(&key.to_lowercase()))
            .map(String::as_str)
    }

    /// Set an option, creating the section when needed.
    pub fn set(&mut self, section: &str, key: &str, value: impl Into<String>) {
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(key.to_lowercase(), value.into());
    }

    pub fn remove_section(&mut self, name: &str) -> Option<Section> {
        self.sections.remove(name)
    }

    /// Fail with the first required Manager section that is absent.
    pub fn validate_manager(&self) -> Result<()> {
        for name in MANAGER_SECTIONS {
            if !self.has_section(name) {
                return Err(ClusterError::MissingSection(name.to_string()));
            }
        }
        Ok(())
    }

    /// Read and parse an option, falling back to `default` when absent.
    pub fn parse_or<T: FromStr>(&self, section: &str, key: &str, default: T) -> Result<T> {
        parse_option(section, self.section(section), key, default)
    }

    /// Node identifiers declared in `cluster.nodes`.
    pub fn node_ids(&self) -> Vec<String> {
        self.get("cluster", "nodes")
            .map(|nodes| {
                nodes
                    .split(|c: char| c == ',' || c.is_whitespace())
                    .map(str::trim)
                    .filter(|n| !n.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// True if the node is declared in the topology or has an override section.
    pub fn is_declared_node(&self, node_id: &str) -> bool {
        self.node_ids().iter().any(|n| n == node_id)
            || self.has_section(&format!("{}{}", NODE_SECTION_PREFIX, node_id))
    }

    /// Build the configuration subset a node needs to run locally.
    ///
    /// Overrides from `[node:<id>]` are written as `section.option = value`
    /// and only apply to the sections that make up a localconf.
    pub fn localconf_for(&self, node_id: &str) -> LocalConf {
        let mut conf = LocalConf::new();
        for name in LOCALCONF_SECTIONS {
            conf.insert(
                name.to_string(),
                self.section(name).cloned().unwrap_or_default(),
            );
        }

        if let Some(overrides) = self.section(&format!("{}{}", NODE_SECTION_PREFIX, node_id)) {
            for (qualified, value) in overrides {
                let Some((section, key)) = qualified.split_once('.') else {
                    tracing::warn!(node = node_id, option = %qualified, "Ignoring unqualified node override");
                    continue;
                };
                if let Some(target) = conf.get_mut(section) {
                    target.insert(key.to_string(), value.clone());
                } else {
                    tracing::warn!(node = node_id, section, "Ignoring override for non-local section");
                }
            }
        }

        conf
    }
}

fn parse_option<T: FromStr>(
    section_name: &str,
    section: Option<&Section>,
    key: &str,
    default: T,
) -> Result<T> {
    match section.and_then(|s| s.get(key)) {
        Some(raw) => raw.trim().parse().map_err(|_| ClusterError::InvalidOption {
            section: section_name.to_string(),
            key: key.to_string(),
            value: raw.clone(),
        }),
        None => Ok(default),
    }
}

fn parse_millis(section_name: &str, section: Option<&Section>, key: &str, default_ms: u64) -> Result<Duration> {
    parse_option(section_name, section, key, default_ms).map(Duration::from_millis)
}

/// Like [`parse_millis`], for periods that drive timers and must be positive.
fn parse_period(section_name: &str, section: Option<&Section>, key: &str, default_ms: u64) -> Result<Duration> {
    let period = parse_millis(section_name, section, key, default_ms)?;
    if period.is_zero() {
        return Err(ClusterError::InvalidOption {
            section: section_name.to_string(),
            key: key.to_string(),
            value: "0".to_string(),
        });
    }
    Ok(period)
}

/// What the Manager does when an undeclared node asks for its configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownNodePolicy {
    /// Serve the baseline sections without per-node overrides.
    #[default]
    Default,
    /// Reply with an error.
    Reject,
}

impl FromStr for UnknownNodePolicy {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "default" | "allow" => Ok(UnknownNodePolicy::Default),
            "reject" | "deny" => Ok(UnknownNodePolicy::Reject),
            _ => Err(()),
        }
    }
}

/// Socket-level settings shared by every endpoint, read from `[zeromq]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportSettings {
    pub max_frame_bytes: usize,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            max_frame_bytes: 8 * 1024 * 1024,
            connect_timeout: Duration::from_millis(5000),
            request_timeout: Duration::from_millis(5000),
        }
    }
}

fn parse_frame_limit(section: Option<&Section>, default: usize) -> Result<usize> {
    let limit = parse_option("zeromq", section, "max_frame_bytes", default)?;
    if limit == 0 {
        return Err(ClusterError::InvalidOption {
            section: "zeromq".to_string(),
            key: "max_frame_bytes".to_string(),
            value: "0".to_string(),
        });
    }
    Ok(limit)
}

impl TransportSettings {
    pub fn from_section(section: Option<&Section>) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            max_frame_bytes: parse_frame_limit(section, defaults.max_frame_bytes)?,
            connect_timeout: parse_period(
                "zeromq",
                section,
                "connect_timeout_ms",
                defaults.connect_timeout.as_millis() as u64,
            )?,
            request_timeout: parse_period(
                "zeromq",
                section,
                "request_timeout_ms",
                defaults.request_timeout.as_millis() as u64,
            )?,
        })
    }
}

/// Typed Manager configuration derived from a validated document.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub bind_host: String,
    /// Host SlaveDrivers are told to contact; defaults to the bound address.
    pub advertise_host: Option<String>,
    pub reply_port: u16,
    pub status_port: u16,
    pub conf_port: u16,
    pub streamer_port: u16,
    pub sink_port: u16,
    pub dashboard_port: Option<u16>,
    pub heartbeat_timeout: Duration,
    pub sweep_interval: Duration,
    pub max_jobs: usize,
    pub streamer_hwm: usize,
    pub unknown_nodes: UnknownNodePolicy,
    pub bootstrap_timeout: Duration,
    pub launch_command: Option<String>,
    pub transport: TransportSettings,
    pub document: ConfigDocument,
}

impl ManagerConfig {
    /// Validate required sections and read the Manager's options.
    pub fn from_document(document: ConfigDocument) -> Result<Self> {
        document.validate_manager()?;

        let manager = document.section("manager");
        let dashboard_port = match manager.and_then(|m| m.get("dashboard_port")) {
            Some(_) => Some(parse_option("manager", manager, "dashboard_port", 0u16)?),
            None => None,
        };

        Ok(Self {
            bind_host: manager
                .and_then(|m| m.get("bind"))
                .cloned()
                .unwrap_or_else(|| "0.0.0.0".to_string()),
            advertise_host: manager.and_then(|m| m.get("advertise")).cloned(),
            reply_port: parse_option("manager", manager, "replyport", DEFAULT_REPLY_PORT)?,
            status_port: parse_option("manager", manager, "statusport", DEFAULT_STATUS_PORT)?,
            conf_port: parse_option("manager", manager, "conf_reply", DEFAULT_CONF_PORT)?,
            streamer_port: document.parse_or("streamer", "port", DEFAULT_STREAMER_PORT)?,
            sink_port: document.parse_or("sink", "port", DEFAULT_SINK_PORT)?,
            dashboard_port,
            heartbeat_timeout: parse_period("manager", manager, "heartbeat_timeout_ms", 15_000)?,
            sweep_interval: parse_period("manager", manager, "sweep_interval_ms", 1_000)?,
            max_jobs: parse_option("manager", manager, "max_jobs", 10_000usize)?,
            streamer_hwm: document.parse_or("streamer", "hwm", 1_000usize)?.max(1),
            unknown_nodes: parse_option("manager", manager, "unknown_nodes", UnknownNodePolicy::Default)?,
            bootstrap_timeout: parse_millis(
                "cluster",
                document.section("cluster"),
                "bootstrap_timeout_ms",
                30_000,
            )?,
            launch_command: document.get("cluster", "launch").map(str::to_string),
            transport: TransportSettings::from_section(document.section("zeromq"))?,
            document,
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_document(ConfigDocument::load(path)?)
    }
}

/// Settings a SlaveDriver derives from the `localconf` it fetched.
#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub heartbeat_interval: Duration,
    pub max_restarts: u32,
    pub restart_backoff: Duration,
    pub restart_backoff_max: Duration,
    pub worker_count: usize,
    pub worker_command: String,
    pub streamer_port: u16,
    pub sink_port: u16,
    pub transport: TransportSettings,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(5_000),
            max_restarts: 5,
            restart_backoff: Duration::from_millis(500),
            restart_backoff_max: Duration::from_millis(30_000),
            worker_count: 4,
            worker_command: "cat".to_string(),
            streamer_port: DEFAULT_STREAMER_PORT,
            sink_port: DEFAULT_SINK_PORT,
            transport: TransportSettings::default(),
        }
    }
}

impl DriverSettings {
    pub fn from_localconf(conf: &LocalConf) -> Result<Self> {
        let d = Self::default();
        let driver = conf.get("slavedriver");
        let worker = conf.get("worker");

        Ok(Self {
            heartbeat_interval: parse_period(
                "slavedriver",
                driver,
                "heartbeat_interval_ms",
                d.heartbeat_interval.as_millis() as u64,
            )?,
            max_restarts: parse_option("slavedriver", driver, "max_restarts", d.max_restarts)?,
            restart_backoff: parse_millis(
                "slavedriver",
                driver,
                "restart_backoff_ms",
                d.restart_backoff.as_millis() as u64,
            )?,
            restart_backoff_max: parse_period(
                "slavedriver",
                driver,
                "restart_backoff_max_ms",
                d.restart_backoff_max.as_millis() as u64,
            )?,
            worker_count: parse_option("worker", worker, "count", d.worker_count)?,
            worker_command: worker
                .and_then(|w| w.get("command"))
                .cloned()
                .unwrap_or(d.worker_command),
            streamer_port: parse_option("streamer", conf.get("streamer"), "port", d.streamer_port)?,
            sink_port: parse_option("sink", conf.get("sink"), "port", d.sink_port)?,
            transport: TransportSettings::from_section(conf.get("zeromq"))?,
        })
    }
}
