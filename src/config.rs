// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Daemon configuration.
//!
//! Configuration is TOML with one `[settings]` table and one
//! `[datasets."pool/name"]` table per managed dataset; each dataset may
//! carry up to two replication edges (`replicate`, `replicate2`). Unknown
//! keys are rejected.
//!
//! Raw sections deserialize leniently and are then resolved into validated
//! runtime types ([`DatasetConfig`], [`ReplicationEdge`]): schemas and
//! schedules are parsed, option clashes rejected, endpoint commands
//! rendered, and fallback chains applied. Resolution errors are fatal at
//! load time, before any dataset is touched.
//!
//! ```toml
//! [settings]
//! sleep_time = "5m"
//!
//! [datasets."tank/data"]
//! schedule = "09:00-17:00/2"
//! schema = "1k24h7d4w12m5y"
//!
//! [datasets."tank/data".replicate]
//! target = "backup/data"
//! host = "backup.example.net"
//! receive_save = true
//! ```

use crate::error::{EngineError, Result};
use crate::retention::RetentionSchema;
use crate::schedule::ScheduleSpec;
use crate::zfs::{Direction, SendOptions, DEFAULT_BUFFER_SIZE};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Remote-shell command template; `{login}`, `{port}` and `{host}` are
/// substituted at resolution time.
pub const ENDPOINT_TEMPLATE: &str = "ssh -l {login} -p {port} {host}";

fn de_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    humantime::parse_duration(&text).map_err(serde::de::Error::custom)
}

fn default_sleep_time() -> Duration {
    Duration::from_secs(300)
}

fn default_startup_hysteresis() -> Duration {
    Duration::from_secs(15)
}

fn default_connect_retry_wait() -> Duration {
    Duration::from_secs(3)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_true() -> bool {
    true
}

fn default_port() -> u16 {
    22
}

fn default_login() -> String {
    "root".to_string()
}

fn default_buffer_size() -> String {
    DEFAULT_BUFFER_SIZE.to_string()
}

/// Global daemon settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsConfig {
    /// Pause between cycles.
    #[serde(default = "default_sleep_time", deserialize_with = "de_duration")]
    pub sleep_time: Duration,

    /// Schedule-cursor slack at startup.
    #[serde(
        default = "default_startup_hysteresis",
        deserialize_with = "de_duration"
    )]
    pub startup_hysteresis: Duration,

    /// Wait between connectivity probe attempts.
    #[serde(
        default = "default_connect_retry_wait",
        deserialize_with = "de_duration"
    )]
    pub connect_retry_wait: Duration,

    /// Per-attempt connectivity probe timeout.
    #[serde(default = "default_connect_timeout", deserialize_with = "de_duration")]
    pub connect_timeout: Duration,
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            sleep_time: default_sleep_time(),
            startup_hysteresis: default_startup_hysteresis(),
            connect_retry_wait: default_connect_retry_wait(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

/// Raw per-edge TOML section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EdgeSection {
    /// Destination dataset on the peer (push edge).
    pub target: Option<String>,
    /// Source dataset on the peer (pull edge).
    pub source: Option<String>,

    /// Peer host; absent means a local (same-host) edge.
    pub host: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_login")]
    pub login: String,
    /// Raw remote-shell command, overriding the rendered template.
    pub endpoint: Option<String>,

    #[serde(default)]
    pub full_clone: bool,
    pub all_snapshots: Option<bool>,
    #[serde(default)]
    pub send_compression: bool,
    #[serde(default)]
    pub send_properties: bool,
    #[serde(default)]
    pub send_raw: bool,
    #[serde(default)]
    pub receive_save: bool,
    pub receive_umount: Option<bool>,
    pub receive_no_mountpoint: Option<bool>,
    pub receive_mountpoint: Option<String>,

    #[serde(default)]
    pub append_basename: bool,
    #[serde(default)]
    pub append_fullname: bool,

    #[serde(default = "default_buffer_size")]
    pub buffer_size: String,
    /// External compression filter for the network hop.
    pub compression: Option<String>,
}

/// Raw per-dataset TOML section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatasetSection {
    /// Mountpoint override; normally taken from the dataset listing.
    pub mountpoint: Option<String>,

    /// Whether this daemon takes snapshots of the dataset.
    #[serde(default = "default_true")]
    pub snapshot: bool,

    /// Schedule spec (`09:00`, `09:00-17:00/2`, `trigger`, ...).
    pub schedule: String,

    /// Base retention schema, and its per-context overrides.
    pub schema: String,
    pub local_schema: Option<String>,
    pub remote_schema: Option<String>,
    pub remote2_schema: Option<String>,

    /// Expire foreign (non-timestamp) snapshots too, and overrides.
    #[serde(default)]
    pub clean_all: bool,
    pub local_clean_all: Option<bool>,
    pub remote_clean_all: Option<bool>,
    pub remote2_clean_all: Option<bool>,

    /// Manage foreign (non-timestamp) snapshots too.
    #[serde(default)]
    pub all_snapshots: bool,

    pub preexec: Option<String>,
    pub postexec: Option<String>,
    pub replicate_postexec: Option<String>,

    /// Log every external command at debug level.
    #[serde(default)]
    pub log_commands: bool,

    pub replicate: Option<EdgeSection>,
    pub replicate2: Option<EdgeSection>,
}

/// Whole config file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    #[serde(default)]
    pub settings: SettingsConfig,
    #[serde(default)]
    pub datasets: BTreeMap<String, DatasetSection>,
}

impl DaemonConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| EngineError::ConfigInvalid(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Validate and resolve every dataset section.
    pub fn resolve(&self) -> Result<BTreeMap<String, DatasetConfig>> {
        let mut resolved = BTreeMap::new();
        for (name, section) in &self.datasets {
            resolved.insert(name.clone(), DatasetConfig::resolve(name, section)?);
        }
        Ok(resolved)
    }
}

/// Validated runtime configuration for one replication edge.
#[derive(Debug, Clone)]
pub struct ReplicationEdge {
    pub direction: Direction,
    /// Peer-side dataset (target for push, source for pull), append
    /// suffixes applied.
    pub peer_dataset: String,
    /// Rendered remote-shell command; empty for a same-host edge.
    pub endpoint: String,
    /// Probe address for the connectivity gate; empty host skips probing.
    pub host: String,
    pub port: u16,
    /// Retention schema applied on the peer after reconciliation.
    pub schema: RetentionSchema,
    /// Expire foreign snapshots on the peer too.
    pub clean_all: bool,
    pub options: SendOptions,
}

/// Validated runtime configuration for one dataset.
#[derive(Debug, Clone)]
pub struct DatasetConfig {
    pub name: String,
    pub mountpoint: Option<String>,
    pub snapshot: bool,
    pub schedule: ScheduleSpec,
    pub schema: RetentionSchema,
    /// Schema for the local side of a pull dataset.
    pub local_schema: RetentionSchema,
    /// Expire foreign snapshots too, locally and per context.
    pub clean_all: bool,
    pub local_clean_all: bool,
    pub all_snapshots: bool,
    pub preexec: Option<String>,
    pub postexec: Option<String>,
    pub replicate_postexec: Option<String>,
    pub log_commands: bool,
    pub edges: Vec<ReplicationEdge>,
}

impl DatasetConfig {
    fn resolve(name: &str, section: &DatasetSection) -> Result<Self> {
        let context = |message: String| {
            EngineError::ConfigInvalid(format!("dataset '{}': {}", name, message))
        };

        let schedule = ScheduleSpec::parse(&section.schedule)
            .map_err(|e| context(e.to_string()))?;
        let schema =
            RetentionSchema::parse(&section.schema).map_err(|e| context(e.to_string()))?;
        let parse_override = |value: &Option<String>| -> Result<RetentionSchema> {
            match value {
                Some(text) => RetentionSchema::parse(text).map_err(|e| context(e.to_string())),
                None => Ok(schema),
            }
        };
        let local_schema = parse_override(&section.local_schema)?;

        let mut edges = Vec::new();
        let edge_specs = [
            (
                &section.replicate,
                &section.remote_schema,
                section.remote_clean_all,
            ),
            (
                &section.replicate2,
                &section.remote2_schema,
                section.remote2_clean_all,
            ),
        ];
        for (edge, remote_schema, remote_clean_all) in edge_specs {
            let Some(edge) = edge else { continue };
            edges.push(ReplicationEdge::resolve(
                name,
                edge,
                parse_override(remote_schema)?,
                remote_clean_all.unwrap_or(section.clean_all),
                section.all_snapshots,
            )?);
        }

        Ok(Self {
            name: name.to_string(),
            mountpoint: section.mountpoint.clone(),
            snapshot: section.snapshot,
            schedule,
            schema,
            local_schema,
            clean_all: section.clean_all,
            local_clean_all: section.local_clean_all.unwrap_or(section.clean_all),
            all_snapshots: section.all_snapshots,
            preexec: section.preexec.clone(),
            postexec: section.postexec.clone(),
            replicate_postexec: section.replicate_postexec.clone(),
            log_commands: section.log_commands,
            edges,
        })
    }

    /// Whether any edge turns on cumulative replication.
    pub fn any_full_clone(&self) -> bool {
        self.edges.iter().any(|e| e.options.full_clone)
    }
}

impl ReplicationEdge {
    fn resolve(
        dataset: &str,
        section: &EdgeSection,
        schema: RetentionSchema,
        clean_all: bool,
        dataset_all_snapshots: bool,
    ) -> Result<Self> {
        let context = |message: String| {
            EngineError::ConfigInvalid(format!(
                "dataset '{}' replication edge: {}",
                dataset, message
            ))
        };

        let (direction, peer_dataset) = match (&section.target, &section.source) {
            (Some(target), None) => (Direction::Push, target.clone()),
            (None, Some(source)) => (Direction::Pull, source.clone()),
            _ => {
                return Err(context(
                    "exactly one of 'target' and 'source' is required".to_string(),
                ))
            }
        };

        if section.append_basename && section.append_fullname {
            return Err(context(
                "'append_basename' and 'append_fullname' clash".to_string(),
            ));
        }
        if section.receive_no_mountpoint == Some(true) && section.receive_mountpoint.is_some() {
            return Err(context(
                "'receive_no_mountpoint' and 'receive_mountpoint' clash".to_string(),
            ));
        }

        let suffix = if section.append_basename {
            dataset.rsplit('/').next().map(str::to_string)
        } else if section.append_fullname {
            Some(dataset.to_string())
        } else {
            None
        };
        let peer_dataset = match (&suffix, direction) {
            (Some(suffix), Direction::Push) => format!("{}/{}", peer_dataset, suffix),
            _ => peer_dataset,
        };
        let receive_mountpoint = match (&section.receive_mountpoint, &suffix) {
            (Some(mountpoint), Some(suffix)) => Some(format!("{}/{}", mountpoint, suffix)),
            (Some(mountpoint), None) => Some(mountpoint.clone()),
            (None, _) => None,
        };

        let endpoint = match (&section.endpoint, &section.host) {
            (Some(raw), _) => raw.clone(),
            (None, Some(host)) => ENDPOINT_TEMPLATE
                .replace("{login}", &section.login)
                .replace("{port}", &section.port.to_string())
                .replace("{host}", host),
            (None, None) => String::new(),
        };

        // Cumulative and property-carrying streams replace the destination
        // wholesale; by default do not let it mount or keep the source's
        // mountpoint.
        let implied = section.full_clone || section.send_properties;
        let receive_umount = section.receive_umount.unwrap_or(implied);
        let receive_no_mountpoint = section
            .receive_no_mountpoint
            .unwrap_or(implied && receive_mountpoint.is_none());

        Ok(Self {
            direction,
            peer_dataset,
            endpoint,
            host: section.host.clone().unwrap_or_default(),
            port: section.port,
            schema,
            clean_all,
            options: SendOptions {
                full_clone: section.full_clone,
                all_snapshots: section.all_snapshots.unwrap_or(dataset_all_snapshots),
                send_compression: section.send_compression,
                send_properties: section.send_properties,
                send_raw: section.send_raw,
                receive_save: section.receive_save,
                receive_umount,
                receive_no_mountpoint,
                receive_mountpoint,
                buffer_size: section.buffer_size.clone(),
                compression: section.compression.clone(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve_one(toml: &str) -> Result<DatasetConfig> {
        let config = DaemonConfig::from_toml_str(toml)?;
        let mut resolved = config.resolve()?;
        resolved
            .pop_first()
            .map(|(_, v)| v)
            .ok_or_else(|| EngineError::Internal("no dataset".to_string()))
    }

    #[test]
    fn test_minimal_dataset() {
        let ds = resolve_one(
            r#"
            [datasets."tank/data"]
            schedule = "09:00"
            schema = "7d3w12m5y"
            "#,
        )
        .unwrap();
        assert_eq!(ds.name, "tank/data");
        assert!(ds.snapshot);
        assert!(!ds.clean_all);
        assert!(ds.edges.is_empty());
        assert_eq!(ds.local_schema, ds.schema);
    }

    #[test]
    fn test_settings_defaults_and_humantime() {
        let config = DaemonConfig::from_toml_str(
            r#"
            [settings]
            sleep_time = "2m 30s"
            "#,
        )
        .unwrap();
        assert_eq!(config.settings.sleep_time, Duration::from_secs(150));
        assert_eq!(
            config.settings.startup_hysteresis,
            Duration::from_secs(15)
        );
        assert_eq!(
            config.settings.connect_retry_wait,
            Duration::from_secs(3)
        );
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let err = DaemonConfig::from_toml_str(
            r#"
            [settings]
            sleeep_time = "5m"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::ConfigInvalid(_)));
    }

    #[test]
    fn test_push_edge_endpoint_rendering() {
        let ds = resolve_one(
            r#"
            [datasets."tank/data"]
            schedule = "09:00"
            schema = "7d3w12m5y"
            [datasets."tank/data".replicate]
            target = "backup/data"
            host = "backup.example.net"
            "#,
        )
        .unwrap();
        let edge = &ds.edges[0];
        assert_eq!(edge.direction, Direction::Push);
        assert_eq!(edge.peer_dataset, "backup/data");
        assert_eq!(edge.endpoint, "ssh -l root -p 22 backup.example.net");
        assert_eq!(edge.host, "backup.example.net");
        assert_eq!(edge.port, 22);
    }

    #[test]
    fn test_edge_custom_login_port_and_raw_endpoint() {
        let ds = resolve_one(
            r#"
            [datasets."tank/data"]
            schedule = "09:00"
            schema = "7d3w12m5y"
            [datasets."tank/data".replicate]
            target = "backup/data"
            host = "backup.example.net"
            port = 2222
            login = "sync"
            [datasets."tank/data".replicate2]
            source = "vault/data"
            host = "vault.example.net"
            endpoint = "ssh -F /etc/engine/ssh_config vault"
            "#,
        )
        .unwrap();
        assert_eq!(
            ds.edges[0].endpoint,
            "ssh -l sync -p 2222 backup.example.net"
        );
        assert_eq!(ds.edges[1].direction, Direction::Pull);
        assert_eq!(ds.edges[1].endpoint, "ssh -F /etc/engine/ssh_config vault");
    }

    #[test]
    fn test_edge_requires_target_xor_source() {
        let err = resolve_one(
            r#"
            [datasets."tank/data"]
            schedule = "09:00"
            schema = "7d3w12m5y"
            [datasets."tank/data".replicate]
            target = "backup/data"
            source = "backup/data"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("target"));

        let err = resolve_one(
            r#"
            [datasets."tank/data"]
            schedule = "09:00"
            schema = "7d3w12m5y"
            [datasets."tank/data".replicate]
            host = "backup.example.net"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::ConfigInvalid(_)));
    }

    #[test]
    fn test_append_name_clash_rejected() {
        let err = resolve_one(
            r#"
            [datasets."tank/data"]
            schedule = "09:00"
            schema = "7d3w12m5y"
            [datasets."tank/data".replicate]
            target = "backup"
            append_basename = true
            append_fullname = true
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("append_basename"));
    }

    #[test]
    fn test_append_basename_suffixes_target_and_mountpoint() {
        let ds = resolve_one(
            r#"
            [datasets."tank/projects/data"]
            schedule = "09:00"
            schema = "7d3w12m5y"
            [datasets."tank/projects/data".replicate]
            target = "backup"
            append_basename = true
            receive_mountpoint = "/srv/replicas"
            "#,
        )
        .unwrap();
        let edge = &ds.edges[0];
        assert_eq!(edge.peer_dataset, "backup/data");
        assert_eq!(
            edge.options.receive_mountpoint.as_deref(),
            Some("/srv/replicas/data")
        );
    }

    #[test]
    fn test_append_fullname_suffixes_target() {
        let ds = resolve_one(
            r#"
            [datasets."tank/projects/data"]
            schedule = "09:00"
            schema = "7d3w12m5y"
            [datasets."tank/projects/data".replicate]
            target = "backup"
            append_fullname = true
            "#,
        )
        .unwrap();
        assert_eq!(ds.edges[0].peer_dataset, "backup/tank/projects/data");
    }

    #[test]
    fn test_receive_mountpoint_clash_rejected() {
        let err = resolve_one(
            r#"
            [datasets."tank/data"]
            schedule = "09:00"
            schema = "7d3w12m5y"
            [datasets."tank/data".replicate]
            target = "backup/data"
            receive_no_mountpoint = true
            receive_mountpoint = "/srv/replica"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("receive_no_mountpoint"));
    }

    #[test]
    fn test_full_clone_implies_receive_defaults() {
        let ds = resolve_one(
            r#"
            [datasets."tank/data"]
            schedule = "09:00"
            schema = "7d3w12m5y"
            [datasets."tank/data".replicate]
            target = "backup/data"
            full_clone = true
            "#,
        )
        .unwrap();
        let options = &ds.edges[0].options;
        assert!(options.receive_umount);
        assert!(options.receive_no_mountpoint);

        // An explicit mountpoint wins over the implied -x.
        let ds = resolve_one(
            r#"
            [datasets."tank/data"]
            schedule = "09:00"
            schema = "7d3w12m5y"
            [datasets."tank/data".replicate]
            target = "backup/data"
            full_clone = true
            receive_mountpoint = "/srv/replica"
            "#,
        )
        .unwrap();
        let options = &ds.edges[0].options;
        assert!(options.receive_umount);
        assert!(!options.receive_no_mountpoint);
    }

    #[test]
    fn test_schema_and_clean_all_fallback_chains() {
        let ds = resolve_one(
            r#"
            [datasets."tank/data"]
            schedule = "09:00"
            schema = "7d3w12m5y"
            remote_schema = "30d8w24m10y"
            clean_all = true
            local_clean_all = false
            [datasets."tank/data".replicate]
            target = "backup/data"
            [datasets."tank/data".replicate2]
            target = "vault/data"
            "#,
        )
        .unwrap();
        assert!(ds.clean_all);
        assert!(!ds.local_clean_all); // local override back off
        assert_eq!(
            ds.edges[0].schema,
            RetentionSchema::parse("30d8w24m10y").unwrap()
        );
        // Second edge falls back to the base schema and base clean_all.
        assert_eq!(ds.edges[1].schema, ds.schema);
        assert!(ds.edges[1].clean_all);
    }

    #[test]
    fn test_invalid_schema_is_fatal_with_dataset_context() {
        let err = resolve_one(
            r#"
            [datasets."tank/data"]
            schedule = "09:00"
            schema = "7x"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("tank/data"));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_buffer_size_default_and_override() {
        let ds = resolve_one(
            r#"
            [datasets."tank/data"]
            schedule = "09:00"
            schema = "7d3w12m5y"
            [datasets."tank/data".replicate]
            target = "backup/data"
            buffer_size = "1G"
            compression = "zstd"
            "#,
        )
        .unwrap();
        assert_eq!(ds.edges[0].options.buffer_size, "1G");
        assert_eq!(ds.edges[0].options.compression.as_deref(), Some("zstd"));
    }

    #[test]
    fn test_edge_all_snapshots_inherits_from_dataset() {
        let ds = resolve_one(
            r#"
            [datasets."tank/data"]
            schedule = "09:00"
            schema = "7d3w12m5y"
            all_snapshots = true
            [datasets."tank/data".replicate]
            target = "backup/data"
            [datasets."tank/data".replicate2]
            target = "vault/data"
            all_snapshots = false
            "#,
        )
        .unwrap();
        assert!(ds.edges[0].options.all_snapshots);
        assert!(!ds.edges[1].options.all_snapshots);
    }
}
