//! # Node Configuration
//!
//! Loaded once at startup from an INI-style file plus a section name, the
//! same pair of arguments the experiment orchestration passes to every node
//! process. Unrecognized keys are ignored so one file can carry sections for
//! heterogeneous nodes; missing `my_id` or `port` fails startup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use configparser::ini::Ini;

use crate::engine::{ReplyPolicy, RoutingMode};
use crate::identity::{Address, Identifier, Locator};
use crate::locator_update::UnsolicitedUpdatePolicy;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Load(String),
    #[error("section [{0}] not found in config file")]
    MissingSection(String),
    #[error("required key `{0}` is missing")]
    MissingKey(&'static str),
    #[error("invalid value for `{key}`: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

/// Everything a node needs to run, resolved with the defaults applied.
#[derive(Clone, Debug)]
pub struct Config {
    pub my_id: Identifier,
    /// The multicast groups (subnetworks) this node joins at startup.
    pub locators: Vec<Locator>,
    pub port: u16,
    pub hop_limit: u8,
    pub packet_buffer_size_bytes: usize,
    /// Whether our own multicast transmissions loop back to us. Required
    /// when several nodes share one host.
    pub loopback: bool,
    /// Namespaces the multicast groups of one experiment run.
    pub unique_identifier: String,
    /// Interface index for multicast sockets; 0 picks the default.
    pub multicast_interface: u32,
    pub router_refresh_delay: Duration,
    pub correspondent_timeout: Duration,
    pub mode: RoutingMode,
    pub reply_policy: ReplyPolicy,
    pub number_of_paths: usize,
    pub unsolicited_updates: UnsolicitedUpdatePolicy,
    /// Lifetime budget of local data originations.
    pub max_sends: u64,
    pub send_delay: Duration,
    /// CSV record of every local send, for post-experiment analysis.
    pub save_file_loc: PathBuf,
    pub sink_loc: Locator,
    pub sink_id: Identifier,
    /// Delivered-payload record written when this node is the sink.
    pub sink_save_file: PathBuf,
    pub is_sink: bool,
}

impl Config {
    pub fn load(path: &Path, section: &str) -> Result<Self, ConfigError> {
        let mut ini = Ini::new();
        ini.load(path).map_err(ConfigError::Load)?;

        // `Ini::new` lowercases section and key names, like the orchestration
        // tooling expects.
        let section = section.to_lowercase();
        if !ini.sections().contains(&section) {
            return Err(ConfigError::MissingSection(section));
        }

        let my_id = get_u64(&ini, &section, "my_id")?
            .map(Identifier)
            .ok_or(ConfigError::MissingKey("my_id"))?;
        let port = get_u64(&ini, &section, "port")?
            .map(|v| narrow::<u16>("port", v))
            .transpose()?
            .ok_or(ConfigError::MissingKey("port"))?;

        let locators = match ini.get(&section, "group_ids") {
            Some(raw) => parse_group_ids(&raw)?,
            None => vec![Locator(1)],
        };

        let hop_limit = get_u64(&ini, &section, "hop_limit")?
            .map(|v| narrow::<u8>("hop_limit", v))
            .transpose()?
            .unwrap_or(32);
        let packet_buffer_size_bytes = get_u64(&ini, &section, "packet_buffer_size_bytes")?
            .map(|v| v as usize)
            .unwrap_or(512);
        let loopback = get_bool(&ini, &section, "loopback")?.unwrap_or(true);
        let unique_identifier = ini
            .get(&section, "unique_identifier")
            .unwrap_or_else(|| "0".to_string());
        let multicast_interface = get_u64(&ini, &section, "multicast_interface")?
            .map(|v| narrow::<u32>("multicast_interface", v))
            .transpose()?
            .unwrap_or(0);

        let router_refresh_delay =
            Duration::from_secs(get_u64(&ini, &section, "router_refresh_delay_secs")?.unwrap_or(60));
        let correspondent_timeout = Duration::from_secs(
            get_u64(&ini, &section, "correspondent_timeout_secs")?.unwrap_or(120),
        );

        let mode = match ini.get(&section, "mode").as_deref() {
            None | Some("on-demand") => RoutingMode::OnDemand,
            Some("multipath") => RoutingMode::Multipath,
            Some("random-walk") => RoutingMode::RandomWalk,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: "mode",
                    reason: format!("unknown mode `{other}`"),
                })
            }
        };
        let reply_policy = match ini.get(&section, "reply_policy").as_deref() {
            None | Some("first-wins") => ReplyPolicy::FirstWins,
            Some("prefer-shorter") => ReplyPolicy::PreferShorter,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: "reply_policy",
                    reason: format!("unknown policy `{other}`"),
                })
            }
        };
        let unsolicited_updates = match ini.get(&section, "unsolicited_updates").as_deref() {
            None | Some("accept") => UnsolicitedUpdatePolicy::Accept,
            Some("ignore") => UnsolicitedUpdatePolicy::Ignore,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: "unsolicited_updates",
                    reason: format!("unknown policy `{other}`"),
                })
            }
        };
        let number_of_paths = get_u64(&ini, &section, "number_of_paths")?
            .map(|v| v as usize)
            .unwrap_or(3);

        let max_sends = get_u64(&ini, &section, "max_sends")?.unwrap_or(100);
        let send_delay =
            Duration::from_secs(get_u64(&ini, &section, "send_delay_secs")?.unwrap_or(10));
        let save_file_loc = PathBuf::from(
            ini.get(&section, "save_file_loc")
                .unwrap_or_else(|| "send_log.csv".to_string()),
        );
        let sink_loc = Locator(get_u64(&ini, &section, "sink_loc")?.unwrap_or(1));
        let sink_id = Identifier(get_u64(&ini, &section, "sink_id")?.unwrap_or(1));
        let sink_save_file = PathBuf::from(
            ini.get(&section, "sink_save_file")
                .unwrap_or_else(|| "sink_log.csv".to_string()),
        );
        let is_sink = get_bool(&ini, &section, "is_sink")?.unwrap_or(my_id == sink_id);

        Ok(Self {
            my_id,
            locators,
            port,
            hop_limit,
            packet_buffer_size_bytes,
            loopback,
            unique_identifier,
            multicast_interface,
            router_refresh_delay,
            correspondent_timeout,
            mode,
            reply_policy,
            number_of_paths,
            unsolicited_updates,
            max_sends,
            send_delay,
            save_file_loc,
            sink_loc,
            sink_id,
            sink_save_file,
            is_sink,
        })
    }

    /// Where this node's data payloads are headed.
    pub fn sink_address(&self) -> Address {
        Address::new(self.sink_loc, self.sink_id)
    }
}

fn get_u64(ini: &Ini, section: &str, key: &'static str) -> Result<Option<u64>, ConfigError> {
    ini.getuint(section, key)
        .map_err(|reason| ConfigError::InvalidValue { key, reason })
}

fn get_bool(ini: &Ini, section: &str, key: &'static str) -> Result<Option<bool>, ConfigError> {
    ini.getbool(section, key)
        .map_err(|reason| ConfigError::InvalidValue { key, reason })
}

fn narrow<T: TryFrom<u64>>(key: &'static str, value: u64) -> Result<T, ConfigError> {
    T::try_from(value).map_err(|_| ConfigError::InvalidValue {
        key,
        reason: format!("{value} is out of range"),
    })
}

fn parse_group_ids(raw: &str) -> Result<Vec<Locator>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<u64>()
                .map(Locator)
                .map_err(|e| ConfigError::InvalidValue {
                    key: "group_ids",
                    reason: format!("`{part}`: {e}"),
                })
        })
        .collect()
}
