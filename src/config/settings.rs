use serde::Deserialize;

/// Top-level configuration settings for the application.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub persistence: PersistenceSettings,
    pub relay: RelaySettings,
    pub log: LogSettings,
}

/// Address the WebSocket server binds to.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

/// Where the message log lives and how eagerly it is flushed.
#[derive(Debug, Deserialize, Clone)]
pub struct PersistenceSettings {
    pub path: String,
    /// Flush to disk before an append is reported as successful.
    pub flush_on_append: bool,
}

/// Session resumption parameters for the relay.
#[derive(Debug, Deserialize, Clone)]
pub struct RelaySettings {
    /// How long a disconnected session can be resumed without replay.
    pub recovery_window_secs: u64,
    /// Deliveries buffered for a detached session before it loses resumption.
    pub max_backlog: usize,
    pub sweep_interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Missing values are filled from `Settings::default()`.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub persistence: Option<PartialPersistenceSettings>,
    pub relay: Option<PartialRelaySettings>,
    pub log: Option<PartialLogSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialPersistenceSettings {
    pub path: Option<String>,
    pub flush_on_append: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialRelaySettings {
    pub recovery_window_secs: Option<u64>,
    pub max_backlog: Option<usize>,
    pub sweep_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLogSettings {
    pub level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 3000,
            },
            persistence: PersistenceSettings {
                path: "popchat_db".to_string(),
                flush_on_append: true,
            },
            relay: RelaySettings::default(),
            log: LogSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            recovery_window_secs: 120,
            max_backlog: 10_000,
            sweep_interval_ms: 1000,
        }
    }
}

impl PartialSettings {
    /// Overlay the values present here onto `defaults`.
    pub fn merge(self, defaults: Settings) -> Settings {
        let server = self.server.unwrap_or_default();
        let persistence = self.persistence.unwrap_or_default();
        let relay = self.relay.unwrap_or_default();
        let log = self.log.unwrap_or_default();

        Settings {
            server: ServerSettings {
                host: server.host.unwrap_or(defaults.server.host),
                port: server.port.unwrap_or(defaults.server.port),
            },
            persistence: PersistenceSettings {
                path: persistence.path.unwrap_or(defaults.persistence.path),
                flush_on_append: persistence
                    .flush_on_append
                    .unwrap_or(defaults.persistence.flush_on_append),
            },
            relay: RelaySettings {
                recovery_window_secs: relay
                    .recovery_window_secs
                    .unwrap_or(defaults.relay.recovery_window_secs),
                max_backlog: relay.max_backlog.unwrap_or(defaults.relay.max_backlog),
                sweep_interval_ms: relay
                    .sweep_interval_ms
                    .unwrap_or(defaults.relay.sweep_interval_ms),
            },
            log: LogSettings {
                level: log.level.unwrap_or(defaults.log.level),
            },
        }
    }
}
