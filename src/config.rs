#![forbid(unsafe_code)]

// Fleet definition (rooms, users, tokens) and per-run settings

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading the fleet file
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid fleet file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("User '{username}' in room '{room_id}' has no token entry")]
    UnknownUser { username: String, room_id: String },

    #[error("Invalid setting: {0}")]
    InvalidSetting(String),
}

/// Opaque room identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One simulated client: who it is, how it authenticates, where it joins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub username: String,
    pub token: String,
    pub room_id: RoomId,
}

impl ClientIdentity {
    pub fn new(username: impl Into<String>, token: impl Into<String>, room_id: RoomId) -> Self {
        Self {
            username: username.into(),
            token: token.into(),
            room_id,
        }
    }

    /// Label used as the leading field of every log line for this client.
    pub fn label(&self) -> String {
        format!("{}@{}", self.username, self.room_id)
    }
}

// On-disk shape, matching the rooms_users.json files the service's test tooling produces.

#[derive(Debug, Deserialize)]
struct FleetFile {
    #[serde(default)]
    users: Vec<UserEntry>,
    #[serde(default)]
    rooms: Vec<RoomEntry>,
}

#[derive(Debug, Deserialize)]
struct UserEntry {
    name: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct RoomEntry {
    id: RoomId,
    #[serde(default)]
    users: Vec<RoomMember>,
}

#[derive(Debug, Deserialize)]
struct RoomMember {
    username: String,
}

/// Immutable set of identities to drive, one per (room, member) pair.
#[derive(Debug, Clone, Default)]
pub struct FleetConfig {
    identities: Arc<Vec<ClientIdentity>>,
}

impl FleetConfig {
    pub fn new(identities: Vec<ClientIdentity>) -> Self {
        Self {
            identities: Arc::new(identities),
        }
    }

    /// Load the fleet file from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw)
    }

    /// Parse a fleet definition and resolve every room member's token.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let file: FleetFile = serde_json::from_str(raw)?;

        let tokens: HashMap<&str, &str> = file
            .users
            .iter()
            .map(|u| (u.name.as_str(), u.token.as_str()))
            .collect();

        let mut identities = Vec::new();
        for room in &file.rooms {
            for member in &room.users {
                let token = tokens.get(member.username.as_str()).ok_or_else(|| {
                    ConfigError::UnknownUser {
                        username: member.username.clone(),
                        room_id: room.id.to_string(),
                    }
                })?;
                identities.push(ClientIdentity::new(
                    member.username.clone(),
                    *token,
                    room.id.clone(),
                ));
            }
        }

        Ok(Self::new(identities))
    }

    pub fn identities(&self) -> &[ClientIdentity] {
        &self.identities
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Number of distinct rooms referenced by the fleet
    pub fn room_count(&self) -> usize {
        let mut rooms: Vec<&RoomId> = self.identities.iter().map(|i| &i.room_id).collect();
        rooms.sort();
        rooms.dedup();
        rooms.len()
    }
}

/// Timing knobs for one run
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub server_url: String,
    /// Chat messages each session sends
    pub messages: usize,
    /// Pause after every round trip (not timed)
    pub interval: Duration,
    /// Upper bound on how long to wait for every session to become ready
    pub settle: Duration,
    /// Bound on a single echo wait; `None` waits until the connection closes.
    pub echo_timeout: Option<Duration>,
    /// Bound on the whole run; sessions still running at expiry are aborted.
    pub deadline: Option<Duration>,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:4000".to_string(),
            messages: 5,
            interval: Duration::from_secs(2),
            settle: Duration::from_secs(1),
            echo_timeout: Some(Duration::from_secs(10)),
            deadline: None,
        }
    }
}

impl RunSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_url.trim().is_empty() {
            return Err(ConfigError::InvalidSetting("server url must not be empty".into()));
        }
        if self.echo_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::InvalidSetting(
                "echo timeout must be positive (omit it for an unbounded wait)".into(),
            ));
        }
        if self.deadline == Some(Duration::ZERO) {
            return Err(ConfigError::InvalidSetting("deadline must be positive".into()));
        }
        Ok(())
    }
}
