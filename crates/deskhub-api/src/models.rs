//! Records shared between the store, the caches and the HTTP layer

use serde::{Deserialize, Serialize};

/// A registered remote-desktop peer as seen by the presence cache.
///
/// `version` lives only in memory; the store never persists it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub row_id: i64,
    pub uuid: String,
    pub device_id: String,
    pub hostname: String,
    pub last_online_time: u64,
    pub last_online_ip: String,
    #[serde(skip)]
    pub version: u64,
}

impl PeerRecord {
    pub fn new(row_id: i64, uuid: impl Into<String>) -> Self {
        Self {
            row_id,
            uuid: uuid.into(),
            device_id: String::new(),
            hostname: String::new(),
            last_online_time: 0,
            last_online_ip: String::new(),
            version: 0,
        }
    }
}

/// System information a client uploads when it first registers
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SysInfo {
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    Enabled,
    Disabled,
}

impl UserStatus {
    pub fn as_i64(self) -> i64 {
        match self {
            UserStatus::Enabled => 1,
            UserStatus::Disabled => 2,
        }
    }

    pub fn from_i64(v: i64) -> Self {
        if v == 1 {
            UserStatus::Enabled
        } else {
            UserStatus::Disabled
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub nickname: String,
    pub email: String,
    pub is_admin: bool,
    pub status: UserStatus,
}

impl User {
    pub fn is_enabled(&self) -> bool {
        self.status == UserStatus::Enabled
    }
}

/// One successful login, written alongside the issued token
#[derive(Debug, Clone, Default)]
pub struct LoginLog {
    pub user_id: i64,
    pub client: String,
    pub device_id: String,
    pub uuid: String,
    pub ip: String,
    pub login_type: String,
    pub platform: String,
}
