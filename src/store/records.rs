//! The five record families the engine reads and writes, plus the
//! `pending` queue. Every mutation of these during ingest or downlink
//! encoding happens inside a [`super::Store::transaction`] call.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::region::{AdrSettings, Region, RxWindowSettings};

pub type DevEui = [u8; 8];
pub type AppEui = [u8; 8];
pub type DevAddr = [u8; 4];
pub type AesKey = [u8; 16];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProfileId(pub u32);

/// How aggressively `check_fcnt` polices the frame-counter sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FcntCheck {
    Strict16,
    Strict32,
    ResetAllowed,
    Disabled,
}

impl FcntCheck {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Strict16),
            1 => Some(Self::Strict32),
            2 => Some(Self::ResetAllowed),
            3 => Some(Self::Disabled),
            _ => None,
        }
    }
}

/// A single RSSI/SNR sample retained for link-quality history
/// (`node.last_qs`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualitySample {
    pub rssi: i32,
    pub snr: f32,
}

/// Externally provisioned device identity and long-lived credentials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub deveui: DevEui,
    pub appeui: Option<AppEui>,
    pub appkey: AesKey,
    pub profile: ProfileId,
    /// Most recently assigned DevAddr, if any — reused across rejoins.
    pub node: Option<DevAddr>,
    pub appargs: serde_json::Value,
    pub last_join: Option<DateTime<Utc>>,
}

/// A device's active (or most recent) session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub devaddr: DevAddr,
    pub profile: ProfileId,
    pub nwkskey: AesKey,
    pub appskey: AesKey,
    /// Undefined until the first uplink after join.
    pub fcntup: Option<u32>,
    pub fcntdown: u32,
    pub adr_use: AdrSettings,
    pub rxwin_use: RxWindowSettings,
    pub first_reset: Option<DateTime<Utc>>,
    pub last_reset: Option<DateTime<Utc>>,
    pub reset_count: u32,
    pub last_rx: Option<DateTime<Utc>>,
    pub last_gateways: Vec<String>,
    pub devstat: Vec<serde_json::Value>,
    pub devstat_fcnt: Option<u32>,
    pub last_qs: Vec<QualitySample>,
    pub adr_flag: bool,
    pub adr_set: Option<AdrSettings>,
    pub adr_failed: u32,
    pub rxwin_failed: u32,
    pub appargs: serde_json::Value,
}

/// A device-class policy: which network it joins, whether joining is
/// currently permitted, and how strictly frame counters are policed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: ProfileId,
    pub network: NetworkId,
    pub can_join: bool,
    pub fcnt_check: FcntCheck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkId(pub u32);

/// Addressing authority: NwkID, optional SubID, and the region whose
/// defaults apply on join/reset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Network {
    pub id: NetworkId,
    pub name: String,
    /// 3 bytes; low 7 bits of the first byte are the NwkID.
    pub netid: [u8; 3],
    /// Up to 25 bits, stored as `(value, bit_len)`.
    pub subid: Option<(u32, u8)>,
    pub region: Region,
}

impl Network {
    pub fn nwk_id(&self) -> u8 {
        self.netid[0] & 0x7F
    }

    /// Whether `devaddr`'s NwkID (and SubID, if this network uses one)
    /// places it inside this network's address prefix.
    pub fn owns_devaddr(&self, devaddr: DevAddr) -> bool {
        let addr = u32::from_be_bytes(devaddr);
        if (addr >> 25) as u8 != self.nwk_id() {
            return false;
        }
        match self.subid {
            Some((value, len)) => {
                let shift = 25 - len;
                let field = (addr >> shift) & ((1u32 << len) - 1);
                field == (value & ((1u32 << len) - 1))
            }
            None => true,
        }
    }
}

/// A devaddr (with optional mask) that the engine silently drops uplinks
/// from without attempting MIC verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IgnoredNode {
    pub devaddr: DevAddr,
    pub mask: Option<DevAddr>,
}

impl IgnoredNode {
    pub fn matches(&self, devaddr: DevAddr) -> bool {
        let mask = self.mask.unwrap_or([0xFF, 0xFF, 0xFF, 0xFF]);
        let a = u32::from_be_bytes(devaddr) & u32::from_be_bytes(mask);
        let b = u32::from_be_bytes(self.devaddr) & u32::from_be_bytes(mask);
        a == b
    }
}

/// A multicast group: a shared devaddr/session key pair with its own
/// downlink counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MulticastChannel {
    pub devaddr: DevAddr,
    pub nwkskey: AesKey,
    pub appskey: AesKey,
    pub fcntdown: u32,
}

/// A queued downlink frame awaiting transmission, purged on reset/rejoin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pending {
    pub devaddr: DevAddr,
    pub fport: Option<u8>,
    pub data: Vec<u8>,
    pub confirmed: bool,
}
