//! Side-channel warning/info emission. The engine never changes an
//! outcome because of a warning; it only reports through this sink.

use tracing::{info, warn};

/// What the warning is about — a devaddr-scoped node, or a deveui-scoped
/// device (e.g. during a join, before a devaddr has been allocated).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarnScope {
    Node([u8; 4]),
    Device([u8; 8]),
}

/// Closed set of warning/info kinds the engine reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WarnKind {
    /// `N` uplinks were missed before this one arrived.
    UplinksMissed(u32),
    /// A frame-counter reset was detected and the session was reinitialized.
    FcntReset,
    /// The previous session ended without any uplink; this is a repeated
    /// reset (device rebooted before ever transmitting).
    RepeatedReset,
    /// A successful join.
    Join,
    /// A port-0 downlink carried application data, which LoRaWAN forbids;
    /// the data was dropped rather than transmitted.
    DroppedPort0Data,
}

/// Abstraction over wherever warnings/info end up (logs, metrics, an
/// operator-facing event stream). The engine only ever calls `emit`.
pub trait WarnSink: Send + Sync {
    fn emit(&self, scope: WarnScope, kind: WarnKind);
}

/// Default sink: routes everything through `tracing`, matching the
/// teacher's logging idiom.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingWarnSink;

impl WarnSink for TracingWarnSink {
    fn emit(&self, scope: WarnScope, kind: WarnKind) {
        let scope_str = match scope {
            WarnScope::Node(devaddr) => format!("devaddr={}", crate::codec::to_hex(&devaddr)),
            WarnScope::Device(deveui) => format!("deveui={}", crate::codec::to_hex(&deveui)),
        };
        match kind {
            WarnKind::UplinksMissed(n) => {
                warn!(%scope_str, missed = n, "uplinks_missed");
            }
            WarnKind::FcntReset => {
                warn!(%scope_str, "fcnt reset");
            }
            WarnKind::RepeatedReset => {
                warn!(%scope_str, "repeated_reset");
            }
            WarnKind::Join => {
                info!(%scope_str, "join");
            }
            WarnKind::DroppedPort0Data => {
                warn!(%scope_str, "dropped application data on port 0 downlink");
            }
        }
    }
}
