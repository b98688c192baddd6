//! Structured, pattern-matchable engine errors.
//!
//! Every variant here aborts the enclosing store transaction with no partial
//! state change; callers match on the variant rather than string-sniffing a
//! message.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    // --- Framing ---
    #[error("unparseable PHY payload: {0}")]
    BadFrame(String),
    #[error("FPort 0 with non-empty FOpts is illegal")]
    DoubleFOpts,

    // --- Identity ---
    #[error("unknown DevEUI")]
    UnknownDevEui,
    #[error("AppEUI in join-request does not match the provisioned device")]
    BadAppEui,
    #[error("DevAddr is in a locally-served network prefix but has no node row")]
    UnknownDevAddr,
    #[error("DevAddr does not belong to any locally-served network")]
    IgnoredNode,
    #[error("profile referenced by node/device record does not exist")]
    UnknownProfile,
    #[error("network referenced by profile does not exist")]
    UnknownNetwork,

    // --- Cryptographic ---
    #[error("MIC verification failed")]
    BadMic,

    // --- Counter ---
    #[error("frame counter gap too large (fcnt={fcnt}, last_rx={last_rx:?})")]
    FcntGapTooLarge { fcnt: u32, last_rx: Option<u32> },

    // --- Policy ---
    #[error("devaddr allocation exhausted its collision-retry budget")]
    DevAddrExhausted,

    // --- Store/transport ---
    #[error("store error: {0}")]
    Store(String),
}
