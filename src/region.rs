//! Regional radio parameters are out of scope for the engine; this
//! module is the pure lookup collaborator the engine calls into for the one
//! thing it cannot avoid knowing about regions: the ADR/RX-window defaults a
//! reset or fresh join falls back to. No channel plan, duty-cycle, or
//! data-rate table lives here.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Region {
    Eu868,
    Us915,
}

/// Default ADR enablement for a region's freshly-reset session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdrSettings {
    pub enabled: bool,
}

/// Default RX-window settings: `RX1DROffset` (3 bits), `RX2DR` (4 bits), and
/// the RX2 frequency in Hz.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RxWindowSettings {
    pub rx1_dr_offset: u8,
    pub rx2_dr: u8,
    pub rx2_freq_hz: u32,
}

pub fn default_adr(region: Region) -> AdrSettings {
    match region {
        Region::Eu868 | Region::Us915 => AdrSettings { enabled: false },
    }
}

pub fn default_rxwin(region: Region) -> RxWindowSettings {
    match region {
        Region::Eu868 => RxWindowSettings {
            rx1_dr_offset: 0,
            rx2_dr: 0,
            rx2_freq_hz: 869_525_000,
        },
        Region::Us915 => RxWindowSettings {
            rx1_dr_offset: 0,
            rx2_dr: 8,
            rx2_freq_hz: 923_300_000,
        },
    }
}
