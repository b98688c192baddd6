//! 16-bit and 32-bit wraparound frame-counter gap arithmetic, and the
//! `check_fcnt` replay/reset policy.

use crate::error::EngineError;
use crate::region::Region;
use crate::store::records::{FcntCheck, Node};
use crate::warnings::{WarnKind, WarnScope, WarnSink};

/// The largest forward jump still treated as evidence of in-order delivery
/// rather than a replay attack or counter corruption.
pub const MAX_FCNT_GAP: u32 = 16384;

/// Gap between two 16-bit counters, wrapping modulo 2^16.
pub fn fcnt16_gap(last: u16, current: u16) -> u32 {
    (current.wrapping_sub(last)) as u32
}

/// Gap between a 32-bit counter's low 16 bits and a newly received 16-bit
/// counter value, wrapping modulo 2^16 (the 32-bit value is only ever
/// extended by a gap observed on the wire's 16-bit field).
pub fn fcnt32_gap(last: u32, current: u16) -> u32 {
    fcnt16_gap((last & 0xFFFF) as u16, current)
}

/// Outcome of the counter-arithmetic step, before MIC verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FcntOutcome {
    /// Accept as a fresh uplink; `Node.fcntup` has already been advanced in
    /// the returned copy.
    Fresh(Node),
    /// A frame-counter reset was detected: the session was reinitialized in
    /// the returned copy, and the caller must also purge any `pending` rows
    /// for this devaddr in the same transaction.
    Reset(Node),
    /// This exact FCnt was already accepted; do not mutate state.
    Retransmit,
}

/// Implements the frame-counter branch table. `node` is the currently stored row;
/// a new `Node` value is returned on acceptance (the caller persists it).
pub fn check_fcnt(
    node: &Node,
    fcnt_check: FcntCheck,
    region: Region,
    fcnt: u16,
    max_lost_after_reset: u32,
    warn: &dyn WarnSink,
) -> Result<FcntOutcome, EngineError> {
    // Branch 1: first frame after join.
    if node.fcntup.is_none() {
        return match fcnt {
            0 | 1 => {
                let mut next = node.clone();
                next.fcntup = Some(fcnt as u32);
                Ok(FcntOutcome::Fresh(next))
            }
            f if (f as u32) < MAX_FCNT_GAP => {
                warn.emit(WarnScope::Node(node.devaddr), WarnKind::UplinksMissed((f as u32).saturating_sub(1)));
                let mut next = node.clone();
                next.fcntup = Some(fcnt as u32);
                Ok(FcntOutcome::Fresh(next))
            }
            _ => Err(EngineError::FcntGapTooLarge {
                fcnt: fcnt as u32,
                last_rx: node.fcntup,
            }),
        };
    }

    let fcntup = node.fcntup.expect("checked above");

    // Branch 2: reset detection (fcnt_check in {reset-allowed, disabled}).
    if matches!(fcnt_check, FcntCheck::ResetAllowed | FcntCheck::Disabled)
        && (fcnt as u32) < fcntup
        && (fcnt as u32) < max_lost_after_reset
    {
        warn.emit(WarnScope::Node(node.devaddr), WarnKind::FcntReset);
        let mut next = node.clone();
        next.fcntup = Some(fcnt as u32);
        next.fcntdown = 0;
        next.adr_use = crate::region::default_adr(region);
        next.rxwin_use = crate::region::default_rxwin(region);
        next.last_reset = None; // caller stamps `now`
        next.devstat_fcnt = None;
        next.last_qs.clear();
        return Ok(FcntOutcome::Reset(next));
    }

    // Branch 3: fcnt_check disabled entirely — accept whatever arrives.
    if fcnt_check == FcntCheck::Disabled {
        let mut next = node.clone();
        next.fcntup = Some(fcnt as u32);
        return Ok(FcntOutcome::Fresh(next));
    }

    // Branch 4: retransmission.
    if fcnt as u32 == fcntup & 0xFFFF {
        return Ok(FcntOutcome::Retransmit);
    }

    // Branch 5: strict 32-bit.
    if fcnt_check == FcntCheck::Strict32 {
        let gap = fcnt32_gap(fcntup, fcnt);
        return if gap == 1 {
            let mut next = node.clone();
            next.fcntup = Some(fcntup.wrapping_add(1));
            Ok(FcntOutcome::Fresh(next))
        } else if gap < MAX_FCNT_GAP {
            warn.emit(WarnScope::Node(node.devaddr), WarnKind::UplinksMissed(gap - 1));
            let mut next = node.clone();
            next.fcntup = Some(fcntup.wrapping_add(gap));
            Ok(FcntOutcome::Fresh(next))
        } else {
            Err(EngineError::FcntGapTooLarge {
                fcnt: fcnt as u32,
                last_rx: node.fcntup,
            })
        };
    }

    // Branch 6: strict 16-bit (default). Rollover at 0xFFFF->0x0000 is
    // indistinguishable from a device reset in this mode — inherited from
    // the reference implementation and must be documented to operators.
    let gap = fcnt16_gap((fcntup & 0xFFFF) as u16, fcnt);
    if gap == 1 {
        let mut next = node.clone();
        next.fcntup = Some(fcnt as u32);
        Ok(FcntOutcome::Fresh(next))
    } else if gap < MAX_FCNT_GAP {
        warn.emit(WarnScope::Node(node.devaddr), WarnKind::UplinksMissed(gap - 1));
        let mut next = node.clone();
        next.fcntup = Some(fcnt as u32);
        Ok(FcntOutcome::Fresh(next))
    } else {
        Err(EngineError::FcntGapTooLarge {
            fcnt: fcnt as u32,
            last_rx: node.fcntup,
        })
    }
}
