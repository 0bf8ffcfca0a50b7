#![cfg_attr(not(test), no_std)]

// Types and decision logic shared between the eBPF program and the userspace agent.
// Everything here must stay `no_std`, allocation-free and panic-free so it can be
// linked into the kernel-side program.

pub mod classify;
pub mod policer;

pub use classify::{EthHdr, EtherType, Frame, FrameBytes, ParseError, classify};
pub use policer::{
    BudgetStore, Clock, Decision, PolicerConfig, PolicerTable, UnclassifiedPolicy, Verdict,
    decide, key_for, police,
};

/// Name of the per-CPU state map, shared by the kernel program and the loader.
pub const STATE_MAP_NAME: &str = "proto_policer";

/// Slots reserved in the state map. Only two keys are populated today.
pub const MAX_KEYS: u32 = 16;

/// Accounting bucket selector used as the state map key.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct ProtocolKey(pub u32);

impl ProtocolKey {
    pub const IPV6: ProtocolKey = ProtocolKey(1);
    pub const IPV4: ProtocolKey = ProtocolKey(2);

    pub const fn index(self) -> usize {
        self.0 as usize
    }

    pub const fn name(self) -> &'static str {
        match self.0 {
            1 => "ipv6",
            2 => "ipv4",
            _ => "unused",
        }
    }
}

/// Budget state for one key in one execution context.
///
/// The layout is shared with the kernel map value, so keep it `repr(C)` with explicit
/// padding.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PolicerInfo {
    /// Frames that may still be admitted in the current window (0 or 1).
    pub budget: u32,
    pub pad: u32,
    pub admitted: u64,
    pub dropped: u64,
    /// Start of the current window, in clock nanoseconds.
    pub window_start_ns: u64,
}

#[cfg(feature = "user")]
mod user_impls {
    extern crate aya;

    use super::{PolicerInfo, ProtocolKey};
    use aya::Pod;

    unsafe impl Pod for PolicerInfo {}
    unsafe impl Pod for ProtocolKey {}
}
