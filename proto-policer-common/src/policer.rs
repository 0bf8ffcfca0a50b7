use crate::classify::{EtherType, Frame, FrameBytes, classify};
use crate::{MAX_KEYS, PolicerInfo, ProtocolKey};

pub const NANOS_PER_SEC: u64 = 1_000_000_000;

/// One admitted frame per key per second.
pub const DEFAULT_WINDOW_NS: u64 = NANOS_PER_SEC;

/// 10^12 ns, i.e. 1000 s, a common mislabelling of "one second" in nanoseconds. Only used to
/// check that window lengths are honoured at this scale.
pub const REFERENCE_WINDOW_NS: u64 = 1_000_000_000_000;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Verdict {
    Pass,
    Drop,
}

/// What happens to frames that are neither IPv4 nor IPv6, including truncated ones.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum UnclassifiedPolicy {
    /// Account them in the IPv6 bucket.
    #[default]
    ShareIpv6Bucket,
    /// Pass them without touching any bucket.
    Bypass,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PolicerConfig {
    pub window_ns: u64,
    pub unclassified: UnclassifiedPolicy,
}

impl PolicerConfig {
    pub const DEFAULT: PolicerConfig = PolicerConfig {
        window_ns: DEFAULT_WINDOW_NS,
        unclassified: UnclassifiedPolicy::ShareIpv6Bucket,
    };
}

impl Default for PolicerConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Monotonic nanosecond time source.
pub trait Clock {
    fn now_ns(&self) -> u64;
}

/// Keyed budget storage owned by a single execution context.
pub trait BudgetStore {
    fn get_mut(&mut self, key: ProtocolKey) -> Option<&mut PolicerInfo>;

    /// Creates or overwrites the entry for `key`. A store with no room silently keeps
    /// nothing; the next frame for the key simply takes the creation path again.
    fn put(&mut self, key: ProtocolKey, info: PolicerInfo);
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Decision {
    pub verdict: Verdict,
    /// Bucket the frame was accounted in, `None` for bypassed frames.
    pub key: Option<ProtocolKey>,
    /// Classification result, `None` when the frame is shorter than the base header.
    pub frame: Option<Frame>,
    pub now_ns: u64,
}

impl PolicerInfo {
    /// State stored on the first frame seen for a key.
    pub const fn fresh(now_ns: u64) -> Self {
        PolicerInfo {
            budget: 1,
            pad: 0,
            admitted: 0,
            dropped: 0,
            window_start_ns: now_ns,
        }
    }

    /// True for the all-zero value a per-CPU map hands to CPUs that never stored this key.
    /// Real state never looks like this: `fresh` sets a budget and `admit` counts every
    /// frame.
    pub fn is_unset(&self) -> bool {
        *self == PolicerInfo::default()
    }

    /// Advances the budget for one frame arriving at `now_ns`.
    #[inline(always)]
    pub fn admit(&mut self, now_ns: u64, window_ns: u64) -> Verdict {
        if self.budget == 0 {
            if now_ns.saturating_sub(self.window_start_ns) > window_ns {
                self.budget = 1;
                self.window_start_ns = now_ns;
            } else {
                self.dropped = self.dropped.saturating_add(1);
                return Verdict::Drop;
            }
        }
        self.budget -= 1;
        self.admitted = self.admitted.saturating_add(1);
        Verdict::Pass
    }
}

/// Maps an effective ethertype to its accounting bucket. `None` input means the frame
/// could not be parsed.
#[inline(always)]
pub fn key_for(ethertype: Option<EtherType>, policy: UnclassifiedPolicy) -> Option<ProtocolKey> {
    match ethertype {
        Some(EtherType::IPV6) => Some(ProtocolKey::IPV6),
        Some(EtherType::IPV4) => Some(ProtocolKey::IPV4),
        _ => match policy {
            UnclassifiedPolicy::ShareIpv6Bucket => Some(ProtocolKey::IPV6),
            UnclassifiedPolicy::Bypass => None,
        },
    }
}

/// Runs the admission state machine for `key`. A missing entry is created and the frame
/// passes.
#[inline(always)]
pub fn decide<S: BudgetStore + ?Sized>(
    store: &mut S,
    key: ProtocolKey,
    now_ns: u64,
    window_ns: u64,
) -> Verdict {
    match store.get_mut(key) {
        Some(info) => info.admit(now_ns, window_ns),
        None => {
            store.put(key, PolicerInfo::fresh(now_ns));
            Verdict::Pass
        }
    }
}

/// Classifies one frame and applies the admission decision for its bucket.
#[inline(always)]
pub fn police<F, S>(frame: &F, store: &mut S, now_ns: u64, config: &PolicerConfig) -> Decision
where
    F: FrameBytes + ?Sized,
    S: BudgetStore + ?Sized,
{
    let parsed = classify(frame).ok();
    match key_for(parsed.map(|p| p.ethertype), config.unclassified) {
        Some(key) => Decision {
            verdict: decide(store, key, now_ns, config.window_ns),
            key: Some(key),
            frame: parsed,
            now_ns,
        },
        None => Decision {
            verdict: Verdict::Pass,
            key: None,
            frame: parsed,
            now_ns,
        },
    }
}

/// Fixed-capacity store for one userspace execution context.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PolicerTable {
    slots: [Option<PolicerInfo>; MAX_KEYS as usize],
}

impl PolicerTable {
    pub const fn new() -> Self {
        PolicerTable {
            slots: [None; MAX_KEYS as usize],
        }
    }

    pub fn get(&self, key: ProtocolKey) -> Option<&PolicerInfo> {
        self.slots.get(key.index()).and_then(Option::as_ref)
    }

    /// Populated entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (ProtocolKey, &PolicerInfo)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|info| (ProtocolKey(idx as u32), info)))
    }
}

impl BudgetStore for PolicerTable {
    fn get_mut(&mut self, key: ProtocolKey) -> Option<&mut PolicerInfo> {
        self.slots.get_mut(key.index()).and_then(Option::as_mut)
    }

    fn put(&mut self, key: ProtocolKey, info: PolicerInfo) {
        if let Some(slot) = self.slots.get_mut(key.index()) {
            *slot = Some(info);
        }
    }
}
