#![no_std]
#![no_main]

use aya_ebpf::bindings::{TC_ACT_OK, TC_ACT_SHOT, xdp_action};
use aya_ebpf::helpers::bpf_ktime_get_ns;
use aya_ebpf::macros::{classifier, map, xdp};
use aya_ebpf::maps::PerCpuHashMap;
use aya_ebpf::programs::{TcContext, XdpContext};
use aya_ebpf::EbpfContext;
use aya_log_ebpf::debug;
use proto_policer_common::{
    BudgetStore, Clock, FrameBytes, MAX_KEYS, PolicerConfig, PolicerInfo, ProtocolKey, Verdict,
    police,
};

/// Compile-time policy: rates are not configurable from userspace.
const CONFIG: PolicerConfig = PolicerConfig::DEFAULT;

#[map(name = "proto_policer")]
static PROTO_POLICER: PerCpuHashMap<ProtocolKey, PolicerInfo> =
    PerCpuHashMap::<ProtocolKey, PolicerInfo>::with_max_entries(MAX_KEYS, 0);

#[xdp]
pub fn xdp_proto_policer(ctx: XdpContext) -> u32 {
    match run(&ctx, ctx.data(), ctx.data_end()) {
        Verdict::Pass => xdp_action::XDP_PASS,
        Verdict::Drop => xdp_action::XDP_DROP,
    }
}

#[classifier]
pub fn tc_proto_policer(ctx: TcContext) -> i32 {
    match run(&ctx, ctx.data(), ctx.data_end()) {
        Verdict::Pass => TC_ACT_OK,
        Verdict::Drop => TC_ACT_SHOT,
    }
}

#[inline(always)]
fn run<C: EbpfContext>(ctx: &C, data: usize, data_end: usize) -> Verdict {
    let frame = PacketWindow { data, data_end };
    let now = KtimeClock.now_ns();
    let decision = police(&frame, &mut PerCpuStore, now, &CONFIG);
    if decision.verdict == Verdict::Drop {
        let key = decision.key.unwrap_or_default().0;
        let tags = decision.frame.map_or(0, |f| f.vlan_tags);
        debug!(ctx, "drop key {} vlan tags {} now {}", key, tags, now);
    }
    decision.verdict
}

/// Packet bytes between `data` and `data_end`.
struct PacketWindow {
    data: usize,
    data_end: usize,
}

impl FrameBytes for PacketWindow {
    #[inline(always)]
    fn frame_len(&self) -> usize {
        self.data_end.saturating_sub(self.data)
    }

    #[inline(always)]
    fn wire_u16(&self, offset: usize) -> Option<[u8; 2]> {
        let start = self.data + offset;
        if start + 2 > self.data_end {
            return None;
        }
        Some(unsafe { core::ptr::read_unaligned(start as *const [u8; 2]) })
    }
}

/// This CPU's slice of the per-CPU state map.
struct PerCpuStore;

impl BudgetStore for PerCpuStore {
    #[inline(always)]
    fn get_mut(&mut self, key: ProtocolKey) -> Option<&mut PolicerInfo> {
        let ptr = PROTO_POLICER.get_ptr_mut(&key)?;
        // The per-CPU value is only touched by the program instance running on this CPU.
        let info = unsafe { &mut *ptr };
        // Inserting a key on one CPU zero-fills it on all the others.
        if info.is_unset() { None } else { Some(info) }
    }

    #[inline(always)]
    fn put(&mut self, key: ProtocolKey, info: PolicerInfo) {
        match PROTO_POLICER.get_ptr_mut(&key) {
            Some(ptr) => unsafe { *ptr = info },
            None => {
                let _ = PROTO_POLICER.insert(&key, &info, 0);
            }
        }
    }
}

struct KtimeClock;

impl Clock for KtimeClock {
    #[inline(always)]
    fn now_ns(&self) -> u64 {
        unsafe { bpf_ktime_get_ns() }
    }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}

#[unsafe(link_section = "license")]
#[unsafe(no_mangle)]
static LICENSE: [u8; 4] = *b"GPL\0";
