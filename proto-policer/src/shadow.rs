use std::{
    ffi::CString,
    io, mem,
    os::fd::{AsRawFd, FromRawFd, OwnedFd},
    time::{Duration, Instant},
};

use anyhow::{Context, Result, anyhow, ensure};
use clap::ValueEnum;
use tokio::io::unix::AsyncFd;
use tokio::sync::watch;
use tokio::{signal, task, time};
use tracing::{debug, info, trace};

use proto_policer_common::{
    Clock, Decision, EthHdr, PolicerConfig, PolicerTable, UnclassifiedPolicy, Verdict,
    classify::ETH_HDR_LEN, police,
};

use crate::clock::MonotonicClock;
use crate::stats::{self, KeyTotals};

pub const DEFAULT_WINDOW_MS: u64 = 1_000;
pub const DEFAULT_SNAPLEN: usize = 256;

/// How often a worker copies its table out for the reporter.
const PUBLISH_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum UnclassifiedArg {
    ShareIpv6Bucket,
    Bypass,
}

impl From<UnclassifiedArg> for UnclassifiedPolicy {
    fn from(arg: UnclassifiedArg) -> Self {
        match arg {
            UnclassifiedArg::ShareIpv6Bucket => UnclassifiedPolicy::ShareIpv6Bucket,
            UnclassifiedArg::Bypass => UnclassifiedPolicy::Bypass,
        }
    }
}

pub struct ShadowOptions {
    pub iface: String,
    pub workers: usize,
    pub fanout_group: Option<u16>,
    pub report_interval: Duration,
    pub window: Duration,
    pub unclassified: UnclassifiedPolicy,
    pub snaplen: usize,
}

impl ShadowOptions {
    fn policer_config(&self) -> PolicerConfig {
        PolicerConfig {
            window_ns: u64::try_from(self.window.as_nanos()).unwrap_or(u64::MAX),
            unclassified: self.unclassified,
        }
    }
}

fn validate_shadow_options(opts: &ShadowOptions) -> Result<()> {
    ensure!(opts.workers > 0, "workers must be at least 1");
    ensure!(
        !opts.report_interval.is_zero(),
        "report interval must be greater than zero"
    );
    ensure!(!opts.window.is_zero(), "window must be greater than zero");
    ensure!(
        opts.snaplen >= ETH_HDR_LEN,
        "snaplen must be at least {ETH_HDR_LEN} bytes"
    );
    ensure!(
        opts.workers == 1 || opts.fanout_group.is_some(),
        "more than one worker needs a fanout group, otherwise every worker sees every frame"
    );
    Ok(())
}

/// One execution context: a private table that nothing else writes to.
pub struct ShadowContext<C> {
    table: PolicerTable,
    config: PolicerConfig,
    clock: C,
    passed: u64,
    dropped: u64,
}

impl<C: Clock> ShadowContext<C> {
    pub fn new(config: PolicerConfig, clock: C) -> Self {
        Self {
            table: PolicerTable::new(),
            config,
            clock,
            passed: 0,
            dropped: 0,
        }
    }

    /// Runs one frame through the policer. The clock is read once.
    pub fn process(&mut self, frame: &[u8]) -> Decision {
        let now = self.clock.now_ns();
        let decision = police(frame, &mut self.table, now, &self.config);
        match decision.verdict {
            Verdict::Pass => self.passed += 1,
            Verdict::Drop => self.dropped += 1,
        }
        decision
    }

    pub fn table(&self) -> &PolicerTable {
        &self.table
    }
}

pub async fn run_shadow_pipeline(opts: ShadowOptions) -> Result<()> {
    validate_shadow_options(&opts)?;
    let config = opts.policer_config();
    let clock = MonotonicClock::new();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut published = Vec::with_capacity(opts.workers);
    let mut handles = Vec::with_capacity(opts.workers);
    for worker_id in 0..opts.workers {
        let socket = FrameSocket::bind(&opts.iface, opts.fanout_group)
            .with_context(|| format!("worker {worker_id}: failed to bind packet socket"))?;
        let (table_tx, table_rx) = watch::channel(PolicerTable::new());
        published.push(table_rx);

        let context = ShadowContext::new(config, clock);
        let shutdown = shutdown_rx.clone();
        let snaplen = opts.snaplen;
        handles.push(task::spawn(async move {
            worker_loop(worker_id, socket, context, table_tx, shutdown, snaplen).await
        }));
    }

    info!(
        iface = %opts.iface,
        workers = opts.workers,
        window_ms = opts.window.as_millis() as u64,
        unclassified = ?opts.unclassified,
        "shadow policer running, verdicts are counted but not enforced"
    );

    let reporter_tables = published.clone();
    let report_interval = opts.report_interval;
    let reporter = tokio::spawn(async move {
        let mut ticker = time::interval(report_interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            log_totals(&snapshot(&reporter_tables));
        }
    });

    signal::ctrl_c()
        .await
        .context("failed to wait for ctrl-c")?;
    info!("received shutdown signal, draining");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(err) => return Err(anyhow!("worker panicked: {err}")),
        }
    }

    reporter.abort();
    let _ = reporter.await;

    log_totals(&snapshot(&published));
    Ok(())
}

fn snapshot(published: &[watch::Receiver<PolicerTable>]) -> Vec<KeyTotals> {
    let tables: Vec<PolicerTable> = published.iter().map(|rx| *rx.borrow()).collect();
    stats::sum_tables(tables.iter())
}

fn log_totals(totals: &[KeyTotals]) {
    if totals.is_empty() {
        info!("no frames policed yet");
    }
    for t in totals {
        info!(
            protocol = t.key.name(),
            admitted = t.admitted as u64,
            dropped = t.dropped as u64,
            contexts = t.contexts,
            "policer totals"
        );
    }
}

async fn worker_loop(
    worker_id: usize,
    socket: FrameSocket,
    mut context: ShadowContext<MonotonicClock>,
    published: watch::Sender<PolicerTable>,
    mut shutdown: watch::Receiver<bool>,
    snaplen: usize,
) -> Result<()> {
    let mut buf = vec![0u8; snaplen];
    let mut last_publish = Instant::now();
    loop {
        tokio::select! {
            received = socket.recv(&mut buf) => {
                let len = received.with_context(|| format!("worker {worker_id}: recv failed"))?;
                let frame = &buf[..len.min(buf.len())];
                let decision = context.process(frame);
                if decision.verdict == Verdict::Drop {
                    let source = source_mac(frame);
                    trace!(
                        worker_id,
                        key = ?decision.key,
                        source = source.as_deref().unwrap_or("-"),
                        vlan_tags = decision.frame.map_or(0, |f| f.vlan_tags),
                        now_ns = decision.now_ns,
                        "drop"
                    );
                }
                if last_publish.elapsed() >= PUBLISH_INTERVAL {
                    published.send_replace(*context.table());
                    last_publish = Instant::now();
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    published.send_replace(*context.table());
    debug!(
        worker_id,
        passed = context.passed,
        dropped = context.dropped,
        "worker stopped"
    );
    Ok(())
}

/// Non-blocking AF_PACKET socket bound to one interface.
///
/// Only frames the interface receives are delivered. Locally sent frames are filtered in the
/// kernel, matching what an ingress hook sees.
struct FrameSocket {
    fd: AsyncFd<OwnedFd>,
}

impl FrameSocket {
    fn bind(iface: &str, fanout_group: Option<u16>) -> Result<Self> {
        let ifindex = interface_index(iface)?;
        let protocol = (libc::ETH_P_ALL as u16).to_be();
        let fd = open_packet_socket(protocol).context("failed to create packet socket")?;

        let addr = link_address(ifindex, protocol);
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error())
                .with_context(|| format!("failed to bind packet socket to {iface}"));
        }

        ignore_outgoing(&fd).context("failed to set PACKET_IGNORE_OUTGOING")?;
        if let Some(group) = fanout_group {
            // Hashing keeps a flow on one worker, like RSS keeps it on one CPU.
            set_packet_option(&fd, libc::PACKET_FANOUT, &fanout_arg(group))
                .with_context(|| format!("failed to join fanout group {group}"))?;
        }

        let fd = AsyncFd::new(fd).context("failed to register packet socket")?;
        Ok(Self { fd })
    }

    /// Waits for the next frame. Frames longer than `buf` are truncated.
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| {
                let rc = unsafe {
                    libc::recv(
                        inner.as_raw_fd(),
                        buf.as_mut_ptr() as *mut libc::c_void,
                        buf.len(),
                        0,
                    )
                };
                if rc < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(rc as usize)
                }
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

fn interface_index(iface: &str) -> Result<libc::c_int> {
    let name = CString::new(iface).with_context(|| format!("invalid interface name {iface:?}"))?;
    match unsafe { libc::if_nametoindex(name.as_ptr()) } {
        0 => Err(io::Error::last_os_error())
            .with_context(|| format!("unknown interface {iface}")),
        idx => Ok(idx as libc::c_int),
    }
}

/// `protocol` is in network byte order.
fn open_packet_socket(protocol: u16) -> io::Result<OwnedFd> {
    let fd = unsafe {
        libc::socket(
            libc::AF_PACKET,
            libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            protocol as libc::c_int,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn link_address(ifindex: libc::c_int, protocol: u16) -> libc::sockaddr_ll {
    let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
    addr.sll_family = libc::AF_PACKET as libc::c_ushort;
    addr.sll_protocol = protocol;
    addr.sll_ifindex = ifindex;
    addr
}

fn fanout_arg(group: u16) -> u32 {
    u32::from(group) | (libc::PACKET_FANOUT_HASH << 16)
}

fn ignore_outgoing(fd: &OwnedFd) -> io::Result<()> {
    set_packet_option(fd, libc::PACKET_IGNORE_OUTGOING, &(1 as libc::c_int))
}

fn set_packet_option<T>(fd: &OwnedFd, name: libc::c_int, value: &T) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::SOL_PACKET,
            name,
            value as *const T as *const libc::c_void,
            mem::size_of::<T>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Source address of a frame, for drop diagnostics.
fn source_mac(frame: &[u8]) -> Option<String> {
    let hdr = EthHdr::view(frame)?;
    let [a, b, c, d, e, f] = hdr.source;
    Some(format!("{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{f:02x}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::manual::ManualClock;
    use proto_policer_common::ProtocolKey;

    const WINDOW_NS: u64 = 1_000_000_000;

    fn opts() -> ShadowOptions {
        ShadowOptions {
            iface: "lo".to_string(),
            workers: 1,
            fanout_group: None,
            report_interval: Duration::from_secs(5),
            window: Duration::from_millis(DEFAULT_WINDOW_MS),
            unclassified: UnclassifiedPolicy::ShareIpv6Bucket,
            snaplen: DEFAULT_SNAPLEN,
        }
    }

    fn eth(proto: [u8; 2]) -> Vec<u8> {
        let mut frame = vec![0xffu8; 6];
        frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 9]);
        frame.extend_from_slice(&proto);
        frame.resize(60, 0);
        frame
    }

    fn context(policy: UnclassifiedPolicy) -> ShadowContext<ManualClock> {
        ShadowContext::new(
            PolicerConfig {
                window_ns: WINDOW_NS,
                unclassified: policy,
            },
            ManualClock::at(10),
        )
    }

    #[test]
    fn default_options_are_valid() {
        assert!(validate_shadow_options(&opts()).is_ok());
        assert_eq!(opts().policer_config(), PolicerConfig::DEFAULT);
    }

    #[test]
    fn invalid_options_are_rejected() {
        let zero_workers = ShadowOptions {
            workers: 0,
            ..opts()
        };
        assert!(validate_shadow_options(&zero_workers).is_err());

        let zero_window = ShadowOptions {
            window: Duration::ZERO,
            ..opts()
        };
        assert!(validate_shadow_options(&zero_window).is_err());

        let tiny_snaplen = ShadowOptions {
            snaplen: ETH_HDR_LEN - 1,
            ..opts()
        };
        assert!(validate_shadow_options(&tiny_snaplen).is_err());

        let no_interval = ShadowOptions {
            report_interval: Duration::ZERO,
            ..opts()
        };
        assert!(validate_shadow_options(&no_interval).is_err());
    }

    #[test]
    fn several_workers_need_a_fanout_group() {
        let unfanned = ShadowOptions {
            workers: 4,
            ..opts()
        };
        assert!(validate_shadow_options(&unfanned).is_err());
        let fanned = ShadowOptions {
            workers: 4,
            fanout_group: Some(3),
            ..opts()
        };
        assert!(validate_shadow_options(&fanned).is_ok());
    }

    #[test]
    fn window_option_becomes_nanoseconds() {
        let short = ShadowOptions {
            window: Duration::from_millis(250),
            unclassified: UnclassifiedPolicy::Bypass,
            ..opts()
        };
        let config = short.policer_config();
        assert_eq!(config.window_ns, 250_000_000);
        assert_eq!(config.unclassified, UnclassifiedPolicy::Bypass);
    }

    #[test]
    fn unclassified_arg_maps_to_policy() {
        assert_eq!(
            UnclassifiedPolicy::from(UnclassifiedArg::ShareIpv6Bucket),
            UnclassifiedPolicy::ShareIpv6Bucket
        );
        assert_eq!(
            UnclassifiedPolicy::from(UnclassifiedArg::Bypass),
            UnclassifiedPolicy::Bypass
        );
    }

    #[test]
    fn context_admits_one_frame_per_window() {
        let mut ctx = context(UnclassifiedPolicy::ShareIpv6Bucket);
        let v4 = eth([0x08, 0x00]);

        assert_eq!(ctx.process(&v4).verdict, Verdict::Pass);
        ctx.clock.advance(1);
        assert_eq!(ctx.process(&v4).verdict, Verdict::Pass);
        ctx.clock.advance(1);
        let dropped = ctx.process(&v4);
        assert_eq!(dropped.verdict, Verdict::Drop);
        assert_eq!(dropped.key, Some(ProtocolKey::IPV4));
        assert_eq!(dropped.now_ns, 12);

        ctx.clock.advance(WINDOW_NS);
        assert_eq!(ctx.process(&v4).verdict, Verdict::Pass);
        assert_eq!((ctx.passed, ctx.dropped), (3, 1));

        let info = ctx.table().get(ProtocolKey::IPV4).unwrap();
        assert_eq!(info.admitted, 2);
        assert_eq!(info.dropped, 1);
        assert_eq!(info.window_start_ns, 12 + WINDOW_NS);
    }

    #[test]
    fn context_folds_unknown_frames_into_ipv6() {
        let mut ctx = context(UnclassifiedPolicy::ShareIpv6Bucket);
        let arp = eth([0x08, 0x06]);
        ctx.process(&arp);
        ctx.process(&arp);
        assert_eq!(ctx.process(&eth([0x86, 0xdd])).verdict, Verdict::Drop);
        assert!(ctx.table().get(ProtocolKey::IPV4).is_none());
    }

    #[test]
    fn context_bypass_ignores_unknown_frames() {
        let mut ctx = context(UnclassifiedPolicy::Bypass);
        for _ in 0..10 {
            assert_eq!(ctx.process(&[0u8; 4]).verdict, Verdict::Pass);
        }
        assert_eq!(ctx.table().iter().count(), 0);
        assert_eq!(ctx.passed, 10);
    }

    #[test]
    fn drops_report_header_details() {
        let mut ctx = context(UnclassifiedPolicy::ShareIpv6Bucket);
        let mut tagged = eth([0x81, 0x00]);
        tagged.splice(14..14, [0x00, 0x0a, 0x08, 0x00]);
        ctx.process(&tagged);
        ctx.process(&tagged);

        let dropped = ctx.process(&tagged);
        assert_eq!(dropped.verdict, Verdict::Drop);
        assert_eq!(dropped.key, Some(ProtocolKey::IPV4));
        let parsed = dropped.frame.unwrap();
        assert_eq!((parsed.vlan_tags, parsed.l3_offset), (1, 18));
        assert_eq!(source_mac(&tagged).as_deref(), Some("02:00:00:00:00:09"));
        assert_eq!(source_mac(&tagged[..13]), None);
    }

    #[test]
    fn fanout_arg_packs_group_and_hash_mode() {
        assert_eq!(fanout_arg(7), 7 | (libc::PACKET_FANOUT_HASH << 16));
        assert_eq!(fanout_arg(u16::MAX) & 0xffff, 0xffff);
    }

    #[test]
    fn packet_options_are_rejected_on_other_sockets() {
        let udp = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let fd = OwnedFd::from(udp);
        assert!(ignore_outgoing(&fd).is_err());
    }

    #[test]
    fn packet_socket_ignores_outgoing_frames() {
        let protocol = (libc::ETH_P_ALL as u16).to_be();
        let fd = match open_packet_socket(protocol) {
            Ok(fd) => fd,
            // Packet sockets need CAP_NET_RAW, and some sandboxes lack AF_PACKET entirely.
            Err(err)
                if err.kind() == io::ErrorKind::PermissionDenied
                    || err.raw_os_error() == Some(libc::EAFNOSUPPORT) =>
            {
                return;
            }
            Err(err) => panic!("packet socket: {err}"),
        };
        ignore_outgoing(&fd).unwrap();

        let mut value: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                fd.as_raw_fd(),
                libc::SOL_PACKET,
                libc::PACKET_IGNORE_OUTGOING,
                &mut value as *mut libc::c_int as *mut libc::c_void,
                &mut len,
            )
        };
        assert_eq!(rc, 0);
        assert_eq!(value, 1);
    }

    #[test]
    fn snapshot_sums_published_tables() {
        let mut a = context(UnclassifiedPolicy::ShareIpv6Bucket);
        let mut b = context(UnclassifiedPolicy::ShareIpv6Bucket);
        let v6 = eth([0x86, 0xdd]);
        for _ in 0..4 {
            a.process(&v6);
            b.process(&v6);
        }
        let (_tx_a, rx_a) = watch::channel(*a.table());
        let (_tx_b, rx_b) = watch::channel(*b.table());

        let totals = snapshot(&[rx_a, rx_b]);
        assert_eq!(totals.len(), 1);
        assert_eq!(totals[0].key, ProtocolKey::IPV6);
        assert_eq!(totals[0].admitted, 2);
        assert_eq!(totals[0].dropped, 4);
        assert_eq!(totals[0].contexts, 2);
    }
}
