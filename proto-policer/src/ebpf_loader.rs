use std::{
    fs, io,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow, ensure};
use aya::pin::PinError;
use aya::programs::tc::{self, SchedClassifier, SchedClassifierLinkId, TcAttachType};
use aya::programs::xdp::XdpLinkId;
use aya::programs::{Xdp, XdpFlags};
use aya::{Ebpf, EbpfLoader, include_bytes_aligned};
use aya_log::EbpfLogger;
use clap::ValueEnum;
use tokio::signal;
use tracing::{info, warn};

use proto_policer_common::STATE_MAP_NAME;

const EBPF_BYTES: &[u8] = include_bytes_aligned!(concat!(env!("OUT_DIR"), "/proto-policer"));
const XDP_PROGRAM: &str = "xdp_proto_policer";
const TC_PROGRAM: &str = "tc_proto_policer";

pub const DEFAULT_STATE_MAP_PIN: &str = "/sys/fs/bpf/proto_policer/proto_policer";

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum AttachPoint {
    Xdp,
    TcIngress,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum XdpMode {
    Skb,
    Driver,
    Hw,
}

#[derive(Clone, Debug)]
pub struct AttachOptions {
    pub iface: String,
    pub attach_point: AttachPoint,
    pub xdp_mode: XdpMode,
    pub pin_path: PathBuf,
}

enum LinkHandle {
    Xdp(XdpLinkId),
    Tc(SchedClassifierLinkId),
}

pub async fn attach_program(opts: AttachOptions) -> Result<()> {
    validate_attach_options(&opts)?;

    let mut bpf = EbpfLoader::new()
        .load(EBPF_BYTES)
        .context("failed to load eBPF object")?;
    if let Err(err) = EbpfLogger::init(&mut bpf) {
        warn!(error = %err, "failed to initialize eBPF logger");
    }

    pin_map(&mut bpf, STATE_MAP_NAME, &opts.pin_path)?;

    let handle = match opts.attach_point {
        AttachPoint::Xdp => LinkHandle::Xdp(attach_xdp(&mut bpf, &opts.iface, opts.xdp_mode)?),
        AttachPoint::TcIngress => LinkHandle::Tc(attach_tc(&mut bpf, &opts.iface)?),
    };

    info!(
        attach_point = ?opts.attach_point,
        iface = %opts.iface,
        pin = %opts.pin_path.display(),
        "policer attached, press Ctrl+C to detach"
    );

    signal::ctrl_c()
        .await
        .context("failed to wait for shutdown signal")?;

    info!(attach_point = ?opts.attach_point, iface = %opts.iface, "detaching");
    detach(&mut bpf, handle)
}

fn validate_attach_options(opts: &AttachOptions) -> Result<()> {
    ensure!(!opts.iface.is_empty(), "interface name must not be empty");
    ensure!(
        opts.pin_path.is_absolute(),
        "pin path {} must be absolute",
        opts.pin_path.display()
    );
    Ok(())
}

fn pin_map(bpf: &mut Ebpf, map_name: &str, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let map = bpf
        .map_mut(map_name)
        .with_context(|| format!("map {map_name} not found"))?;
    match map.pin(path) {
        Ok(()) => Ok(()),
        Err(PinError::SyscallError(err)) if err.io_error.kind() == io::ErrorKind::AlreadyExists => {
            warn!(pin = %path.display(), "state map already pinned, keeping existing pin");
            Ok(())
        }
        Err(err) => Err(anyhow!(
            "failed to pin map {map_name} at {}: {err}",
            path.display()
        )),
    }
}

fn attach_xdp(bpf: &mut Ebpf, iface: &str, mode: XdpMode) -> Result<XdpLinkId> {
    let program: &mut Xdp = bpf
        .program_mut(XDP_PROGRAM)
        .with_context(|| format!("program {XDP_PROGRAM} not found"))?
        .try_into()
        .context("xdp program has wrong type")?;
    program.load().context("failed to load xdp program")?;
    program
        .attach(iface, xdp_flags(mode))
        .with_context(|| format!("failed to attach xdp on {iface}"))
}

fn attach_tc(bpf: &mut Ebpf, iface: &str) -> Result<SchedClassifierLinkId> {
    // Fails when the clsact qdisc is already there, which is fine.
    if let Err(err) = tc::qdisc_add_clsact(iface) {
        warn!(iface, error = %err, "clsact qdisc not added");
    }
    let program: &mut SchedClassifier = bpf
        .program_mut(TC_PROGRAM)
        .with_context(|| format!("program {TC_PROGRAM} not found"))?
        .try_into()
        .context("tc program has wrong type")?;
    program.load().context("failed to load tc program")?;
    program
        .attach(iface, TcAttachType::Ingress)
        .with_context(|| format!("failed to attach tc on {iface}"))
}

fn detach(bpf: &mut Ebpf, handle: LinkHandle) -> Result<()> {
    match handle {
        LinkHandle::Xdp(id) => {
            let program: &mut Xdp = bpf
                .program_mut(XDP_PROGRAM)
                .with_context(|| format!("program {XDP_PROGRAM} not found"))?
                .try_into()
                .context("xdp program has wrong type")?;
            program.detach(id).context("failed to detach xdp program")
        }
        LinkHandle::Tc(id) => {
            let program: &mut SchedClassifier = bpf
                .program_mut(TC_PROGRAM)
                .with_context(|| format!("program {TC_PROGRAM} not found"))?
                .try_into()
                .context("tc program has wrong type")?;
            program.detach(id).context("failed to detach tc program")
        }
    }
}

fn xdp_flags(mode: XdpMode) -> XdpFlags {
    match mode {
        XdpMode::Skb => XdpFlags::SKB_MODE,
        XdpMode::Driver => XdpFlags::DRV_MODE,
        XdpMode::Hw => XdpFlags::HW_MODE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(iface: &str, pin: &str) -> AttachOptions {
        AttachOptions {
            iface: iface.to_string(),
            attach_point: AttachPoint::Xdp,
            xdp_mode: XdpMode::Skb,
            pin_path: PathBuf::from(pin),
        }
    }

    #[test]
    fn default_pin_is_valid() {
        assert!(validate_attach_options(&opts("eth0", DEFAULT_STATE_MAP_PIN)).is_ok());
    }

    #[test]
    fn relative_pin_is_rejected() {
        let err = validate_attach_options(&opts("eth0", "proto_policer")).unwrap_err();
        assert!(err.to_string().contains("must be absolute"));
    }

    #[test]
    fn empty_iface_is_rejected() {
        assert!(validate_attach_options(&opts("", DEFAULT_STATE_MAP_PIN)).is_err());
    }

    #[test]
    fn xdp_modes_map_to_flags() {
        assert_eq!(xdp_flags(XdpMode::Skb).bits(), XdpFlags::SKB_MODE.bits());
        assert_eq!(xdp_flags(XdpMode::Driver).bits(), XdpFlags::DRV_MODE.bits());
        assert_eq!(xdp_flags(XdpMode::Hw).bits(), XdpFlags::HW_MODE.bits());
    }

    #[test]
    fn default_pin_ends_in_map_name() {
        assert!(DEFAULT_STATE_MAP_PIN.ends_with(STATE_MAP_NAME));
    }

    #[test]
    fn object_symbols_are_distinct() {
        // Programs and maps share one symbol table in the object file.
        let symbols = [XDP_PROGRAM, TC_PROGRAM, STATE_MAP_NAME];
        for (i, a) in symbols.iter().enumerate() {
            for b in &symbols[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
