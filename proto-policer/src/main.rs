use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;

use anyhow::Result;
use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod clock;
mod ebpf_loader;
mod shadow;
mod stats;

use ebpf_loader::{AttachPoint, XdpMode};
use shadow::UnclassifiedArg;

#[derive(Parser)]
#[command(name = "proto-policer")]
#[command(about = "Per-protocol control-plane policer agent", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the policer program and attach it to an interface until Ctrl+C
    Attach(AttachCommand),
    /// Print admitted/dropped totals summed over every CPU
    Stats(StatsCommand),
    /// Run the policer in userspace over AF_PACKET without dropping anything
    Shadow(ShadowCommand),
}

#[derive(Args)]
struct AttachCommand {
    /// Interface to attach to
    #[arg(long, value_name = "IFACE")]
    iface: String,
    /// Hook the program is attached to
    #[arg(long, value_enum, default_value_t = AttachPoint::Xdp)]
    attach_point: AttachPoint,
    /// XDP attach mode
    #[arg(long, value_enum, default_value_t = XdpMode::Skb)]
    xdp_mode: XdpMode,
    /// Where to pin the per-CPU state map
    #[arg(long, value_name = "PATH", default_value = ebpf_loader::DEFAULT_STATE_MAP_PIN)]
    pin_path: PathBuf,
}

#[derive(Args)]
struct StatsCommand {
    /// Pinned state map to read
    #[arg(long, value_name = "PATH", default_value = ebpf_loader::DEFAULT_STATE_MAP_PIN)]
    pin_path: PathBuf,
    /// Include the per-CPU breakdown
    #[arg(long, action = ArgAction::SetTrue)]
    per_cpu: bool,
}

#[derive(Args)]
struct ShadowCommand {
    /// Network interface to join via AF_PACKET
    #[arg(long, value_name = "IFACE")]
    iface: String,
    /// Number of workers; each one is an independent execution context
    #[arg(long, default_value_t = 1)]
    workers: usize,
    /// PACKET_FANOUT group id spreading frames across workers
    #[arg(long, value_name = "GROUP")]
    fanout_group: Option<u16>,
    /// Seconds between aggregated reports
    #[arg(long, default_value_t = 5)]
    report_interval_secs: u64,
    /// Window length in milliseconds
    #[arg(long, value_name = "MILLIS", default_value_t = shadow::DEFAULT_WINDOW_MS)]
    window_ms: u64,
    /// Accounting of frames that are neither IPv4 nor IPv6
    #[arg(long, value_enum, default_value_t = UnclassifiedArg::ShareIpv6Bucket)]
    unclassified: UnclassifiedArg,
    /// Bytes captured per frame
    #[arg(long, value_name = "BYTES", default_value_t = shadow::DEFAULT_SNAPLEN)]
    snaplen: usize,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    if let Err(err) = run().await {
        eprintln!("proto-policer error: {err:?}");
        exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Attach(cmd)) => {
            let opts = ebpf_loader::AttachOptions {
                iface: cmd.iface,
                attach_point: cmd.attach_point,
                xdp_mode: cmd.xdp_mode,
                pin_path: cmd.pin_path,
            };
            ebpf_loader::attach_program(opts).await?;
        }
        Some(Commands::Stats(cmd)) => {
            let totals = stats::read_pinned(&cmd.pin_path)?;
            let json = stats::to_json(&totals, cmd.per_cpu);
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        Some(Commands::Shadow(cmd)) => {
            let opts = shadow::ShadowOptions {
                iface: cmd.iface,
                workers: cmd.workers,
                fanout_group: cmd.fanout_group,
                report_interval: Duration::from_secs(cmd.report_interval_secs),
                window: Duration::from_millis(cmd.window_ms),
                unclassified: cmd.unclassified.into(),
                snaplen: cmd.snaplen,
            };
            shadow::run_shadow_pipeline(opts).await?;
        }
        None => {
            Cli::command().print_help().ok();
            println!();
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_defaults() {
        let cli = Cli::try_parse_from(["proto-policer", "attach", "--iface", "eth0"]).unwrap();
        match cli.command {
            Some(Commands::Attach(cmd)) => {
                assert_eq!(cmd.iface, "eth0");
                assert_eq!(cmd.attach_point, AttachPoint::Xdp);
                assert_eq!(cmd.xdp_mode, XdpMode::Skb);
                assert_eq!(cmd.pin_path, PathBuf::from(ebpf_loader::DEFAULT_STATE_MAP_PIN));
            }
            _ => panic!("expected attach"),
        }
    }

    #[test]
    fn attach_accepts_tc_ingress() {
        let cli = Cli::try_parse_from([
            "proto-policer",
            "attach",
            "--iface",
            "eth1",
            "--attach-point",
            "tc-ingress",
            "--xdp-mode",
            "driver",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Attach(cmd)) => {
                assert_eq!(cmd.attach_point, AttachPoint::TcIngress);
                assert_eq!(cmd.xdp_mode, XdpMode::Driver);
            }
            _ => panic!("expected attach"),
        }
    }

    #[test]
    fn shadow_flags() {
        let cli = Cli::try_parse_from([
            "proto-policer",
            "shadow",
            "--iface",
            "eth0",
            "--workers",
            "4",
            "--fanout-group",
            "7",
            "--window-ms",
            "250",
            "--unclassified",
            "bypass",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Shadow(cmd)) => {
                assert_eq!(cmd.workers, 4);
                assert_eq!(cmd.fanout_group, Some(7));
                assert_eq!(cmd.window_ms, 250);
                assert_eq!(cmd.unclassified, UnclassifiedArg::Bypass);
                assert_eq!(cmd.snaplen, shadow::DEFAULT_SNAPLEN);
                assert_eq!(cmd.report_interval_secs, 5);
            }
            _ => panic!("expected shadow"),
        }
    }

    #[test]
    fn stats_per_cpu_flag() {
        let cli = Cli::try_parse_from(["proto-policer", "stats", "--per-cpu"]).unwrap();
        match cli.command {
            Some(Commands::Stats(cmd)) => assert!(cmd.per_cpu),
            _ => panic!("expected stats"),
        }
    }

    #[test]
    fn unknown_attach_point_is_rejected() {
        assert!(
            Cli::try_parse_from([
                "proto-policer",
                "attach",
                "--iface",
                "eth0",
                "--attach-point",
                "tc-egress",
            ])
            .is_err()
        );
    }
}
