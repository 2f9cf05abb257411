use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bridge_transport::Engine;
use clap::Parser;
use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM};
use signal_hook::flag as signal_flag;
use tracing_subscriber::EnvFilter;

/// Default control-socket port a smart-socket client connects to.
const DEFAULT_CONTROL_PORT: u16 = 26099;
/// Default port the device/emulator side dials in on, mirroring the
/// original's local-transport base port.
const DEFAULT_DEVICE_PORT: u16 = 26101;

#[derive(Parser, Debug)]
#[command(name = "bridged", about = "Host-side smart development bridge daemon")]
struct Cli {
    /// Port the smart-socket control listener binds to.
    #[arg(long, default_value_t = DEFAULT_CONTROL_PORT)]
    control_port: u16,

    /// Port device/emulator transports dial in on.
    #[arg(long, default_value_t = DEFAULT_DEVICE_PORT)]
    device_port: u16,

    /// Address to bind both listeners on.
    #[arg(long, default_value = "127.0.0.1")]
    bind: IpAddr,

    /// Increase log verbosity; repeat for more (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// `BRIDGE_TRACE=1` turns on per-packet hex-dump logging (the `trace!`
/// calls in `bridge_transport::transport`), matching the original's
/// debug-verbosity environment variable. `RUST_LOG` still takes priority
/// when set, for ad-hoc filter overrides.
fn init_tracing(verbose: u8) {
    let packet_trace = std::env::var("BRIDGE_TRACE").is_ok_and(|v| v == "1");
    let default_level = match (verbose, packet_trace) {
        (_, true) => "bridged=trace,bridge_transport=trace",
        (0, false) => "bridged=info,bridge_transport=info",
        (1, false) => "bridged=debug,bridge_transport=debug",
        (_, false) => "bridged=trace,bridge_transport=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Registers SIGTERM/SIGINT/SIGQUIT against a shared flag so the event
/// loop notices a shutdown request on its next `should_stop` check,
/// grounded on the signal-handling half of the original's scoped-spine
/// setup (minus the scoped-thread machinery, which this daemon doesn't
/// need since `Transport::spawn` owns its own `'static` threads).
fn install_signal_handlers() -> Arc<AtomicBool> {
    let stop = Arc::new(AtomicBool::new(false));
    signal_flag::register(SIGTERM, Arc::clone(&stop)).expect("register SIGTERM");
    signal_flag::register(SIGINT, Arc::clone(&stop)).expect("register SIGINT");
    signal_flag::register(SIGQUIT, Arc::clone(&stop)).expect("register SIGQUIT");
    stop
}

/// `BRIDGE_PROTOCOL_VERSION` overrides the `CNXN` handshake's advertised
/// protocol version, e.g. for compatibility testing against an older peer.
/// Falls back to `bridge_wire::PROTOCOL_VERSION` when unset or unparsable.
fn protocol_version_override() -> Option<u32> {
    std::env::var("BRIDGE_PROTOCOL_VERSION").ok().and_then(|v| {
        let v = v.trim().trim_start_matches("0x");
        u32::from_str_radix(v, 16).ok()
    })
}

fn main() -> std::io::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let stop = install_signal_handlers();

    let mut engine = Engine::new()?;
    if let Some(version) = protocol_version_override() {
        tracing::info!(version = format!("{version:04x}"), "overriding protocol version");
        engine = engine.with_protocol_version(version);
    }
    let control_addr = SocketAddr::new(cli.bind, cli.control_port);
    let device_addr = SocketAddr::new(cli.bind, cli.device_port);

    let bound_control = engine.bind_control(control_addr)?;
    let bound_device = engine.bind_device_port(device_addr)?;
    tracing::info!(control = %bound_control, device = %bound_device, "bridged listening");

    engine.run(|| stop.load(Ordering::Relaxed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_match_documented_ports() {
        let cli = Cli::parse_from(["bridged"]);
        assert_eq!(cli.control_port, DEFAULT_CONTROL_PORT);
        assert_eq!(cli.device_port, DEFAULT_DEVICE_PORT);
        assert_eq!(cli.bind, IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)));
    }

    #[test]
    fn verbosity_counts_repeated_flags() {
        let cli = Cli::parse_from(["bridged", "-vv"]);
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn protocol_version_override_parses_hex() {
        std::env::set_var("BRIDGE_PROTOCOL_VERSION", "1234");
        assert_eq!(protocol_version_override(), Some(0x1234));
        std::env::remove_var("BRIDGE_PROTOCOL_VERSION");
        assert_eq!(protocol_version_override(), None);
    }
}
