use crate::error::{DispatchError, SelectionError};
use crate::registry::{Registry, TransportSelector};
use crate::transport::{ConnectionState, Transport, TransportKind};

/// Fallback port for `connect:<host>` when no `:<port>` suffix is given,
/// matching the device-port convention `bridged` itself binds by default.
const DEFAULT_CONNECT_PORT: u16 = 26101;

/// Parses the 4-byte ASCII hex length prefix used by every smart-socket
/// request/response (`%04x` in the original `sockets.c`).
pub fn decode_length_prefix(bytes: &[u8]) -> Option<usize> {
    bridge_utils::decode_hex_prefix(bytes, 4).map(|v| v as usize)
}

pub fn encode_length_prefix(len: usize) -> [u8; 4] {
    bridge_utils::encode_len_prefix4(len)
}

/// A parsed smart-socket request, split into its transport-selection
/// prefix (if any, e.g. `host-serial:abc123:get-state`) and the service
/// string that follows.
#[derive(Debug, PartialEq, Eq)]
pub struct Request<'a> {
    pub selector: TransportSelector,
    pub service: &'a str,
}

/// Parses a smart-socket service string into its selector and trailing
/// service, mirroring `handle_host_request`'s `host:`/`host-serial:`/
/// `host-usb:`/`host-local:`/`host-transport-id:` prefix handling.
pub fn parse_request(service: &str) -> Request<'_> {
    if let Some(rest) = service.strip_prefix("host-serial:") {
        if let Some((serial, tail)) = rest.split_once(':') {
            return Request { selector: TransportSelector::Serial(serial.to_string()), service: tail };
        }
    }
    if let Some(rest) = service.strip_prefix("host-usb:") {
        return Request { selector: TransportSelector::AnyUsb, service: rest };
    }
    if let Some(rest) = service.strip_prefix("host-local:") {
        return Request { selector: TransportSelector::AnyLocal, service: rest };
    }
    if let Some(rest) = service.strip_prefix("host:") {
        return Request { selector: TransportSelector::Any, service: rest };
    }
    Request { selector: TransportSelector::Any, service }
}

/// Reply a host-scope or transport-scope command produces. `Ok` carries
/// the body to wrap in an `OKAY` + length-prefix frame; `Err` carries the
/// message to wrap in a `FAIL` + length-prefix frame.
pub type Reply = Result<String, String>;

/// What a host-scope command resolves to. Commands that are pure registry
/// reads/writes (`devices`, `remote_emul`, `version`, `serial-match:`)
/// resolve directly to a [`HostAction::Reply`]; commands that need to touch
/// fds or threads (`connect:`, `disconnect:`, `emulator:`, `kill`) resolve
/// to a named variant `Engine` executes, since this module only ever sees
/// `&Registry`.
#[derive(Debug, PartialEq, Eq)]
pub enum HostAction {
    Reply(Reply),
    Connect { host: String, port: u16 },
    Disconnect { serial: Option<String> },
    Emulator { port: u16, name: Option<String> },
    Kill,
}

fn render_devices(registry: &Registry, filter: impl Fn(&Transport) -> bool) -> String {
    let mut out = String::new();
    registry.for_each(|t| {
        if filter(t) {
            out.push_str(&format!("{}\t{}\t{}\n", t.serial, t.state.as_wire_str(), t.name));
        }
    });
    out
}

/// Unfiltered `<serial>\t<state>\t<name>\n` listing, shared by the one-shot
/// `devices` reply and `track-devices`' repeated push (`engine.rs`).
pub fn render_devices_list(registry: &Registry) -> String {
    render_devices(registry, |_| true)
}

/// Splits `<host>[:<port>]` the way `connect:`/`host-serial:<host>:<port>`
/// style addresses are written; `rsplit_once` so an IPv6 literal's own
/// colons don't get mistaken for the port separator's first colon.
pub fn parse_host_port(rest: &str, default_port: u16) -> (String, u16) {
    match rest.rsplit_once(':') {
        Some((host, port_str)) => match port_str.parse() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (rest.to_string(), default_port),
        },
        None => (rest.to_string(), default_port),
    }
}

/// Parses a `forward:`/`killforward:` tail of the form
/// `tcp:<local-port>;tcp:<remote-port>` into `(local_port, remote_spec)`.
/// Only the `tcp:` scheme is accepted on either side.
pub fn parse_forward_spec(rest: &str) -> Option<(u16, String)> {
    let (local, remote) = rest.split_once(';')?;
    let local_port = local.strip_prefix("tcp:")?.parse().ok()?;
    if !remote.starts_with("tcp:") {
        return None;
    }
    Some((local_port, remote.to_string()))
}

/// Host-scope commands that don't require selecting a transport first.
/// Transport-scoped commands (`get-state`, `get-serialno`) and the
/// `forward:`/`transport-*` family are handled once `Engine` has resolved
/// (or parked, deferred-dispatch-style) a transport id.
pub fn dispatch_host_scoped(registry: &Registry, service: &str) -> Option<HostAction> {
    if service == "devices" {
        return Some(HostAction::Reply(Ok(render_devices_list(registry))));
    }
    if service == "remote_emul" {
        return Some(HostAction::Reply(Ok(render_devices(registry, |t| t.kind != TransportKind::Usb))));
    }
    if service == "kill" {
        return Some(HostAction::Kill);
    }
    if service == "version" {
        return Some(HostAction::Reply(Ok(format!("{:04x}", bridge_wire::PROTOCOL_VERSION))));
    }
    if let Some(rest) = service.strip_prefix("connect:") {
        let (host, port) = parse_host_port(rest, DEFAULT_CONNECT_PORT);
        return Some(HostAction::Connect { host, port });
    }
    if service == "disconnect" {
        return Some(HostAction::Disconnect { serial: None });
    }
    if let Some(rest) = service.strip_prefix("disconnect:") {
        let serial = if rest.is_empty() { None } else { Some(rest.to_string()) };
        return Some(HostAction::Disconnect { serial });
    }
    if let Some(rest) = service.strip_prefix("emulator:") {
        let (port_str, name) = match rest.split_once(',') {
            Some((p, n)) => (p, Some(n.to_string())),
            None => (rest, None),
        };
        let port = port_str.parse().unwrap_or(0);
        return Some(HostAction::Emulator { port, name });
    }
    if let Some(rest) = service.strip_prefix("serial-match:") {
        let reply = registry.serial_match(rest).map_err(|e| e.as_wire_str().to_string());
        return Some(HostAction::Reply(reply));
    }
    None
}

/// Commands that act on a single resolved transport.
pub fn dispatch_transport_scoped(registry: &Registry, transport_id: u32, service: &str) -> Reply {
    match service {
        "get-state" => registry
            .with_transport(transport_id, |t| t.state.as_wire_str().to_string())
            .ok_or_else(|| SelectionError::TargetNotFound.as_wire_str().to_string()),
        "get-serialno" => registry
            .with_transport(transport_id, |t| t.serial.clone())
            .ok_or_else(|| SelectionError::TargetNotFound.as_wire_str().to_string()),
        _ => Err(DispatchError::UnknownService.to_string()),
    }
}

/// Simple host-scope-or-transport-scope dispatch used by tests and any
/// caller without `Engine`'s fd access; `HostAction` variants that require
/// the engine resolve to an error here rather than being silently dropped.
pub fn handle_request(registry: &Registry, service: &str) -> Reply {
    if let Some(action) = dispatch_host_scoped(registry, service) {
        return match action {
            HostAction::Reply(reply) => reply,
            HostAction::Kill | HostAction::Connect { .. } | HostAction::Disconnect { .. } | HostAction::Emulator { .. } => {
                Err("requires engine".to_string())
            }
        };
    }
    let Request { selector, service: tail } = parse_request(service);
    match registry.acquire_one(&selector) {
        Ok(id) => dispatch_transport_scoped(registry, id, tail),
        Err(e) => Err(e.as_wire_str().to_string()),
    }
}

#[allow(dead_code)]
fn state_requires_auth(state: ConnectionState) -> bool {
    state == ConnectionState::PasswordLocked
}
