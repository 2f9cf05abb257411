mod dispatch;
mod endpoint;
mod engine;
mod error;
mod event;
mod ids;
mod listener;
mod local_socket;
mod registry;
mod transport;

pub use dispatch::{
    decode_length_prefix, dispatch_host_scoped, dispatch_transport_scoped, encode_length_prefix,
    handle_request, parse_forward_spec, parse_host_port, parse_request, render_devices_list, HostAction, Reply,
    Request,
};
pub use endpoint::{DeviceEndpoint, DeviceKicker, DeviceReader, DeviceWriter, TcpEndpoint};
pub use engine::Engine;
pub use error::{DispatchError, EndpointError, SelectionError};
pub use event::{EventCore, WAKE_TOKEN};
pub use ids::LocalIdAllocator;
pub use listener::{Listener, ListenerKind};
pub use local_socket::{status, LocalSocket};
pub use registry::{Registry, TransportSelector, Waiter};
pub use transport::{ConnectionState, LoopEvent, Transport, TransportKind};
