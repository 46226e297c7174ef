//!Listeners for appliances that can only be reached over connections they open themselves.
//!
//!An appliance behind a firewall or NAT cannot accept inbound connections from its controller.
//!Instead it dials out to the controller and keeps a spare connection parked there. The controller
//!classifies every inbound connection by its first bytes and hands role-tagged ones to whoever is
//!waiting for that role from that peer, so either side can use plain listener code.
//!
//!## How it works
//!On the appliance, [`ReverseDialListener`] is a listener whose `accept` dials the controller,
//!announces a three byte role token ([`Role`]) and returns the connection once it is open. It keeps
//!exactly one idle connection parked: a new one is dialed only after the previous one received
//!its first byte or died.
//!
//!On the controller, [`PrefaceListener`] wraps any [`Listener`], peeks at each new connection and
//!either returns it from `accept` (ordinary clients, byte-for-byte intact) or parks it in a
//!per-peer, per-role slot. [`PrefaceListener::dial_role`] then waits for and claims the parked
//!connection, which looks to the caller just like an outbound dial to the appliance.
//!
//![`SniSplitter`] terminates TLS and fans connections out to child listeners by server name.
//!
//!Errors are [`std::io::Error`]. Listener `accept` errors that are worth retrying are marked
//!with [`temporary`] and recognized with [`is_temporary`].
//!
//!## Feature flags
//!
//!```toml
//!revdial = { version = "0.1", default-features=false, features=["tls"]}
//!```
//!
//!- `tls`: TLS on reverse dialed connections and the [`SniSplitter`]
//!- `env_logger`, `structopt`: the `revdial` demo binary

mod error;
pub mod logger;
mod listener;
pub mod tcp;
pub mod role;
pub mod preface;
pub mod dial;
#[cfg(feature = "tls")]
pub mod split;
mod shutdown;

pub use dial::{DialConfig, Outbound, PoolCounters, PoolStats, ReverseDialListener, TrackedStream};
#[cfg(feature = "tls")]
pub use dial::TlsClient;
pub use error::{is_temporary, temporary};
pub use listener::{Connection, Listener};
pub use logger::{default_logger, Discard, Logger, StdLogger};
pub use preface::{PrefaceListener, PrefacedStream};
pub use role::{Preface, Role, CLIENT_PREFACE, ROLE_TOKEN_LEN};
#[cfg(feature = "tls")]
pub use split::{SniListener, SniSplitter};
pub use tcp::TcpAcceptor;
