//! WAS ("Web Application Socket") child processes: a local RPC
//! protocol carrying HTTP semantics over a control socket plus
//! request/response pipes.

pub mod control;
pub mod idle;
pub mod launch;
pub mod multi_client;
pub mod multi_stock;
pub mod params;
pub mod remote_stock;
pub mod stock;

pub use control::{WasCommand, WasProtocolError};
pub use idle::{WasIdleConnection, WasSocket};
pub use multi_stock::{MultiWasConnection, MultiWasStock};
pub use params::CgiChildParams;
pub use remote_stock::{RemoteWasParams, RemoteWasStock, RemoteWasStream};
pub use stock::{WasChild, WasLease, WasStock};
