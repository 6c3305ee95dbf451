//! Length-prefixed JSON-RPC over Unix domain sockets.
//!
//! This crate provides:
//! - `FrameCodec` - 4-byte big-endian length framing with a size cap
//! - `Dispatcher` - JSON-RPC 2.0 validation and routing, batches included
//! - `UnixSockets` - the only socket constructor, Unix domain only
//! - `RpcServer` / `RpcClient` - the two ends of the channel
//! - `PhotosService` - the photo methods, with export path whitelisting

pub mod client;
pub mod dispatcher;
pub mod frame;
pub mod jsonrpc;
pub mod photos;
pub mod server;
pub mod socket;
pub mod whitelist;

pub use client::{ClientError, RpcClient};
pub use dispatcher::{Dispatcher, Handler};
pub use frame::{FrameCodec, FrameError, MAX_FRAME_LEN};
pub use jsonrpc::{Params, Request, Response, RpcError};
pub use photos::{DirectoryLibrary, PhotoLibrary, PhotosError, PhotosService};
pub use server::{RpcServer, ServerConfig};
pub use socket::{SocketError, UnixSockets};
pub use whitelist::{ExportWhitelist, WhitelistError};
