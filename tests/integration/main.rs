//! mbt integration test harness.
//!
//! Clients and servers run unmodified against a virtual mesh: every frame
//! goes through the wire codec, timers fire on a virtual clock, and tests
//! choose which deliveries get lost. Nothing here touches a real network,
//! so the suite runs with a plain
//!
//!   cargo test --test integration

pub use std::sync::{Arc, Mutex};
pub use std::time::{Duration, Instant};

pub use bytes::Bytes;

pub use mbt_core::config::{BlobClientConfig, BlobServerConfig, DfuConfig};
pub use mbt_core::wire::{
    Address, BlobStatus, DfuEffect, DfuPhase, DfuStatus, FwImage, Message, XferMode, XferPhase,
    ADDR_UNASSIGNED,
};
pub use mbt_services::blob::BlobXfer;
pub use mbt_services::blob_cli::{BlobCli, BlobCliEvent, BlobCliInputs, CliState};
pub use mbt_services::blob_srv::{BlobSrv, BlobSrvHandler, HandlerError};
pub use mbt_services::dfu_cli::{
    BlobParams, DfuCli, DfuCliEvent, DfuCliInputs, DfuCliState, DfuTargetSpec, DfuXfer,
};
pub use mbt_services::dfu_srv::{DfuSrv, DfuSrvHandler, DfuSrvStores, StartError};
pub use mbt_services::store::MemoryStore;
pub use mbt_services::stream::{BlobStream, MemoryStream};
pub use mbt_services::timer::earliest;
pub use mbt_services::{MsgCtx, Outbox};

mod infra;
pub use infra::*;

mod blob;
mod dfu;
mod pull;
