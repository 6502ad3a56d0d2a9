//! mbt-services — BLOB Transfer and Firmware Update models.
//!
//! Every model is a sans-IO state machine: it is driven through
//! `handle_message` for incoming frames and `poll` at `next_deadline`, and
//! sends through a [`Transport`].

pub mod blob;
pub mod blob_cli;
pub mod blob_srv;
pub mod dfu_cli;
pub mod dfu_srv;
pub mod slot;
pub mod store;
pub mod stream;
pub mod timer;
pub mod transport;

pub use blob::{Block, BlobXfer};
pub use blob_cli::{
    BlobCli, BlobCliError, BlobCliEvent, BlobCliInputs, BlobTarget, BroadcastMsg, BroadcastRequest, CliState,
};
pub use blob_srv::{BlobSrv, BlobSrvError, BlobSrvHandler, BlobSrvState, HandlerError};
pub use dfu_cli::{
    BlobParams, DfuCli, DfuCliError, DfuCliEvent, DfuCliInputs, DfuCliState, DfuRsp, DfuTarget, DfuTargetSpec,
    DfuXfer,
};
pub use dfu_srv::{DfuSrv, DfuSrvError, DfuSrvHandler, DfuSrvStores, StartError, UpdateState};
pub use slot::{DfuSlot, SlotError, SlotHandle, SlotStore};
pub use store::{JsonFileStore, MemoryStore, StateStore, StoreError};
pub use stream::{BlobStream, IoMode, MemoryStream, StreamError};
pub use timer::Timer;
pub use transport::{MsgCtx, Outbox, Transport, TransportError};
