//! CAS helper process manager (spec §4.F): supervises the out-of-process
//! `buildbox-casd` daemon and provides a lazy gRPC channel to it.

pub mod channel;
pub mod process;
#[allow(clippy::all)]
pub mod proto;

pub use channel::CasdChannel;
pub use process::CasdProcessManager;
