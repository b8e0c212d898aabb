#![cfg_attr(not(feature = "libtorrent"), forbid(unsafe_code))]
#![cfg_attr(feature = "libtorrent", deny(unsafe_code))]
#![deny(
    warnings,
    dead_code,
    unused,
    unused_imports,
    unused_must_use,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]

//! Libtorrent-backed `TorrentOrchestrator` (spec §4.4): synthesises torrents
//! for locally held layers and downloads layers described by a peer's
//! metainfo, against the native C++ session bridge (or an in-memory stub).

#[cfg(feature = "libtorrent")]
pub mod ffi;
/// `TorrentOrchestrator` implementation driving the session event loop.
pub mod orchestrator;
/// Session abstraction and native/stub implementations.
mod session;
mod error;

pub use error::{LibtorrentError, op_failed};
pub use orchestrator::LibtorrentOrchestrator;
