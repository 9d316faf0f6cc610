//! Watcher side: joins a broadcast, answers the direct-link probe and rebuilds
//! the files from whichever path delivers them.

pub mod assembler;
pub mod storage;
pub mod watcher;

pub use assembler::{Assembler, Progress, Step};
pub use watcher::{run_receive, ReceiveOptions, ReceiveSummary};
