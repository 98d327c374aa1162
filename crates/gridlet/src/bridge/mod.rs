//! Line protocol between the coordinator and worker subprocesses.
//!
//! - **protocol**: message types (`WorkerRequest`, `WorkerResponse`)
//! - **codec**: newline-delimited JSON codec for stdin/stdout pipes

pub mod codec;
pub mod protocol;
