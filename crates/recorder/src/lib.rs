/// Ignition Recorder - build-time invocation recording.
/// Records calls made against recorder proxies and emits a startup
/// program that replays them, with their original argument values,
/// against fresh recorder instances.

pub mod ir;
pub mod error;
pub mod graph;
pub mod emit;
pub mod serialize;
pub mod proxy;
pub mod recorder;
pub mod bundle;

pub use emit::ObjectLoader;
pub use error::RecorderError;
pub use recorder::{ProgramOutput, StartupRecorder};

/// Engine version stamped into emitted programs.
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Longest recordable string, in bytes.
pub const MAX_STRING_BYTES: usize = 65535;
