//! Offline sync: mutation queue, recorder, drain engine and connectivity triggers.

pub mod connectivity;
pub mod engine;
pub mod queue;
pub mod recorder;
pub mod remote;
pub mod server;

pub use connectivity::{ConnectivityMonitor, DEFAULT_SYNC_INTERVAL};
pub use engine::{DrainOutcome, DrainReport, SkipReason, SyncEngine, SyncState};
pub use recorder::{DeletePolicy, MutationRecorder};
pub use remote::{HttpRemote, RemoteEndpoint, RemoteRequest};
