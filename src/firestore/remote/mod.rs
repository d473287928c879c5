mod remote_event;
mod remote_store;
mod remote_syncer;

pub use remote_event::{RemoteEvent, TargetChange};
pub use remote_store::{NoopRemoteStore, RemoteStore};
pub use remote_syncer::{box_remote_syncer_future, RemoteSyncer, RemoteSyncerFuture};
