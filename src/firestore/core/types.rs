pub type TargetId = i32;
pub type BatchId = i32;
pub type ListenSequenceNumber = i64;

/// Batch id returned when the mutation queue holds no pending batch.
pub const BATCH_ID_UNKNOWN: BatchId = -1;

/// Whether the client believes it can reach the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum OnlineState {
    #[default]
    Unknown,
    Online,
    Offline,
}

/// Who reported an online state change. Secondary clients only accept
/// changes forwarded from the primary through the shared client state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnlineStateSource {
    RemoteStore,
    SharedClientState,
}
