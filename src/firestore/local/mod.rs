mod bundle_cache;
mod local_documents_view;
mod local_serializer;
mod local_store;
mod local_view_changes;
mod lru_garbage_collector;
mod memory_persistence;
mod mutation_queue;
mod persistence;
mod query_engine;
mod reference_set;
mod remote_document_cache;
mod shared_client_state;
mod sync_engine;
mod target_cache;
mod target_data;

pub use bundle_cache::{
    BundleCache, BundleContents, BundleMetadata, BundledDocument, LoadBundleProgress,
    MemoryBundleCache, NamedQuery,
};
pub use local_documents_view::LocalDocumentsView;
pub use local_serializer::LocalSerializer;
pub use local_store::{LocalStore, LocalWriteResult, QueryResult, UserChangeResult};
pub use local_view_changes::LocalViewChanges;
pub use lru_garbage_collector::{LruGarbageCollector, LruResults, LruScheduler};
pub use memory_persistence::MemoryPersistence;
pub use mutation_queue::{MemoryMutationQueue, MutationQueue};
pub use persistence::{LruDelegate, Persistence, PersistenceTransaction, TransactionMode};
pub use query_engine::{IndexFreeQueryEngine, QueryEngine, SimpleQueryEngine};
pub use reference_set::ReferenceSet;
pub use remote_document_cache::{MemoryRemoteDocumentCache, RemoteDocumentCache};
pub use shared_client_state::{
    MemorySharedClientState, MutationBatchState, QueryTargetState, SharedClientState,
};
pub use sync_engine::{SyncEngine, SyncEngineListener, WriteCallback};
pub use target_cache::{MemoryTargetCache, TargetCache};
pub use target_data::{TargetData, TargetPurpose};
