//! REFLEX Cache - Reactive Client-Side Model Cache
//!
//! Keeps local copies of server records current and observable:
//! - Identity-keyed item store and query store with incremental result upkeep
//! - Batched, deduplicated fetches with bounded concurrency
//! - Push subscriptions with polling fallback, guarded by activation timestamps
//! - Lazily evaluated derived values over observables
//!
//! Requires a tokio runtime.

pub mod api;
pub mod cache;
pub mod feed;
pub mod metrics;
pub mod observable;
pub mod pipeline;
pub mod registry;
pub mod store;
pub mod sync;
pub mod telemetry;
pub mod transport;

pub use api::{ApiResult, ModelApi, NoPush, PushChannel, PushSubscription};
pub use cache::{ModelCache, ModelCacheBuilder};
pub use feed::{ChangeFeed, FeedItem};
pub use metrics::{CacheMetrics, MetricsSnapshot};
pub use observable::{Computed, Observable, ObservableStream, SubscriptionGuard};
pub use pipeline::{CacheState, GcReport, PublishOutcome, UpdatePipeline};
pub use registry::{SubscriptionHandle, SubscriptionRegistry, Transition};
pub use sync::{ActivationGuard, SyncPolicy, SyncState};
pub use telemetry::init_tracing;
pub use transport::{PendingRequest, TransportCoordinator, Waiter};

// Re-export core types for convenience
pub use reflex_core::{
    CacheConfig, CacheRead, ChangeEvent, ChangeNotification, ConfigError, ConsistencyError,
    FilterExpr, FilterOperator, Freshness, Interest, InterestKey, Model, OrderBy, PushMessage,
    QueryKey, QuerySpec, ReflexError, ReflexResult, SortDirection, SortKey, Timestamp,
    TransportError, UpdateSource,
};
