#![forbid(unsafe_code)]

pub mod config;
pub mod context;
pub mod handler;
pub mod nodelist;
pub mod peers;
pub mod registry;
pub mod signatures;
pub mod upstream;
pub mod validators;
pub mod watcher;

pub use config::{ChainConfig, NodeConfig, ServerConfig, ValidatorEngineConfig, ValidatorEngineKind};
pub use context::{ChainContext, ChainSettings, ContextError};
pub use handler::ChainHandler;
pub use nodelist::{SyncError, select_node_list, sync_node_list};
pub use peers::{HttpPeerClient, PeerClient};
pub use signatures::{
    Conviction, ConvictionError, ConvictionSink, SignatureCollector, SignatureError,
    TxConvictionSink, sign_blocks,
};
pub use upstream::{ChainSource, RpcRetryConfig, UpstreamError, UpstreamRpcClient};
pub use validators::{ValidatorHistoryError, finality_proof, update_validator_history};
pub use watcher::{
    ChannelSink, EventWatcher, NotificationSink, SubscriptionId, TickOutcome, WatcherError,
    WatcherHealth, WatcherNotification, WatcherStatus,
};
