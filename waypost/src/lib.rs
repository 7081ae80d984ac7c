//! Waypost - a hot-reloadable message gateway.
//!
//! Messages arrive from channel adapters or HTTP, are routed to a session,
//! handed to a pluggable reasoning backend and the reply is delivered back to
//! the originating channel. Around that path sit a cron scheduler, a daily
//! group rollup that writes observations into long-term memory, and an
//! HTTP/RPC control surface.
//!
//! # Architecture
//!
//! - **Router** ([`router`]) - Session routing, allow-lists, modes and persistence
//! - **Channels** ([`channel`], [`channels`]) - Adapter trait and reference adapters
//! - **Backend** ([`backend`]) - Reasoning backend trait with mock and HTTP variants
//! - **Gateway** ([`gateway`]) - Orchestration, hot reload and the state version
//! - **Runtime** ([`runtime`]) - One generation of live subsystems
//! - **Cron** ([`cron`]) - Durable scheduler and group rollups
//! - **Memory** ([`memory`]) - Observation store and pipeline
//! - **Server** ([`server`]) - HTTP routes and the RPC dispatcher
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use waypost::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let gateway = Gateway::start(GatewayConfig::default(), ConfigSource::Inline).await?;
//!     let reply = gateway
//!         .ingest(InboundEnvelope::new("http", "chat-1", "u1", "hello"))
//!         .await?;
//!     println!("{:?}", reply.outbound);
//!     Ok(())
//! }
//! ```

// Core modules
pub mod backend;
pub mod bus;
pub mod channel;
pub mod channels;
pub mod config;
pub mod envelope;
pub mod error;
pub mod gateway;
pub mod router;
pub mod routing;
pub mod runtime;
pub mod store;
pub mod util;

// Supporting modules
pub mod approval;
pub mod connector;
pub mod cron;
pub mod heartbeat;
pub mod idempotency;
pub mod logsink;
pub mod memory;
pub mod server;

/// Prelude module for convenient imports.
pub mod prelude {
    // Error types (centralized)
    pub use crate::error::{
        BackendError, BackendResult, ChannelError, ChannelResult, ConfigError, ConfigResult,
        CronError, CronResult, ErrorContext, GatewayError, Result, StorageError, StorageResult,
    };

    // Envelopes and routing
    pub use crate::envelope::{CorrelationId, InboundEnvelope, MessageMode, OutboundEnvelope};
    pub use crate::routing::{BusyPolicy, Route, SessionKey, resolve_route};

    // Bus
    pub use crate::bus::{BusEvent, BusStats, EventBus};

    // Channel
    pub use crate::channel::{Channel, ChannelSet, ChannelState, ChannelStatus, InboundSink};
    pub use crate::channels::{LoopbackChannel, PollChannel, WebhookChannel};

    // Config
    pub use crate::config::{
        ChannelConfig, ConfigIssue, ConfigSource, GatewayConfig, GroupConfig, IssueLevel,
        config_path, init_config, load_config, save_config,
    };

    // Backend
    pub use crate::backend::{MockBackend, ReasoningBackend};

    // Gateway
    pub use crate::gateway::{ConfigSummary, Gateway, GatewayStatus, IngestResponse};
    pub use crate::router::{Dispatch, Router};

    // Stores
    pub use crate::memory::{NewObservation, Observation, ObservationPipeline};
    pub use crate::store::{MessageStore, RoutingOutcome, StoredMessage};

    // Cron
    pub use crate::cron::{CronJobDefinition, CronManager, CronRun, GroupRollup, NewCronJob};

    // Heartbeat
    pub use crate::heartbeat::{HealthStatus, HeartbeatRunner};

    // Utilities
    pub use crate::util::{generate_id, timestamp_ms, truncate_str};
}
