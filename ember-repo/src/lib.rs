//! Ember Repo - Repositories over the Ember stores
//!
//! Reads are served from copy-on-write caches and fall back to `core.db`.
//! Writes either go to a batch writer ([`WritePolicy::Deferred`]) or commit
//! before the call returns ([`WritePolicy::Immediate`]). Either way, each
//! visible change also emits its name/card snapshot and audit entry into the
//! monthly sharded stores.
//!
//! [`Persistence::open`] wires everything together:
//!
//! ```ignore
//! let persistence = Persistence::open(PersistenceConfig::from_env()).await?;
//! persistence.warm_up_all().await?;
//! persistence
//!     .users
//!     .save_user("10001", Some("alice"), None, WritePolicy::Deferred)
//!     .await?;
//! persistence.shutdown().await;
//! ```
//!
//! [`WritePolicy::Deferred`]: ember_core::WritePolicy::Deferred
//! [`WritePolicy::Immediate`]: ember_core::WritePolicy::Immediate

pub mod effects;
pub mod items;
pub mod jobs;
pub mod ops;
pub mod persistence;
pub mod repositories;
pub mod schema;
pub mod telemetry;
pub mod writers;

pub use effects::SideEffects;
pub use items::{ban_key, member_key, BanItem, GroupItem, MemberItem, UserItem};
pub use jobs::{archiver_task, ArchiverConfig, ArchiverMetrics, ArchiverSnapshot};
pub use persistence::{Caches, Persistence, Stores, WarmUpReport};
pub use repositories::{
    BlacklistRepository, GroupChange, GroupRepository, InvitationRepository, MemberChange,
    MemberRepository, MessageLogRepository, RankItem, UserChange, UserRepository,
};
pub use telemetry::{init_tracing, LogFormat, TelemetryConfig};
pub use writers::{CoreFlush, DeferredPayload, MessageLogFlush, Writers};
