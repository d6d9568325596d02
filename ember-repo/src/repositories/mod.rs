//! Cache-first repositories.
//!
//! A repository call reads the cached entry, replaces it through
//! [`ember_storage::CacheStore::upsert_with`], keeps only the fields that
//! really changed, and routes the resulting payloads under a [`WritePolicy`]:
//!
//! - `Deferred`: each payload goes to the writer of its field class.
//! - `Immediate`: core rows are written in one unit of work on `core.db`,
//!   then history and audit rows in one unit of work per shard. Errors are
//!   returned to the caller.

mod blacklist;
mod group;
mod invitation;
mod member;
mod message;
mod user;

pub use blacklist::BlacklistRepository;
pub use group::{GroupChange, GroupRepository};
pub use invitation::InvitationRepository;
pub use member::{MemberChange, MemberRepository};
pub use message::{MessageLogRepository, RankItem};
pub use user::{UserChange, UserRepository};

use ember_core::{EmberResult, WritePolicy};
use ember_storage::BatchWriter;
use rusqlite::Connection;

use crate::effects::SideEffects;
use crate::ops::audit::AuditRecord;
use crate::persistence::Stores;
use crate::writers::DeferredPayload;

type CoreWrite = Box<dyn FnOnce(&Connection) -> EmberResult<usize> + Send>;

/// Payloads produced by one repository call.
pub(crate) struct Outbox<'a> {
    policy: WritePolicy,
    stores: &'a Stores,
    core: Vec<CoreWrite>,
    effects: SideEffects,
}

impl<'a> Outbox<'a> {
    pub(crate) fn new(policy: WritePolicy, stores: &'a Stores) -> Self {
        Self {
            policy,
            stores,
            core: Vec::new(),
            effects: SideEffects::default(),
        }
    }

    /// Queue `payload` on `writer`, or stage it for the immediate write.
    pub(crate) fn push<P: DeferredPayload>(
        &mut self,
        writer: &BatchWriter<P>,
        payload: P,
    ) -> EmberResult<()> {
        match self.policy {
            WritePolicy::Deferred => writer.add(payload),
            WritePolicy::Immediate => {
                payload.side_effects(&mut self.effects);
                self.core.push(Box::new(move |conn: &Connection| {
                    P::write_core(conn, std::slice::from_ref(&payload))
                }));
                Ok(())
            }
        }
    }

    /// Stage a core write that has no deferred counterpart.
    pub(crate) fn core<F>(&mut self, write: F)
    where
        F: FnOnce(&Connection) -> EmberResult<usize> + Send + 'static,
    {
        self.core.push(Box::new(write));
    }

    pub(crate) fn audit(&mut self, record: AuditRecord) {
        self.effects.audit(record);
    }

    /// Run the staged immediate writes. A no-op under the deferred policy.
    pub(crate) async fn commit(self) -> EmberResult<()> {
        let Outbox {
            stores,
            core,
            effects,
            ..
        } = self;

        if !core.is_empty() {
            stores
                .core
                .session(true, move |tx| {
                    let conn: &Connection = tx;
                    for write in core {
                        write(conn)?;
                    }
                    Ok(())
                })
                .await?;
        }
        if !effects.is_empty() {
            effects.persist(&stores.snapshot, &stores.log).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use ember_core::PersistenceConfig;
    use ember_storage::BatchConfig;
    use tempfile::TempDir;

    use crate::persistence::{Caches, Stores};
    use crate::writers::Writers;

    /// Stores, caches and writers rooted in a fresh temp directory.
    pub(crate) struct Harness {
        pub dir: TempDir,
        pub config: PersistenceConfig,
        pub stores: Stores,
        pub caches: Caches,
        pub writers: Arc<Writers>,
    }

    impl Harness {
        pub async fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let config = ember_test_utils::fixtures::test_config(dir.path());
            let stores = Stores::new(&config).unwrap();
            stores.init_schemas().await.unwrap();
            let writers = Arc::new(Writers::new(&stores, BatchConfig::from(&config)).unwrap());
            Self {
                dir,
                config,
                stores,
                caches: Caches::default(),
                writers,
            }
        }
    }
}
