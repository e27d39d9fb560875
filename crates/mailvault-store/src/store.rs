//! Store assembly.
//!
//! One [`Store`] owns the connection pool, the shared configuration, and
//! every component built over them. Components are cheap handles over the
//! same pool, so cloning a repository out of the store is free.

use std::sync::Arc;

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use crate::attachment::AttachmentRepository;
use crate::config::StoreConfig;
use crate::counter::CounterService;
use crate::journal::{LocalBus, Notifier, PulseBus, UpdatesFeed};
use crate::mailbox::MailboxRegistry;
use crate::message::{MessageHandler, MimeIndexer};
use crate::thread::ThreadResolver;
use crate::user::UserRepository;
use crate::Result;

/// The assembled message store.
pub struct Store {
    pool: SqlitePool,
    /// Shared configuration.
    pub config: StoreConfig,
    /// User accounts and quota accounting.
    pub users: UserRepository,
    /// Mailboxes and the slot-reservation primitive.
    pub mailboxes: MailboxRegistry,
    /// Attachment blobs.
    pub attachments: AttachmentRepository,
    /// Conversation threads.
    pub threads: ThreadResolver,
    /// TTL counters (auth rate limiting and similar tallies).
    pub counters: Arc<CounterService>,
    /// Journal appends and fanout.
    pub notifier: Notifier,
    bus: Arc<dyn PulseBus>,
}

impl Store {
    /// Opens (and creates, if needed) a store at the given database path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection or schema creation
    /// fails.
    pub async fn open(database_path: &str, config: StoreConfig) -> Result<Self> {
        let url = format!("sqlite:{database_path}?mode=rwc");
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;
        Self::assemble(pool, config).await
    }

    /// Creates an in-memory store for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection or schema creation
    /// fails.
    pub async fn in_memory(config: StoreConfig) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::assemble(pool, config).await
    }

    async fn assemble(pool: SqlitePool, config: StoreConfig) -> Result<Self> {
        let bus: Arc<dyn PulseBus> = Arc::new(LocalBus::default());
        let users = UserRepository::new(pool.clone());
        let mailboxes = MailboxRegistry::new(pool.clone());
        let attachments = AttachmentRepository::new(pool.clone());
        let threads = ThreadResolver::new(pool.clone());
        let notifier = Notifier::new(pool.clone(), mailboxes.clone(), bus.clone());

        users.initialize().await?;
        mailboxes.initialize().await?;
        attachments.initialize().await?;
        threads.initialize().await?;
        notifier.initialize().await?;
        MessageHandler::initialize(&pool).await?;

        Ok(Self {
            pool,
            config,
            users,
            mailboxes,
            attachments,
            threads,
            counters: Arc::new(CounterService::new()),
            notifier,
            bus,
        })
    }

    /// Builds a message handler over this store's components.
    #[must_use]
    pub fn handler(&self, indexer: Arc<dyn MimeIndexer>) -> MessageHandler {
        MessageHandler::new(
            self.pool.clone(),
            self.config.clone(),
            self.mailboxes.clone(),
            self.users.clone(),
            self.attachments.clone(),
            self.threads.clone(),
            self.notifier.clone(),
            indexer,
        )
    }

    /// Builds a live-updates feed over this store's journal.
    #[must_use]
    pub fn updates_feed(&self) -> UpdatesFeed {
        UpdatesFeed::new(
            self.pool.clone(),
            self.mailboxes.clone(),
            self.bus.clone(),
            self.config.clone(),
        )
    }

    /// The notification bus, for external subscribers.
    #[must_use]
    pub fn bus(&self) -> Arc<dyn PulseBus> {
        self.bus.clone()
    }

    /// The underlying pool.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// A single-connection in-memory pool for repository unit tests.
#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory pool")
}
