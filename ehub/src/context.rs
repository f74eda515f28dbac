use std::sync::Arc;

use ehub_storage::StorageFactory;

use crate::broker::Broker;
use crate::rule::RuleManager;
use crate::session::{Recorder, SessionManager};
use crate::settings::Settings;
use crate::types::DB_SESSION;
use crate::Result;

/// Everything one hub instance owns, constructed once at startup.
#[derive(Clone)]
pub struct HubContext {
    pub settings: Settings,
    pub storage: Arc<StorageFactory>,
    pub broker: Broker,
    pub rules: RuleManager,
    pub sessions: SessionManager,
}

impl HubContext {
    /// Opens the stores under `storage.dir` and builds the broker, rule manager
    /// and session manager. Must be called within a tokio runtime.
    pub fn new(settings: Settings) -> Result<Self> {
        let storage = Arc::new(StorageFactory::new(&settings.storage.dir)?);
        let broker = Broker::new(settings.clone(), &storage)?;
        let rules = RuleManager::new(broker.clone())?;
        let recorder = Recorder::new(storage.new_db(DB_SESSION)?);
        let sessions = SessionManager::new(broker.clone(), rules.clone(), recorder);
        Ok(Self { settings, storage, broker, rules, sessions })
    }

    pub async fn start(&self) {
        self.rules.start().await;
        log::info!("hub started, storage dir: {:?}", self.storage.dir());
    }

    /// Shuts down in stages: sessions, then rules (which waits for offsets to
    /// be committed), then the broker, then flushes storage.
    pub async fn close(&self) {
        log::info!("hub closing");
        self.sessions.close_all().await;
        self.rules.close().await;
        self.broker.close().await;
        self.storage.close();
        log::info!("hub closed");
    }
}
