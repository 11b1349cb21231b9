//! Startup shared by every command: config, store, recovery and the timer
//! service.

use std::sync::Arc;
use std::time::Duration;

use pomosync_core::sync::SyncSettings;
use pomosync_core::{
    Clock, Config, ConfigError, ConnectivityWatch, Database, HttpRemote, LocalStore,
    RecoveryAction, RemoteTimerService, SessionRecoveryEngine, SharedQueue, SyncEngine,
    SystemClock, TimerService,
};
use tracing::{info, warn};

pub struct App {
    pub config: Config,
    pub store: Arc<dyn LocalStore>,
    pub clock: Arc<dyn Clock>,
    pub service: TimerService,
}

impl App {
    /// Load config, open the database and recover the timer.
    ///
    /// Sessions that ran out while nothing was running are completed and
    /// queued here, so every command sees an up-to-date timer.
    pub fn open() -> Result<Self, Box<dyn std::error::Error>> {
        let config = Config::load()?;
        let store: Arc<dyn LocalStore> = Arc::new(Database::open()?);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());

        let recovery = SessionRecoveryEngine::with_config(
            store.clone(),
            clock.clone(),
            config.policy(),
            &config.recovery,
        );
        let report = recovery.recover()?;
        match &report.action {
            RecoveryAction::Fresh | RecoveryAction::Restored => {}
            RecoveryAction::CompletedOverdue { count } => {
                info!(count, gap_secs = report.gap_secs, "Completed sessions that ran out while closed");
            }
            RecoveryAction::ForceCompleted { error } => {
                warn!(error = %error, "Closed session after clock skew");
            }
        }

        let queue = SharedQueue::open(store.clone())?;
        let mut service = TimerService::new(
            report.machine,
            store.clone(),
            queue,
            config.recovery.checkpoint_every_ticks,
        );
        service.absorb(&report.events)?;

        Ok(Self {
            config,
            store,
            clock,
            service,
        })
    }

    pub fn recovery(&self) -> SessionRecoveryEngine {
        SessionRecoveryEngine::with_config(
            self.store.clone(),
            self.clock.clone(),
            self.config.policy(),
            &self.config.recovery,
        )
    }

    /// HTTP client for `sync.base_url`, or `None` when running local-only.
    pub fn remote(&self) -> Result<Option<HttpRemote>, ConfigError> {
        let timeout = Duration::from_secs(self.config.sync.request_timeout_secs);
        self.config
            .sync
            .base_url
            .as_deref()
            .map(|base_url| HttpRemote::new(base_url, timeout))
            .transpose()
    }

    /// Like [`App::remote`] but a missing `sync.base_url` is an error.
    pub fn require_remote(&self) -> Result<HttpRemote, Box<dyn std::error::Error>> {
        self.remote()?
            .ok_or_else(|| "sync.base_url is not set; see `pomosync config set sync.base_url <url>`".into())
    }

    pub fn sync_engine(
        &self,
        remote: Arc<dyn RemoteTimerService>,
        connectivity: ConnectivityWatch,
    ) -> SyncEngine {
        SyncEngine::new(
            self.service.queue().clone(),
            remote,
            self.store.clone(),
            self.clock.clone(),
            connectivity,
            SyncSettings::from_config(&self.config.sync),
        )
    }
}
