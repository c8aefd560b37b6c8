//! Composition root: wires the store, clients and services together so
//! that nothing reaches for process-wide singletons and tests can
//! substitute fakes.

use anyhow::Result;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::clients::anilist::AniListClient;
use crate::clients::animeworld::AnimeWorldClient;
use crate::clients::jikan::JikanClient;
use crate::clients::sonarr::SonarrClient;
use crate::config::Config;
use crate::db::Store;
use crate::domain::NotificationEvent;
use crate::downloads::DownloadQueue;
use crate::services::{
    ImportService, LogRing, MetadataService, Notifier, SeasonMatcher, WantedService,
};
use crate::settings::{SettingsService, keys};

pub struct SharedState {
    pub config: Config,
    pub store: Store,
    pub settings: Arc<SettingsService>,
    pub sonarr: Arc<SonarrClient>,
    pub anilist: Arc<AniListClient>,
    pub jikan: Arc<JikanClient>,
    pub animeworld: Arc<AnimeWorldClient>,
    pub metadata: Arc<MetadataService>,
    pub wanted: Arc<WantedService>,
    pub importer: Arc<ImportService>,
    pub queue: DownloadQueue,
    pub log_ring: Arc<LogRing>,
    pub notifier: Arc<Notifier>,
    pub event_bus: broadcast::Sender<NotificationEvent>,
}

impl SharedState {
    pub async fn new(config: Config) -> Result<Arc<Self>> {
        let store = Store::new(&config.general.database_path).await?;

        let settings = Arc::new(SettingsService::new(store.clone()));
        settings.initialize().await?;

        let (event_bus, _) = broadcast::channel(config.general.event_bus_buffer_size);

        let sonarr = Arc::new(SonarrClient::new(settings.clone()));
        let anilist = Arc::new(AniListClient::new());
        let jikan = Arc::new(JikanClient::new());
        let animeworld = Arc::new(AnimeWorldClient::new(settings.clone()));

        let importer = Arc::new(ImportService::new(
            store.clone(),
            settings.clone(),
            sonarr.clone(),
            event_bus.clone(),
        ));

        let queue = DownloadQueue::new(
            settings.clone(),
            importer.clone(),
            event_bus.clone(),
            PathBuf::from(&config.paths.tmp_path),
        );

        let matcher = SeasonMatcher::new(anilist.clone(), jikan.clone(), animeworld.clone());
        let metadata = Arc::new(MetadataService::new(
            store.clone(),
            settings.clone(),
            sonarr.clone(),
            matcher,
            event_bus.clone(),
            PathBuf::from(&config.paths.posters_path),
        ));

        let wanted = Arc::new(WantedService::new(
            store.clone(),
            settings.clone(),
            sonarr.clone(),
            animeworld.clone(),
            metadata.clone(),
            queue.clone(),
            event_bus.clone(),
        ));

        let log_ring = Arc::new(LogRing::new());
        let notifier = Arc::new(Notifier::new(sonarr.clone()));

        Ok(Arc::new(Self {
            config,
            store,
            settings,
            sonarr,
            anilist,
            jikan,
            animeworld,
            metadata,
            wanted,
            importer,
            queue,
            log_ring,
            notifier,
            event_bus,
        }))
    }

    /// Subscribes the log ring and the notification dispatcher to the bus.
    pub fn start_listeners(&self) {
        self.log_ring.clone().start_listener(&self.event_bus);
        self.notifier.clone().start_listener(&self.event_bus);
    }

    /// Writes a setting and applies its side effects: changing the Sonarr
    /// URL or token invalidates the health verdict and probes again right
    /// away.
    pub async fn set_setting(&self, key: &str, value: &Value) -> Result<()> {
        self.settings.set_value(key, value).await?;

        if key == keys::SONARR_URL || key == keys::SONARR_TOKEN {
            self.sonarr.reset_health().await;
            let sonarr = self.sonarr.clone();
            tokio::spawn(async move {
                sonarr.probe().await;
            });
        }

        Ok(())
    }
}
