//! Shared service context
//!
//! One explicit struct carrying every service a task handler may need.
//! Handlers receive it as an argument; there are no global singletons.

use std::sync::Arc;

use crate::config::Config;
use crate::db::Database;
use crate::matching::MatcherConfig;
use crate::services::events::DownloadEventBus;
use crate::services::extractor::ExtractorService;
use crate::services::locks::AdvisoryLocks;
use crate::services::thumbnails::ThumbnailService;

pub struct ServiceContext {
    pub config: Config,
    pub db: Database,
    pub locks: AdvisoryLocks,
    pub extractor: ExtractorService,
    pub events: DownloadEventBus,
    pub thumbnails: ThumbnailService,
    pub matcher: MatcherConfig,
}

impl ServiceContext {
    pub fn new(config: Config, db: Database) -> anyhow::Result<Arc<Self>> {
        let events = DownloadEventBus::default();
        let extractor = ExtractorService::new(
            config.extractor_bin.clone(),
            config.extractor_cache_dir.clone(),
            config.temp_dir.clone(),
            events.clone(),
        );
        let thumbnails = ThumbnailService::new(config.thumbnail_max_width, config.thumbnail_max_height)?;
        let matcher = MatcherConfig {
            english_language_codes: config.english_language_codes.clone(),
            hd_cutoff_height: config.hd_cutoff_height,
            min_fallback_height: config.min_fallback_height,
        };
        Ok(Arc::new(Self {
            config,
            db,
            locks: AdvisoryLocks::new(),
            extractor,
            events,
            thumbnails,
            matcher,
        }))
    }
}
