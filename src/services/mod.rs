//! External service integrations and shared process services

pub mod events;
pub mod extractor;
pub mod locks;
pub mod mediaservers;
pub mod thumbnails;

pub use events::{DownloadEvent, DownloadEventBus};
pub use extractor::{DownloadOptions, ExtractorService, RawItem};
pub use locks::{AdvisoryLocks, LockGuard};
pub use mediaservers::{MediaServerAdapter, RemoteLibrary, media_server_client};
pub use thumbnails::{FetchedThumbnail, NoThumbnail, ThumbnailService};
