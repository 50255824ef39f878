//! Download event bus
//!
//! The extractor gateway emits typed progress and post-processing events
//! while a download runs. The scheduler subscribes to mirror them into
//! task labels; anything else interested can subscribe too.

use tokio::sync::broadcast;
use tracing::debug;

/// Events emitted while a media download is in flight
#[derive(Debug, Clone)]
pub enum DownloadEvent {
    /// Download advanced; emitted at most once per 5% step
    Progress {
        remote_key: String,
        percent: u8,
        eta: Option<String>,
    },
    /// A post-processing stage began
    PostProcessStart { remote_key: String, stage: String },
    /// A post-processing stage is running
    PostProcessing { remote_key: String, stage: String },
    /// A post-processing stage completed
    PostProcessFinished { remote_key: String, stage: String },
    /// The download completed and the file is in place
    Finished { remote_key: String },
}

/// Broadcast fan-out for download events
#[derive(Clone)]
pub struct DownloadEventBus {
    sender: broadcast::Sender<DownloadEvent>,
}

impl Default for DownloadEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl DownloadEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: DownloadEvent) {
        if self.sender.send(event).is_err() {
            debug!("No subscribers for download event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_reach_subscribers() {
        let bus = DownloadEventBus::new(8);
        let mut rx = bus.subscribe();

        bus.emit(DownloadEvent::Progress {
            remote_key: "abc".into(),
            percent: 25,
            eta: Some("00:30".into()),
        });
        bus.emit(DownloadEvent::Finished {
            remote_key: "abc".into(),
        });

        match rx.recv().await.unwrap() {
            DownloadEvent::Progress { percent, .. } => assert_eq!(percent, 25),
            other => panic!("unexpected event: {other:?}"),
        }
        match rx.recv().await.unwrap() {
            DownloadEvent::Finished { remote_key } => assert_eq!(remote_key, "abc"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_emit_without_subscribers_is_fine() {
        let bus = DownloadEventBus::new(8);
        bus.emit(DownloadEvent::Finished {
            remote_key: "abc".into(),
        });
    }
}
