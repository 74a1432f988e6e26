use log::{debug, warn};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::errors::DownloadError;

/// Receives download events for every video; implementations filter by id.
///
/// All callbacks run on the hub's single dispatch task, one at a time, so
/// implementations need no synchronization of their own against each other.
pub trait DownloadObserver: Send + Sync {
    /// `percent` is in `0.0..=100.0` and never decreases for a transfer.
    fn on_progress(&self, video_id: &str, percent: f64);

    fn on_error(&self, video_id: &str, error: &DownloadError);

    fn on_complete(&self, video_id: &str);

    /// Only called when `notify_cancelled` is enabled.
    fn on_cancelled(&self, _video_id: &str) {}
}

#[derive(Debug, Clone, PartialEq)]
pub enum DownloadEvent {
    Progress { video_id: String, percent: f64 },
    Error { video_id: String, error: DownloadError },
    Completed { video_id: String },
    Cancelled { video_id: String },
}

impl DownloadEvent {
    pub fn video_id(&self) -> &str {
        match self {
            DownloadEvent::Progress { video_id, .. }
            | DownloadEvent::Error { video_id, .. }
            | DownloadEvent::Completed { video_id }
            | DownloadEvent::Cancelled { video_id } => video_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, DownloadEvent::Progress { .. })
    }

    fn deliver(&self, observer: &dyn DownloadObserver) {
        match self {
            DownloadEvent::Progress { video_id, percent } => observer.on_progress(video_id, *percent),
            DownloadEvent::Error { video_id, error } => observer.on_error(video_id, error),
            DownloadEvent::Completed { video_id } => observer.on_complete(video_id),
            DownloadEvent::Cancelled { video_id } => observer.on_cancelled(video_id),
        }
    }
}

enum HubMessage {
    Deliver {
        event: DownloadEvent,
        /// Revoked when the transfer that produced the event is dequeued.
        generation: Option<CancellationToken>,
    },
    Flush(oneshot::Sender<()>),
}

type Registry = Arc<RwLock<Vec<Weak<dyn DownloadObserver>>>>;

/// Fan-out of download events to every registered observer.
///
/// The hub holds observers weakly: dropping the last `Arc` unregisters it.
/// Events are queued and delivered in order by one dispatch task.
#[derive(Clone)]
pub struct NotificationHub {
    observers: Registry,
    tx: mpsc::UnboundedSender<HubMessage>,
    dispatcher: Arc<std::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl NotificationHub {
    /// Starts the dispatch task. Must be called inside a Tokio runtime.
    pub fn start() -> Self {
        let observers: Registry = Arc::new(RwLock::new(Vec::new()));
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(dispatch_loop(rx, observers.clone()));

        Self {
            observers,
            tx,
            dispatcher: Arc::new(std::sync::Mutex::new(Some(handle))),
        }
    }

    /// Registers `observer`. Adding the same observer twice has no effect.
    pub async fn add(&self, observer: &Arc<dyn DownloadObserver>) {
        let mut observers = self.observers.write().await;
        observers.retain(|weak| weak.strong_count() > 0);
        if observers.iter().any(|weak| same_observer(weak, observer)) {
            return;
        }
        observers.push(Arc::downgrade(observer));
        debug!("Observer registered ({} total)", observers.len());
    }

    pub async fn remove(&self, observer: &Arc<dyn DownloadObserver>) {
        let mut observers = self.observers.write().await;
        observers.retain(|weak| weak.strong_count() > 0 && !same_observer(weak, observer));
    }

    pub async fn observer_count(&self) -> usize {
        self.observers
            .read()
            .await
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Queues an event that is dropped at delivery time if `generation` has been cancelled.
    pub(crate) fn publish(&self, event: DownloadEvent, generation: Option<CancellationToken>) {
        if self.tx.send(HubMessage::Deliver { event, generation }).is_err() {
            debug!("Notification hub is closed; event dropped");
        }
    }

    pub fn progress(&self, video_id: &str, percent: f64, generation: &CancellationToken) {
        self.publish(
            DownloadEvent::Progress { video_id: video_id.to_string(), percent },
            Some(generation.clone()),
        );
    }

    pub fn error(&self, video_id: &str, error: DownloadError, generation: &CancellationToken) {
        self.publish(
            DownloadEvent::Error { video_id: video_id.to_string(), error },
            Some(generation.clone()),
        );
    }

    pub fn complete(&self, video_id: &str, generation: &CancellationToken) {
        self.publish(
            DownloadEvent::Completed { video_id: video_id.to_string() },
            Some(generation.clone()),
        );
    }

    pub fn cancelled(&self, video_id: &str) {
        self.publish(DownloadEvent::Cancelled { video_id: video_id.to_string() }, None);
    }

    /// Waits until every event queued before this call has been delivered.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(HubMessage::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Delivers what is queued, then stops the dispatch task.
    pub async fn shutdown(&self) {
        self.flush().await;
        let handle = match self.dispatcher.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }
}

async fn dispatch_loop(mut rx: mpsc::UnboundedReceiver<HubMessage>, observers: Registry) {
    while let Some(message) = rx.recv().await {
        match message {
            HubMessage::Deliver { event, generation } => {
                let live: Vec<Arc<dyn DownloadObserver>> = observers
                    .read()
                    .await
                    .iter()
                    .filter_map(Weak::upgrade)
                    .collect();

                for observer in live {
                    if generation.as_ref().map_or(false, CancellationToken::is_cancelled) {
                        debug!("Dropping {:?} for a cancelled transfer", event);
                        break;
                    }
                    let delivered = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        event.deliver(observer.as_ref())
                    }));
                    if delivered.is_err() {
                        warn!("Observer panicked while handling {:?}", event);
                    }
                }
            }
            HubMessage::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

/// Compares data pointers only; vtable pointers for one type may differ between codegen units.
fn same_observer(weak: &Weak<dyn DownloadObserver>, observer: &Arc<dyn DownloadObserver>) -> bool {
    weak.as_ptr() as *const () == Arc::as_ptr(observer) as *const ()
}
