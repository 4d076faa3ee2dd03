//! BLE Scanner Module
//!
//! Filtered, deduplicating peripheral discovery. Every call to
//! [`BleScanner::start`] produces an independent [`Sightings`] stream that
//! yields each matching identity once.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::Stream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::domain::filter::ScanFilter;
use crate::domain::models::{Advertisement, AppEvent, Identity, MessageSeverity, StatusMessage};

use super::peripheral::Peripheral;
use super::registry::SessionRegistry;
use super::transport::{Radio, ScanEvent};
use super::{report_error, BleError};

/// The first matching advertisement of one identity during one scan.
#[derive(Clone)]
pub struct Sighting {
    pub identity: Identity,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub advertisement: Advertisement,
    pub peripheral: Arc<Peripheral>,
}

/// Lazy sequence of sightings. Ends when the scan stops, its window elapses
/// or the radio fails (the failure is the last item). Dropping it stops the scan.
pub struct Sightings {
    rx: mpsc::UnboundedReceiver<Result<Sighting, BleError>>,
    stop: Arc<watch::Sender<bool>>,
}

impl Sightings {
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }
}

impl Stream for Sightings {
    type Item = Result<Sighting, BleError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Sightings {
    fn drop(&mut self) {
        self.stop.send_replace(true);
    }
}

struct ScanControl {
    stop: Arc<watch::Sender<bool>>,
    task: JoinHandle<()>,
}

impl ScanControl {
    async fn finish(self) {
        self.stop.send_replace(true);
        if let Err(e) = self.task.await {
            if e.is_panic() {
                error!("Scan task panicked: {}", e);
            }
        }
    }
}

/// BLE Scanner for discovering peripherals
pub struct BleScanner {
    radio: Arc<dyn Radio>,
    registry: Arc<SessionRegistry>,
    event_sender: mpsc::UnboundedSender<AppEvent>,
    scanning: Arc<watch::Sender<bool>>,
    active: Mutex<Option<ScanControl>>,
}

impl BleScanner {
    pub fn new(
        radio: Arc<dyn Radio>,
        registry: Arc<SessionRegistry>,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        Self {
            radio,
            registry,
            event_sender,
            scanning: Arc::new(watch::channel(false).0),
            active: Mutex::new(None),
        }
    }

    /// Start scanning
    ///
    /// # Arguments
    /// * `filter` - Frames that do not match are dropped
    /// * `window` - How long to scan, or `None` to scan until stopped
    pub async fn start(
        &self,
        filter: ScanFilter,
        window: Option<Duration>,
    ) -> Result<Sightings, BleError> {
        let mut active = self.active.lock().await;

        // Stop any existing scan
        if let Some(previous) = active.take() {
            previous.finish().await;
        }

        info!("Starting BLE scan (window: {:?})", window);
        set_scanning(&self.scanning, &self.event_sender, true);
        let _ = self.event_sender.send(AppEvent::LogMessage(StatusMessage {
            message: "Scanning for peripherals...".to_string(),
            severity: MessageSeverity::Info,
        }));

        let frames = match self.radio.start_scan(&filter).await {
            Ok(frames) => frames,
            Err(e) => {
                let err = BleError::ScanFailed(e.to_string());
                error!("{}", err);
                report_error(&self.event_sender, &err, None);
                set_scanning(&self.scanning, &self.event_sender, false);
                return Err(err);
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let stop = Arc::new(watch::channel(false).0);
        let task = ScanTask {
            radio: self.radio.clone(),
            registry: self.registry.clone(),
            event_sender: self.event_sender.clone(),
            scanning: self.scanning.clone(),
            filter,
            deadline: window.map(|w| Instant::now() + w),
        };
        let handle = tokio::spawn(task.run(frames, stop.subscribe(), tx));

        *active = Some(ScanControl {
            stop: stop.clone(),
            task: handle,
        });
        Ok(Sightings { rx, stop })
    }

    /// Stop scanning. Returns once the radio scan has been stopped.
    pub async fn stop(&self) {
        let control = self.active.lock().await.take();
        if let Some(control) = control {
            info!("Stopping BLE scan...");
            control.finish().await;
        }
    }

    /// Check if currently scanning
    pub fn is_scanning(&self) -> bool {
        *self.scanning.borrow()
    }

    pub fn watch_scanning(&self) -> watch::Receiver<bool> {
        self.scanning.subscribe()
    }
}

struct ScanTask {
    radio: Arc<dyn Radio>,
    registry: Arc<SessionRegistry>,
    event_sender: mpsc::UnboundedSender<AppEvent>,
    scanning: Arc<watch::Sender<bool>>,
    filter: ScanFilter,
    deadline: Option<Instant>,
}

impl ScanTask {
    async fn run(
        self,
        mut frames: mpsc::Receiver<ScanEvent>,
        mut stop: watch::Receiver<bool>,
        sightings: mpsc::UnboundedSender<Result<Sighting, BleError>>,
    ) {
        let mut seen: HashSet<Identity> = HashSet::new();
        let mut frame_count = 0usize;

        loop {
            tokio::select! {
                biased;
                _ = stop_requested(&mut stop) => {
                    debug!("Scan stop requested");
                    break;
                }
                _ = window_elapsed(self.deadline) => {
                    debug!("Scan window elapsed");
                    break;
                }
                frame = frames.recv() => match frame {
                    Some(ScanEvent::Advertisement(advertisement)) => {
                        frame_count += 1;
                        if !self.filter.matches(&advertisement) {
                            trace!("Filtered out frame from {}", advertisement.identity);
                            continue;
                        }
                        if !seen.insert(advertisement.identity.clone()) {
                            continue;
                        }
                        let sighting = self.sighting(advertisement);
                        if sightings.send(Ok(sighting)).is_err() {
                            debug!("Sighting consumer went away");
                            break;
                        }
                    }
                    Some(ScanEvent::Failed(reason)) => {
                        let err = BleError::ScanFailed(reason);
                        error!("{}", err);
                        report_error(&self.event_sender, &err, None);
                        let _ = sightings.send(Err(err));
                        break;
                    }
                    None => {
                        debug!("Radio closed the scan");
                        break;
                    }
                }
            }
        }

        if let Err(e) = self.radio.stop_scan().await {
            warn!("Failed to stop radio scan: {}", e);
        }
        info!(
            "Scan finished: {} frame(s), {} peripheral(s) sighted",
            frame_count,
            seen.len()
        );
        let _ = self.event_sender.send(AppEvent::LogMessage(StatusMessage {
            message: "Scan stopped.".to_string(),
            severity: MessageSeverity::Info,
        }));
        set_scanning(&self.scanning, &self.event_sender, false);
    }

    fn sighting(&self, advertisement: Advertisement) -> Sighting {
        let identity = advertisement.identity.clone();
        let (peripheral, created) =
            self.registry
                .track(&identity, advertisement.name.as_deref(), &self.event_sender);
        if created {
            let _ = self
                .event_sender
                .send(AppEvent::PeripheralDiscovered(peripheral.snapshot()));
        }
        info!(
            "Sighted {} ({}), RSSI: {:?}",
            identity,
            advertisement.name.as_deref().unwrap_or("Unknown"),
            advertisement.rssi
        );
        Sighting {
            identity,
            name: advertisement.name.clone(),
            rssi: advertisement.rssi,
            advertisement,
            peripheral,
        }
    }
}

fn set_scanning(
    scanning: &watch::Sender<bool>,
    event_sender: &mpsc::UnboundedSender<AppEvent>,
    value: bool,
) {
    if scanning.send_if_modified(|current| {
        let changed = *current != value;
        *current = value;
        changed
    }) {
        let _ = event_sender.send(AppEvent::ScanningChanged(value));
    }
}

/// Resolves once a stop was requested or every stop handle is gone.
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    loop {
        let requested = *stop.borrow_and_update();
        if requested || stop.changed().await.is_err() {
            return;
        }
    }
}

async fn window_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
