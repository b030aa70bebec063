//! Supervision of mounted buckets, one thread per mount.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::config::{FsSettings, MountDescriptor};
use crate::error::MountError;
use crate::fs::BucketFs;
use crate::store::Connector;

/// Attaches a filesystem to a mount point and blocks until it is detached.
pub trait Driver: Send + Sync {
    /// Returns once `stop` fires (or disconnects) or the mount goes away.
    fn run(
        &self,
        fs: Arc<BucketFs>,
        mountpoint: &Path,
        stop: flume::Receiver<()>,
    ) -> Result<(), MountError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountEvent {
    Mounting { drive: String, bucket: String },
    Unmounted { drive: String },
    Failed { drive: String, error: String },
}

struct LiveMount {
    id: u64,
    stop: flume::Sender<()>,
    thread: Option<JoinHandle<()>>,
}

pub struct MountManager {
    connector: Arc<dyn Connector>,
    driver: Arc<dyn Driver>,
    settings: FsSettings,
    active: Arc<Mutex<HashMap<MountDescriptor, LiveMount>>>,
    detached: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicU64,
    events_tx: flume::Sender<MountEvent>,
    events_rx: flume::Receiver<MountEvent>,
}

impl MountManager {
    pub fn new(connector: Arc<dyn Connector>, driver: Arc<dyn Driver>, settings: FsSettings) -> Self {
        let (events_tx, events_rx) = flume::unbounded();
        Self {
            connector,
            driver,
            settings,
            active: Arc::new(Mutex::new(HashMap::new())),
            detached: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            events_tx,
            events_rx,
        }
    }

    /// Lifecycle notifications from every mount thread.
    pub fn events(&self) -> flume::Receiver<MountEvent> {
        self.events_rx.clone()
    }

    /// Start one mount thread per descriptor. Each mount is tracked before
    /// its thread starts, so it counts as mounted immediately.
    pub fn mount_all(&self, descriptors: &[MountDescriptor]) {
        for descriptor in descriptors {
            self.mount(descriptor.clone());
        }
    }

    fn mount(&self, descriptor: MountDescriptor) {
        let mut active = self.active.lock();
        if active.contains_key(&descriptor) {
            warn!("{} is already mounted", descriptor.drive());
            return;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (stop_tx, stop_rx) = flume::bounded(1);
        active.insert(
            descriptor.clone(),
            LiveMount {
                id,
                stop: stop_tx,
                thread: None,
            },
        );

        let worker = MountWorker {
            id,
            descriptor: descriptor.clone(),
            connector: Arc::clone(&self.connector),
            driver: Arc::clone(&self.driver),
            settings: self.settings.clone(),
            active: Arc::clone(&self.active),
            events: self.events_tx.clone(),
        };
        let spawned = std::thread::Builder::new()
            .name(format!("bucketfs-mount-{}", descriptor.bucket))
            .spawn(move || worker.run(stop_rx));

        match spawned {
            Ok(thread) => {
                if let Some(live) = active.get_mut(&descriptor) {
                    live.thread = Some(thread);
                }
            }
            Err(e) => {
                active.remove(&descriptor);
                error!("failed to start mount thread for {}: {}", descriptor.drive(), e);
                let _ = self.events_tx.send(MountEvent::Failed {
                    drive: descriptor.drive(),
                    error: e.to_string(),
                });
            }
        }
    }

    /// Signal every mount to detach and forget them. Does not wait; see
    /// [`MountManager::join_detached`].
    pub fn unmount_all(&self) {
        let drained: Vec<_> = self.active.lock().drain().collect();
        let mut detached = self.detached.lock();
        for (descriptor, live) in drained {
            info!("unmounting {}", descriptor.drive());
            let _ = live.stop.send(());
            detached.extend(live.thread);
        }
    }

    /// Wait for mount threads signalled by [`MountManager::unmount_all`].
    pub fn join_detached(&self) {
        let threads: Vec<_> = self.detached.lock().drain(..).collect();
        for thread in threads {
            if thread.join().is_err() {
                warn!("mount thread exited abnormally");
            }
        }
    }

    pub fn is_any_mounted(&self) -> bool {
        !self.active.lock().is_empty()
    }

    /// Drives currently mounted, in no particular order.
    pub fn mounted(&self) -> Vec<String> {
        self.active.lock().keys().map(|d| d.drive()).collect()
    }
}

impl Drop for MountManager {
    fn drop(&mut self) {
        self.unmount_all();
    }
}

/// Everything one mount thread needs.
struct MountWorker {
    id: u64,
    descriptor: MountDescriptor,
    connector: Arc<dyn Connector>,
    driver: Arc<dyn Driver>,
    settings: FsSettings,
    active: Arc<Mutex<HashMap<MountDescriptor, LiveMount>>>,
    events: flume::Sender<MountEvent>,
}

impl MountWorker {
    fn run(self, stop: flume::Receiver<()>) {
        let drive = self.descriptor.drive();
        let _ = self.events.send(MountEvent::Mounting {
            drive: drive.clone(),
            bucket: self.descriptor.bucket.clone(),
        });

        let result = match panic::catch_unwind(AssertUnwindSafe(|| self.mount(stop))) {
            Ok(result) => result,
            Err(payload) => Err(MountError::Panicked(panic_message(payload.as_ref()))),
        };

        // A later mount of the same descriptor may already own the slot.
        {
            let mut active = self.active.lock();
            if active.get(&self.descriptor).map(|m| m.id) == Some(self.id) {
                active.remove(&self.descriptor);
            }
        }

        let event = match result {
            Ok(()) => {
                info!("{} unmounted", drive);
                MountEvent::Unmounted { drive }
            }
            Err(e) => {
                error!("mount of {} failed: {}", drive, e);
                MountEvent::Failed {
                    drive,
                    error: e.to_string(),
                }
            }
        };
        let _ = self.events.send(event);
    }

    fn mount(&self, stop: flume::Receiver<()>) -> Result<(), MountError> {
        let client = self.connector.connect(&self.descriptor.credentials)?;
        let bucket = client.ensure_bucket(&self.descriptor.bucket)?;
        let fs = Arc::new(BucketFs::new(bucket, self.settings.clone()));
        info!(
            "mounting bucket {} at {}",
            self.descriptor.bucket,
            self.descriptor.drive()
        );
        self.driver.run(fs, &self.descriptor.mountpoint, stop)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
