//! # CSV Storage Module
//!
//! Persists heart-rate and R-R samples to per-device CSV files on a single
//! background thread shared by every connected device.
//!
//! ## Architecture
//! - **StorageContext**: owns the storage thread and its FIFO command channel
//! - **StorageWorker**: per-device state living on that thread; owns two writers
//! - **MediaIndexer**: told about each finished file on `Close`
//!
//! ## File Layout
//! ```text
//! <root>/HRV/
//! ├── hr_AABBCCDDEEFF_20240131_154500.csv   {wall_ms};{bpm}
//! └── rr_AABBCCDDEEFF_20240131_154500.csv   {wall_ms};{rr}  (one line per interval)
//! ```
//!
//! ## Ordering
//! All devices share one channel and one consumer, so per device the commands
//! are applied exactly in the order they were posted. A `Write` only lands
//! between an `Open` and the following `Close`; anything else is dropped.

use crate::error::StorageError;
use crate::gatt::DeviceAddress;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread;

pub const LOG_DIR_NAME: &str = "HRV";

/// Command for a device's storage worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageCommand {
    Open,
    Write {
        heart_rate: u16,
        rr_intervals: Vec<u16>,
        wall_ms: i64,
    },
    Close,
}

/// Message sent to the storage thread
#[derive(Debug)]
enum StorageMessage {
    Post {
        address: DeviceAddress,
        command: StorageCommand,
    },
    /// Acknowledge once everything queued before it has been applied
    Sync(Sender<()>),
    Stop,
}

/// Receives the paths of finished log files.
pub trait MediaIndexer: Send {
    fn scan_file(&self, path: &Path);
}

/// Indexer that only logs the finished path.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogIndexer;

impl MediaIndexer for LogIndexer {
    fn scan_file(&self, path: &Path) {
        log::info!("Log file ready: {}", path.display());
    }
}

struct StorageSession {
    hr_file_path: PathBuf,
    rr_file_path: PathBuf,
    hr_writer: BufWriter<File>,
    rr_writer: BufWriter<File>,
}

impl StorageSession {
    fn append(
        &mut self,
        heart_rate: u16,
        rr_intervals: &[u16],
        wall_ms: i64,
    ) -> Result<(), StorageError> {
        writeln!(self.hr_writer, "{};{}", wall_ms, heart_rate).map_err(StorageError::Write)?;
        for rr in rr_intervals {
            writeln!(self.rr_writer, "{};{}", wall_ms, rr).map_err(StorageError::Write)?;
        }
        self.flush()
    }

    fn flush(&mut self) -> Result<(), StorageError> {
        self.hr_writer.flush().map_err(StorageError::Write)?;
        self.rr_writer.flush().map_err(StorageError::Write)
    }
}

/// Storage state of one device. Lives on the storage thread.
pub struct StorageWorker {
    address: DeviceAddress,
    root: PathBuf,
    session: Option<StorageSession>,
    writable: bool,
}

impl StorageWorker {
    pub fn new(address: DeviceAddress, root: PathBuf) -> Self {
        Self {
            address,
            root,
            session: None,
            writable: false,
        }
    }

    pub fn handle(&mut self, command: StorageCommand, indexer: &dyn MediaIndexer) {
        match command {
            StorageCommand::Open => self.open(indexer),
            StorageCommand::Write {
                heart_rate,
                rr_intervals,
                wall_ms,
            } => self.write(heart_rate, &rr_intervals, wall_ms),
            StorageCommand::Close => self.close(indexer),
        }
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Paths of the currently open HR and RR files
    pub fn file_paths(&self) -> Option<(&Path, &Path)> {
        self.session
            .as_ref()
            .map(|s| (s.hr_file_path.as_path(), s.rr_file_path.as_path()))
    }

    fn open(&mut self, indexer: &dyn MediaIndexer) {
        if self.session.is_some() {
            log::debug!("Reopening logs for {}, closing previous files first", self.address);
            self.close(indexer);
        }

        match self.create_session() {
            Ok(session) => {
                log::info!(
                    "Logging {} to {} and {}",
                    self.address,
                    session.hr_file_path.display(),
                    session.rr_file_path.display()
                );
                self.session = Some(session);
                self.writable = true;
            }
            Err(e) => {
                log::error!("Failed to open logs for {}: {}", self.address, e);
            }
        }
    }

    fn create_session(&self) -> Result<StorageSession, StorageError> {
        let dir = self.root.join(LOG_DIR_NAME);
        fs::create_dir_all(&dir).map_err(StorageError::CreateDir)?;

        // Both files of a session share one timestamp
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
        let stem = unused_stem(&dir, &format!("{}_{}", self.address.without_colons(), timestamp));
        let hr_file_path = dir.join(format!("hr_{}.csv", stem));
        let rr_file_path = dir.join(format!("rr_{}.csv", stem));

        let hr_writer = BufWriter::new(File::create(&hr_file_path).map_err(StorageError::Open)?);
        let rr_writer = BufWriter::new(File::create(&rr_file_path).map_err(StorageError::Open)?);

        Ok(StorageSession {
            hr_file_path,
            rr_file_path,
            hr_writer,
            rr_writer,
        })
    }

    fn write(&mut self, heart_rate: u16, rr_intervals: &[u16], wall_ms: i64) {
        if !self.writable {
            log::debug!("Dropping sample from {}: logs not open", self.address);
            return;
        }
        if let Some(session) = self.session.as_mut() {
            if let Err(e) = session.append(heart_rate, rr_intervals, wall_ms) {
                log::error!("Failed to store sample from {}: {}", self.address, e);
            }
        }
    }

    fn close(&mut self, indexer: &dyn MediaIndexer) {
        let Some(mut session) = self.session.take() else {
            log::debug!("Close for {} without open logs", self.address);
            return;
        };

        log::debug!("Closing {}", session.hr_file_path.display());
        if let Err(e) = session.flush() {
            log::error!("Failed to flush logs for {}: {}", self.address, e);
        }
        // Not writable after CLOSE even when the flush failed; the files are gone either way
        self.writable = false;

        let StorageSession {
            hr_file_path,
            rr_file_path,
            hr_writer,
            rr_writer,
        } = session;
        drop(hr_writer);
        drop(rr_writer);

        indexer.scan_file(&rr_file_path);
        indexer.scan_file(&hr_file_path);
    }
}

/// `{device}_{timestamp}`, or the first free `{device}_{timestamp}_{n}` when a
/// session opened earlier in the same second already owns that name.
fn unused_stem(dir: &Path, base: &str) -> String {
    let taken = |stem: &str| {
        dir.join(format!("hr_{}.csv", stem)).exists()
            || dir.join(format!("rr_{}.csv", stem)).exists()
    };
    if !taken(base) {
        return base.to_string();
    }
    let mut n = 1;
    loop {
        let stem = format!("{}_{}", base, n);
        if !taken(&stem) {
            log::warn!("Logs named {} already exist, writing to {} instead", base, stem);
            return stem;
        }
        n += 1;
    }
}

/// Shared storage thread plus its command queue.
pub struct StorageContext {
    command_tx: Sender<StorageMessage>,
    writer_thread: Option<thread::JoinHandle<()>>,
}

impl StorageContext {
    /// Starts the storage thread writing under `root/HRV`.
    pub fn start(root: PathBuf, indexer: Box<dyn MediaIndexer>) -> Result<Self, StorageError> {
        let (command_tx, command_rx) = unbounded();

        let writer_thread = thread::Builder::new()
            .name("storage".to_string())
            .spawn(move || {
                Self::writer_loop(command_rx, root, indexer);
            })
            .map_err(StorageError::Spawn)?;

        Ok(Self {
            command_tx,
            writer_thread: Some(writer_thread),
        })
    }

    /// Queues a command for the device's worker. Non-blocking.
    pub fn post(&self, address: &DeviceAddress, command: StorageCommand) {
        let message = StorageMessage::Post {
            address: address.clone(),
            command,
        };
        if let Err(e) = self.command_tx.send(message) {
            log::warn!("Storage thread gone, dropping command: {:?}", e.0);
        }
    }

    /// Blocks until every command posted so far has been applied.
    pub fn sync(&self) {
        let (done_tx, done_rx) = bounded(1);
        if self.command_tx.send(StorageMessage::Sync(done_tx)).is_ok() {
            let _ = done_rx.recv();
        }
    }

    /// Drains the queue, closes any open files and joins the thread.
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.writer_thread.take() {
            let _ = self.command_tx.send(StorageMessage::Stop);
            if handle.join().is_err() {
                log::error!("Storage thread panicked");
            }
        }
    }

    fn writer_loop(
        command_rx: Receiver<StorageMessage>,
        root: PathBuf,
        indexer: Box<dyn MediaIndexer>,
    ) {
        let mut workers: HashMap<DeviceAddress, StorageWorker> = HashMap::new();

        loop {
            match command_rx.recv() {
                Ok(StorageMessage::Post { address, command }) => {
                    let worker = workers
                        .entry(address.clone())
                        .or_insert_with(|| StorageWorker::new(address, root.clone()));
                    worker.handle(command, indexer.as_ref());
                }
                Ok(StorageMessage::Sync(done)) => {
                    let _ = done.send(());
                }
                Ok(StorageMessage::Stop) => {
                    Self::close_all(&mut workers, indexer.as_ref());
                    log::info!("Storage thread stopped");
                    break;
                }
                Err(_) => {
                    Self::close_all(&mut workers, indexer.as_ref());
                    log::info!("Storage thread: command channel closed");
                    break;
                }
            }
        }
    }

    fn close_all(workers: &mut HashMap<DeviceAddress, StorageWorker>, indexer: &dyn MediaIndexer) {
        for worker in workers.values_mut().filter(|w| w.session.is_some()) {
            worker.close(indexer);
        }
    }
}

impl Drop for StorageContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}
