//! # Object Logger
//!
//! Writes object snapshots to JSONL (JSON Lines) files with rotation.
//!
//! Which objects are logged, and when, follows each object's logging
//! update mode:
//!
//! | Mode | Records |
//! |------|---------|
//! | ONCHANGE | one per *updated* event |
//! | PERIODIC | one per logging period, driven by [`ObjectLogger::poll`] |
//! | MANUAL | only through [`ObjectLogger::log_object`] |
//! | NEVER | none |
//!
//! ## File Format
//!
//! ```text
//! {"timestamp":"2026-10-19T12:00:00.000Z","object":"AHRSSettings","object_id":3741078856,"instance":0,"fields":{"Algorithm":"INSGPS_INDOOR_NOMAG","Downsampling":20}}
//! ```
//!
//! Files are named `objects_<n>.jsonl`; `n` continues from the highest
//! index already in the directory. A file holds at most
//! `max_records_per_file` records and only the newest `max_files_to_keep`
//! files are kept.

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::scheduler::PeriodicScheduler;
use crate::config::ObjectLogConfig;
use crate::error::Result;
use crate::uavobject::{ObjectKey, ObjectManager, UavObject, UpdateMode};

const FILE_PREFIX: &str = "objects_";
const FILE_SUFFIX: &str = ".jsonl";

#[derive(Serialize)]
struct ObjectRecord<'a> {
    timestamp: String,
    object: &'a str,
    object_id: u32,
    instance: u16,
    fields: serde_json::Map<String, serde_json::Value>,
}

impl<'a> ObjectRecord<'a> {
    fn snapshot(obj: &'a UavObject) -> Result<Self> {
        let mut fields = serde_json::Map::new();
        for field in obj.fields() {
            let mut values = field.values();
            let value = if values.len() == 1 {
                serde_json::to_value(values.remove(0))
            } else {
                serde_json::to_value(values)
            };
            fields.insert(field.name().to_string(), value.map_err(io::Error::from)?);
        }

        Ok(Self {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            object: obj.name(),
            object_id: obj.object_id(),
            instance: obj.instance_id(),
            fields,
        })
    }
}

struct LogFile {
    next_index: u64,
    writer: Option<BufWriter<File>>,
    path: Option<PathBuf>,
    records_in_file: usize,
    records_written: u64,
}

/// JSONL writer for object snapshots
pub struct ObjectLogger {
    dir: PathBuf,
    max_records_per_file: usize,
    max_files_to_keep: usize,
    file: Mutex<LogFile>,
    scheduler: Mutex<PeriodicScheduler>,
    attached: Mutex<HashSet<ObjectKey>>,
}

impl ObjectLogger {
    /// Prepare the log directory; no file is created until the first record
    ///
    /// # Errors
    ///
    /// Returns `Io` if the directory cannot be created or listed.
    pub fn new(config: &ObjectLogConfig) -> Result<Self> {
        let dir = config.log_path();
        fs::create_dir_all(&dir)?;

        let next_index = log_files(&dir)?
            .last()
            .map(|(index, _)| index + 1)
            .unwrap_or(1);

        info!("Object log directory: {}", dir.display());

        Ok(Self {
            dir,
            max_records_per_file: config.max_records_per_file.max(1),
            max_files_to_keep: config.max_files_to_keep.max(1),
            file: Mutex::new(LogFile {
                next_index,
                writer: None,
                path: None,
                records_in_file: 0,
                records_written: 0,
            }),
            scheduler: Mutex::new(PeriodicScheduler::new()),
            attached: Mutex::new(HashSet::new()),
        })
    }

    /// Log ONCHANGE objects of `manager`, now and as they are registered
    pub fn attach(self: &Arc<Self>, manager: &ObjectManager) {
        let weak = Arc::downgrade(self);
        manager.on_new_object(move |obj| {
            if let Some(logger) = weak.upgrade() {
                logger.attach_object(obj);
            }
        });
        let weak = Arc::downgrade(self);
        manager.on_new_instance(move |obj| {
            if let Some(logger) = weak.upgrade() {
                logger.attach_object(obj);
            }
        });

        for obj in manager.get_objects().into_iter().flatten() {
            self.attach_object(&obj);
        }
    }

    fn attach_object(self: &Arc<Self>, obj: &Arc<UavObject>) {
        if !self.attached.lock().insert(obj.key()) {
            return;
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        obj.add_updated_observer(move |o| {
            let Some(logger) = weak.upgrade() else {
                return;
            };
            if o.metadata().logging_update_mode != UpdateMode::OnChange {
                return;
            }
            if let Err(e) = logger.log_object(o) {
                warn!("Failed to log {}: {}", o.name(), e);
            }
        });
    }

    /// Write one record for `obj`, regardless of its logging mode
    pub fn log_object(&self, obj: &UavObject) -> Result<()> {
        let record = ObjectRecord::snapshot(obj)?;

        let mut file = self.file.lock();
        if file.writer.is_none() || file.records_in_file >= self.max_records_per_file {
            self.rotate(&mut file)?;
        }

        if let Some(writer) = file.writer.as_mut() {
            serde_json::to_writer(&mut *writer, &record).map_err(io::Error::from)?;
            writer.write_all(b"\n")?;
            writer.flush()?;
        }
        file.records_in_file += 1;
        file.records_written += 1;
        Ok(())
    }

    /// Log every PERIODIC object whose logging period has elapsed
    ///
    /// Returns the number of records written.
    pub fn poll(&self, manager: &ObjectManager, now: Instant) -> Result<usize> {
        let mut written = 0;
        for obj in manager.get_objects().into_iter().flatten() {
            let metadata = obj.metadata();
            if metadata.logging_update_mode != UpdateMode::Periodic
                || metadata.logging_update_period == 0
            {
                continue;
            }

            let period = Duration::from_millis(metadata.logging_update_period as u64);
            if self.scheduler.lock().due(obj.key(), period, now) {
                self.log_object(&obj)?;
                written += 1;
            }
        }
        Ok(written)
    }

    pub fn records_written(&self) -> u64 {
        self.file.lock().records_written
    }

    /// Path of the file currently being written, if any
    pub fn current_file(&self) -> Option<PathBuf> {
        self.file.lock().path.clone()
    }

    fn rotate(&self, file: &mut LogFile) -> Result<()> {
        if let Some(mut writer) = file.writer.take() {
            writer.flush()?;
        }

        let path = self
            .dir
            .join(format!("{}{}{}", FILE_PREFIX, file.next_index, FILE_SUFFIX));
        let handle = File::create(&path)?;
        debug!("Opened object log file {}", path.display());

        file.next_index += 1;
        file.writer = Some(BufWriter::new(handle));
        file.path = Some(path);
        file.records_in_file = 0;

        self.prune()
    }

    fn prune(&self) -> Result<()> {
        let files = log_files(&self.dir)?;
        let excess = files.len().saturating_sub(self.max_files_to_keep);
        for (_, path) in files.into_iter().take(excess) {
            debug!("Removing old object log file {}", path.display());
            fs::remove_file(&path)?;
        }
        Ok(())
    }
}

/// Object log files in `dir`, oldest first
fn log_files(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let index = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.strip_prefix(FILE_PREFIX))
            .and_then(|rest| rest.strip_suffix(FILE_SUFFIX))
            .and_then(|n| n.parse::<u64>().ok());
        if let Some(index) = index {
            files.push((index, path));
        }
    }
    files.sort();
    Ok(files)
}
