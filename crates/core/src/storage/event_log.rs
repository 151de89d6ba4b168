use crate::events::{Event, EventLog};
use crate::types::RunId;
use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use walkdir::WalkDir;

/// Buffered events per run before they are written to disk
const FLUSH_THRESHOLD: usize = 100;

/// Event log implementation using gzip-compressed JSONL files, one per run per day
pub struct JsonlEventLog {
    base_path: PathBuf,
    // Pending events keyed by run; the lock also serializes file rewrites
    buffers: Mutex<HashMap<RunId, Vec<Event>>>,
    sequence: AtomicU64,
}

impl JsonlEventLog {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_path).context("Failed to create event log directory")?;
        Ok(Self {
            base_path,
            buffers: Mutex::new(HashMap::new()),
            sequence: AtomicU64::new(0),
        })
    }

    /// Get the path to the event log file for a specific run
    /// Format: events/YYYY/MM/DD/<run_id>.jsonl.gz
    fn event_log_path(&self, run_id: &RunId, date: NaiveDate) -> PathBuf {
        self.base_path
            .join("events")
            .join(format!("{:04}", date.year()))
            .join(format!("{:02}", date.month()))
            .join(format!("{:02}", date.day()))
            .join(format!("{}.jsonl.gz", run_id))
    }

    async fn flush_locked(&self, buffers: &mut HashMap<RunId, Vec<Event>>, run_id: &RunId) -> Result<()> {
        let pending = match buffers.remove(run_id) {
            Some(events) if !events.is_empty() => events,
            _ => return Ok(()),
        };

        let mut events_by_date: HashMap<NaiveDate, Vec<Event>> = HashMap::new();
        for event in pending {
            events_by_date
                .entry(event.timestamp.date_naive())
                .or_default()
                .push(event);
        }

        for (date, events) in events_by_date {
            let path = self.event_log_path(run_id, date);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .context("Failed to create event log directory")?;
            }

            let mut all_events = if path.exists() {
                read_jsonl_gz(&path)?
            } else {
                Vec::new()
            };
            all_events.extend(events);

            write_jsonl_gz(&path, &all_events).await?;
        }

        Ok(())
    }

    /// Get all event log files for a run across date shards
    fn get_log_files(&self, run_id: &RunId) -> Result<Vec<PathBuf>> {
        let events_dir = self.base_path.join("events");
        if !events_dir.exists() {
            return Ok(Vec::new());
        }

        let filename = format!("{}.jsonl.gz", run_id);
        let mut files = Vec::new();
        for entry in WalkDir::new(&events_dir).min_depth(4).max_depth(4) {
            let entry = entry.context("Failed to walk events directory")?;
            if entry.file_type().is_file() && entry.file_name().to_string_lossy() == filename {
                files.push(entry.into_path());
            }
        }

        Ok(files)
    }
}

fn read_jsonl_gz(path: &Path) -> Result<Vec<Event>> {
    use flate2::read::GzDecoder;
    use std::io::BufRead;

    let file = std::fs::File::open(path).context("Failed to open event log")?;
    let reader = std::io::BufReader::new(GzDecoder::new(file));

    let mut events = Vec::new();
    for line in reader.lines() {
        let line = line.context("Failed to read line from event log")?;
        if line.trim().is_empty() {
            continue;
        }
        let event: Event = serde_json::from_str(&line).context("Failed to parse event")?;
        events.push(event);
    }

    Ok(events)
}

async fn write_jsonl_gz(path: &Path, events: &[Event]) -> Result<()> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());

    for event in events {
        let json = serde_json::to_string(event).context("Failed to serialize event")?;
        encoder
            .write_all(json.as_bytes())
            .context("Failed to write event")?;
        encoder.write_all(b"\n").context("Failed to write newline")?;
    }

    let compressed = encoder.finish().context("Failed to finish compression")?;

    tokio::fs::write(path, compressed)
        .await
        .context("Failed to write event log file")?;

    Ok(())
}

#[async_trait::async_trait]
impl EventLog for JsonlEventLog {
    async fn append(&self, mut event: Event) -> Result<()> {
        event.sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let run_id = event.run_id;

        let should_flush = {
            let mut buffers = self.buffers.lock().await;
            let buffer = buffers.entry(run_id).or_default();
            buffer.push(event);
            buffer.len() >= FLUSH_THRESHOLD
        };

        if should_flush {
            self.flush_run(run_id).await?;
        }

        Ok(())
    }

    async fn flush_run(&self, run_id: RunId) -> Result<()> {
        let mut buffers = self.buffers.lock().await;
        self.flush_locked(&mut buffers, &run_id).await
    }

    async fn flush_all(&self) -> Result<()> {
        let mut buffers = self.buffers.lock().await;
        let run_ids: Vec<RunId> = buffers.keys().copied().collect();
        for run_id in &run_ids {
            self.flush_locked(&mut buffers, run_id).await?;
        }
        if !run_ids.is_empty() {
            tracing::info!(runs = run_ids.len(), "Flushed buffered events");
        }
        Ok(())
    }

    async fn get_run_events(&self, run_id: RunId) -> Result<Vec<Event>> {
        // Held while reading so a concurrent flush cannot rewrite a shard mid-read
        let mut buffers = self.buffers.lock().await;
        self.flush_locked(&mut buffers, &run_id).await?;

        let mut all_events = Vec::new();
        for file in self.get_log_files(&run_id)? {
            all_events.extend(read_jsonl_gz(&file)?);
        }
        drop(buffers);

        all_events.sort_by(|a, b| order_key(a).cmp(&order_key(b)));

        Ok(all_events)
    }
}

fn order_key(event: &Event) -> (DateTime<Utc>, u64) {
    (event.timestamp, event.sequence)
}
