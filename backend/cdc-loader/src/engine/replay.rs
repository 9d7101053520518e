//! File replay engine.
//!
//! Replays Debezium change values captured as JSON lines (one value per line,
//! a bare `null` line for a tombstone). With `replay.follow=true` the file is
//! tailed like a log and lines appended later are delivered as they arrive;
//! otherwise the engine stops by itself at end of file.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::{interruptible_sleep, ChangeEngine, ChangeEvent, ChangeHandler, EngineErrorState};
use crate::config::Properties;
use crate::error::{LoaderError, Result};

const DEFAULT_MAX_BATCH_SIZE: usize = 2048;
const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
const DEFAULT_TOPIC_PREFIX: &str = "cdc";

/// Settings read from the engine properties
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplaySettings {
    /// `replay.file`
    pub path: PathBuf,
    /// `topic.prefix`, reported as every record's destination
    pub destination: String,
    /// `max.batch.size`
    pub max_batch_size: usize,
    /// `poll.interval.ms`
    pub poll_interval: Duration,
    /// `replay.follow`
    pub follow: bool,
}

impl ReplaySettings {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            destination: DEFAULT_TOPIC_PREFIX.to_string(),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            follow: false,
        }
    }

    pub fn from_properties(props: &Properties) -> Result<Self> {
        let max_batch_size: usize = props.get_parsed("max.batch.size", DEFAULT_MAX_BATCH_SIZE)?;
        if max_batch_size == 0 {
            return Err(LoaderError::Properties(
                "max.batch.size must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            path: PathBuf::from(props.require("replay.file")?),
            destination: props
                .get("topic.prefix")
                .unwrap_or(DEFAULT_TOPIC_PREFIX)
                .to_string(),
            max_batch_size,
            poll_interval: Duration::from_millis(
                props.get_parsed("poll.interval.ms", DEFAULT_POLL_INTERVAL_MS)?,
            ),
            follow: props.get_parsed("replay.follow", false)?,
        })
    }
}

/// One replayed line; lives only for the duration of a handler call
struct ReplayRecord<'a> {
    value: Option<Vec<u8>>,
    destination: &'a str,
}

impl ChangeEvent for ReplayRecord<'_> {
    fn key(&self) -> Result<Option<&[u8]>> {
        Ok(None)
    }

    fn value(&self) -> Result<Option<&[u8]>> {
        Ok(self.value.as_deref())
    }

    fn destination(&self) -> Result<Option<&str>> {
        Ok(Some(self.destination))
    }
}

/// Reads complete lines, holding back a trailing partial line while following
struct LineReader {
    reader: BufReader<File>,
    pending: Vec<u8>,
    follow: bool,
    /// Bytes consumed up to the end of the last delivered line
    offset: u64,
}

impl LineReader {
    /// Open the file positioned at `offset`. A file shorter than `offset` was
    /// truncated or replaced and is read from the start.
    fn open(settings: &ReplaySettings, offset: u64) -> io::Result<Self> {
        let mut file = File::open(&settings.path)?;
        let len = file.metadata()?.len();
        let offset = if offset > len {
            warn!(
                path = %settings.path.display(),
                offset,
                len,
                "Replay file shrank, reading from the start"
            );
            0
        } else {
            offset
        };
        file.seek(SeekFrom::Start(offset))?;

        Ok(Self {
            reader: BufReader::new(file),
            pending: Vec::new(),
            follow: settings.follow,
            offset,
        })
    }

    fn offset(&self) -> u64 {
        self.offset
    }

    /// Up to `max` change values; an empty result means end of file for now
    fn read_batch(&mut self, max: usize) -> io::Result<Vec<Option<Vec<u8>>>> {
        let mut values = Vec::new();

        while values.len() < max {
            let read = self.reader.read_until(b'\n', &mut self.pending)?;
            if read == 0 {
                if !self.follow && !self.pending.is_empty() {
                    let line = std::mem::take(&mut self.pending);
                    self.offset += line.len() as u64;
                    push_line(&mut values, &line);
                }
                break;
            }
            if !self.pending.ends_with(b"\n") {
                if self.follow {
                    break;
                }
                continue;
            }

            let line = std::mem::take(&mut self.pending);
            self.offset += line.len() as u64;
            push_line(&mut values, &line);
        }

        Ok(values)
    }
}

fn push_line(values: &mut Vec<Option<Vec<u8>>>, line: &[u8]) {
    let start = line
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(line.len());
    let end = line
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |last| last + 1);

    match &line[start..end] {
        b"" => {}
        b"null" => values.push(None),
        value => values.push(Some(value.to_vec())),
    }
}

pub struct ReplayEngine {
    settings: ReplaySettings,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ReplayEngine {
    pub fn new(settings: ReplaySettings) -> Self {
        Self {
            settings,
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    pub fn from_properties(props: &Properties) -> Result<Self> {
        Ok(Self::new(ReplaySettings::from_properties(props)?))
    }

    pub fn settings(&self) -> &ReplaySettings {
        &self.settings
    }
}

impl ChangeEngine for ReplayEngine {
    fn start(&mut self, handler: Arc<dyn ChangeHandler>) -> Result<()> {
        if self.handle.is_some() {
            return Err(LoaderError::Engine("replay engine already started".to_string()));
        }

        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let settings = self.settings.clone();

        let handle = thread::Builder::new()
            .name("cdc-engine".to_string())
            .spawn(move || {
                info!(
                    path = %settings.path.display(),
                    follow = settings.follow,
                    "Replay engine started"
                );
                let replay = panic::catch_unwind(AssertUnwindSafe(|| {
                    replay_loop(&settings, handler.as_ref(), &running)
                }));
                if replay.is_err() {
                    error!("Replay engine crashed");
                }
                running.store(false, Ordering::SeqCst);
                info!("Replay engine stopped");
            })
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                LoaderError::Engine(format!("Failed to spawn replay engine thread: {}", e))
            })?;

        self.handle = Some(handle);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Replay engine thread panicked");
                return Err(LoaderError::Engine("replay engine thread panicked".to_string()));
            }
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for ReplayEngine {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn replay_loop(settings: &ReplaySettings, handler: &dyn ChangeHandler, running: &AtomicBool) {
    let errors = EngineErrorState::new();
    let keep_going = || running.load(Ordering::SeqCst);
    let mut reader: Option<LineReader> = None;
    // Where a reopened reader resumes, so delivered lines are not replayed
    let mut resume_at = 0u64;

    while keep_going() {
        if reader.is_none() {
            match LineReader::open(settings, resume_at) {
                Ok(opened) => reader = Some(opened),
                Err(e) if !settings.follow => {
                    error!(path = %settings.path.display(), error = %e, "Cannot open replay file");
                    return;
                }
                Err(e) => {
                    errors.record_error();
                    let backoff = errors.calculate_backoff();
                    warn!(
                        path = %settings.path.display(),
                        error = %e,
                        backoff_secs = backoff.as_secs(),
                        "Replay file not available, retrying"
                    );
                    interruptible_sleep(backoff, keep_going);
                    continue;
                }
            }
        }
        let Some(lines) = reader.as_mut() else {
            continue;
        };

        match lines.read_batch(settings.max_batch_size) {
            Ok(values) if values.is_empty() => {
                errors.record_success();
                if !settings.follow {
                    info!("Replay file exhausted");
                    return;
                }
                interruptible_sleep(settings.poll_interval, keep_going);
            }
            Ok(values) => {
                errors.record_success();
                deliver(handler, values, &settings.destination);
            }
            Err(e) => {
                let consecutive = errors.record_error();
                let backoff = errors.calculate_backoff();
                error!(
                    error = %e,
                    consecutive_errors = consecutive,
                    backoff_secs = backoff.as_secs(),
                    "Failed to read replay file, reopening after backoff"
                );
                resume_at = lines.offset();
                reader = None;
                interruptible_sleep(backoff, keep_going);
            }
        }
    }
}

fn deliver(handler: &dyn ChangeHandler, values: Vec<Option<Vec<u8>>>, destination: &str) {
    let records: Vec<ReplayRecord<'_>> = values
        .into_iter()
        .map(|value| ReplayRecord { value, destination })
        .collect();
    let handles: Vec<&dyn ChangeEvent> = records.iter().map(|r| r as &dyn ChangeEvent).collect();

    debug!(records = handles.len(), "Delivering replayed batch");
    handler.handle_batch(&handles);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;
    use std::time::Instant;

    #[derive(Default)]
    struct Collect {
        batches: Mutex<Vec<Vec<Option<Vec<u8>>>>>,
    }

    impl ChangeHandler for Collect {
        fn handle_batch(&self, records: &[&dyn ChangeEvent]) {
            let batch = records
                .iter()
                .map(|r| r.value().unwrap().map(<[u8]>::to_vec))
                .collect();
            self.batches.lock().unwrap().push(batch);
        }
    }

    fn wait_until(deadline: Duration, done: impl Fn() -> bool) {
        let started = Instant::now();
        while !done() && started.elapsed() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_settings_from_properties() {
        let props = Properties::parse(
            "replay.file=/tmp/changes.jsonl\n\
             topic.prefix=shop\n\
             max.batch.size=10\n\
             replay.follow=true\n",
        );
        let settings = ReplaySettings::from_properties(&props).unwrap();

        assert_eq!(settings.path, PathBuf::from("/tmp/changes.jsonl"));
        assert_eq!(settings.destination, "shop");
        assert_eq!(settings.max_batch_size, 10);
        assert_eq!(settings.poll_interval, Duration::from_millis(500));
        assert!(settings.follow);
    }

    #[test]
    fn test_settings_require_file_and_positive_batch() {
        assert!(ReplaySettings::from_properties(&Properties::new()).is_err());

        let props = Properties::parse("replay.file=x\nmax.batch.size=0\n");
        assert!(ReplaySettings::from_properties(&props).is_err());
    }

    #[test]
    fn test_replays_file_in_bounded_batches() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{{\"a\":1}}").unwrap();
        writeln!(file, "null").unwrap();
        writeln!(file).unwrap();
        write!(file, "{{\"a\":2}}").unwrap();
        file.flush().unwrap();

        let mut settings = ReplaySettings::new(file.path());
        settings.max_batch_size = 2;
        let mut engine = ReplayEngine::new(settings);
        let collect = Arc::new(Collect::default());

        engine.start(collect.clone()).unwrap();
        wait_until(Duration::from_secs(5), || !engine.is_running());
        engine.stop().unwrap();

        let batches = collect.batches.lock().unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0], vec![Some(b"{\"a\":1}".to_vec()), None]);
        assert_eq!(batches[1], vec![Some(b"{\"a\":2}".to_vec())]);
    }

    #[test]
    fn test_follow_mode_picks_up_appended_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{{\"a\":1}}").unwrap();
        file.flush().unwrap();

        let mut settings = ReplaySettings::new(file.path());
        settings.follow = true;
        settings.poll_interval = Duration::from_millis(20);
        let mut engine = ReplayEngine::new(settings);
        let collect = Arc::new(Collect::default());
        engine.start(collect.clone()).unwrap();

        wait_until(Duration::from_secs(5), || collect.batches.lock().unwrap().len() == 1);
        write!(file, "{{\"a\":").unwrap();
        file.flush().unwrap();
        thread::sleep(Duration::from_millis(100));
        writeln!(file, "2}}").unwrap();
        file.flush().unwrap();
        wait_until(Duration::from_secs(5), || collect.batches.lock().unwrap().len() == 2);

        assert!(engine.is_running());
        engine.stop().unwrap();
        assert!(!engine.is_running());

        let batches = collect.batches.lock().unwrap();
        assert_eq!(batches[1], vec![Some(b"{\"a\":2}".to_vec())]);
    }

    #[test]
    fn test_reopened_reader_resumes_after_delivered_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{{\"a\":1}}").unwrap();
        writeln!(file, "{{\"a\":2}}").unwrap();
        writeln!(file, "{{\"a\":3}}").unwrap();
        file.flush().unwrap();
        let settings = ReplaySettings::new(file.path());

        let mut first = LineReader::open(&settings, 0).unwrap();
        let values = first.read_batch(2).unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(first.offset(), 16);

        let mut reopened = LineReader::open(&settings, first.offset()).unwrap();
        assert_eq!(reopened.read_batch(10).unwrap(), vec![Some(b"{\"a\":3}".to_vec())]);
        assert_eq!(reopened.offset(), 24);
    }

    #[test]
    fn test_held_back_partial_line_is_read_again_after_reopen() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{{\"a\":1}}").unwrap();
        write!(file, "{{\"a\":").unwrap();
        file.flush().unwrap();
        let mut settings = ReplaySettings::new(file.path());
        settings.follow = true;

        let mut first = LineReader::open(&settings, 0).unwrap();
        assert_eq!(first.read_batch(10).unwrap().len(), 1);
        assert_eq!(first.offset(), 8);

        writeln!(file, "2}}").unwrap();
        file.flush().unwrap();

        let mut reopened = LineReader::open(&settings, first.offset()).unwrap();
        assert_eq!(reopened.read_batch(10).unwrap(), vec![Some(b"{\"a\":2}".to_vec())]);
    }

    #[test]
    fn test_truncated_file_is_read_from_start() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "null").unwrap();
        file.flush().unwrap();
        let settings = ReplaySettings::new(file.path());

        let mut reader = LineReader::open(&settings, 1024).unwrap();
        assert_eq!(reader.offset(), 0);
        assert_eq!(reader.read_batch(10).unwrap(), vec![None]);
    }

    #[test]
    fn test_missing_file_without_follow_ends_engine() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = ReplayEngine::new(ReplaySettings::new(dir.path().join("absent.jsonl")));

        engine.start(Arc::new(Collect::default())).unwrap();
        wait_until(Duration::from_secs(5), || !engine.is_running());

        assert!(!engine.is_running());
        assert!(engine.start(Arc::new(Collect::default())).is_err());
        engine.stop().unwrap();
    }
}
