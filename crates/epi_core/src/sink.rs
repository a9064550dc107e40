//! Output streams and in-memory result series.
//!
//! Every (result, function) pair gets an append-only stream of newline-delimited
//! decimals, and all of them share one time stream of the same length. A
//! down-sampled copy of each series is kept in memory for plotting.

use crate::error::{Result, SimulationError};
use crate::model::ModelSnapshot;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

pub const TIME_STREAM: &str = "time";

/// An append-only numeric stream.
pub trait OutputStream: Send {
    fn write_value(&mut self, value: f64) -> io::Result<()>;
    fn finish(&mut self) -> io::Result<()>;
    /// Where the stream lives, for display and later reading.
    fn location(&self) -> String;
    /// Closes the stream and deletes its contents.
    fn discard(self: Box<Self>);
}

pub trait StreamFactory: Send {
    fn open(&mut self, label: &str) -> Result<Box<dyn OutputStream>>;
}

static DEFERRED: Mutex<Vec<PathBuf>> = Mutex::new(Vec::new());

fn defer_removal(path: PathBuf) {
    DEFERRED
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(path);
}

/// Retries deletions that failed while aborting a run. Call on shutdown.
/// Returns the number of files still left behind.
pub fn purge_deferred() -> usize {
    let mut pending = DEFERRED.lock().unwrap_or_else(PoisonError::into_inner);
    pending.retain(|path| match fs::remove_file(path) {
        Ok(()) => false,
        Err(e) if e.kind() == io::ErrorKind::NotFound => false,
        Err(_) => true,
    });
    pending.len()
}

/// Writes streams as `.dat` files in a directory.
pub struct FileStreamFactory {
    dir: PathBuf,
    opened: usize,
}

impl FileStreamFactory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            opened: 0,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn sanitize(label: &str) -> String {
    label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

impl StreamFactory for FileStreamFactory {
    fn open(&mut self, label: &str) -> Result<Box<dyn OutputStream>> {
        let path = self
            .dir
            .join(format!("{:03}-{}.dat", self.opened, sanitize(label)));
        let file = File::create(&path)
            .map_err(|e| SimulationError::io(format!("creating {}", path.display()), e))?;
        self.opened += 1;
        Ok(Box::new(FileStream {
            writer: BufWriter::new(file),
            path,
        }))
    }
}

struct FileStream {
    writer: BufWriter<File>,
    path: PathBuf,
}

impl OutputStream for FileStream {
    fn write_value(&mut self, value: f64) -> io::Result<()> {
        writeln!(self.writer, "{value}")
    }

    fn finish(&mut self) -> io::Result<()> {
        self.writer.flush()
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }

    fn discard(self: Box<Self>) {
        let FileStream { writer, path } = *self;
        drop(writer);
        if let Err(e) = fs::remove_file(&path) {
            warn!(path = %path.display(), error = %e, "deferring stream removal");
            defer_removal(path);
        }
    }
}

/// Keeps streams in a shared map keyed by label; for callers without a
/// filesystem.
#[derive(Clone, Default)]
pub struct MemoryStreamFactory {
    store: Arc<Mutex<BTreeMap<String, Vec<f64>>>>,
}

impl MemoryStreamFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of every stream currently held.
    pub fn contents(&self) -> BTreeMap<String, Vec<f64>> {
        self.store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn stream(&self, key: &str) -> Option<Vec<f64>> {
        self.store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }
}

impl StreamFactory for MemoryStreamFactory {
    fn open(&mut self, label: &str) -> Result<Box<dyn OutputStream>> {
        let mut store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        let mut key = label.to_string();
        let mut n = 1;
        while store.contains_key(&key) {
            n += 1;
            key = format!("{label}#{n}");
        }
        store.insert(key.clone(), Vec::new());
        Ok(Box::new(MemoryStream {
            store: Arc::clone(&self.store),
            key,
        }))
    }
}

struct MemoryStream {
    store: Arc<Mutex<BTreeMap<String, Vec<f64>>>>,
    key: String,
}

impl OutputStream for MemoryStream {
    fn write_value(&mut self, value: f64) -> io::Result<()> {
        self.store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(self.key.clone())
            .or_default()
            .push(value);
        Ok(())
    }

    fn finish(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn location(&self) -> String {
        self.key.clone()
    }

    fn discard(self: Box<Self>) {
        self.store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSeries {
    pub name: String,
    pub color: String,
    pub weight: f32,
    /// Down-sampled `(time, value)` pairs.
    pub samples: Vec<(f64, f64)>,
    pub stream: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationResult {
    pub title: String,
    pub x_label: String,
    pub y_label: String,
    pub functions: Vec<FunctionSeries>,
    pub time_stream: Option<String>,
    /// Accepted points written to each stream, the t = 0 row included.
    pub total_points: usize,
}

impl SimulationResult {
    fn clear(&mut self) {
        self.time_stream = None;
        self.total_points = 0;
        for function in &mut self.functions {
            function.samples.clear();
            function.stream = None;
        }
    }
}

/// Keep every `cadence`-th point in memory so about `sample_target` remain.
/// Zero keeps every point.
pub fn cadence(estimated_steps: usize, sample_target: usize) -> usize {
    estimated_steps.checked_div(sample_target).unwrap_or(0)
}

/// Owns a run's output streams until it finishes or aborts.
pub struct ResultSink {
    results: Vec<SimulationResult>,
    time: Option<Box<dyn OutputStream>>,
    streams: Vec<Vec<Box<dyn OutputStream>>>,
    cadence: usize,
    points: usize,
}

impl ResultSink {
    /// Opens the time stream and one stream per output function. Streams
    /// already opened are discarded if a later one fails.
    pub fn open(
        snapshot: &ModelSnapshot,
        factory: &mut dyn StreamFactory,
        cadence: usize,
    ) -> Result<Self> {
        let mut sink = ResultSink {
            results: Vec::with_capacity(snapshot.results.len()),
            time: None,
            streams: Vec::with_capacity(snapshot.results.len()),
            cadence,
            points: 0,
        };
        match sink.open_streams(snapshot, factory) {
            Ok(()) => Ok(sink),
            Err(e) => {
                sink.abort();
                Err(e)
            }
        }
    }

    fn open_streams(&mut self, snapshot: &ModelSnapshot, factory: &mut dyn StreamFactory) -> Result<()> {
        let time = factory.open(TIME_STREAM)?;
        let time_location = time.location();
        self.time = Some(time);

        for spec in &snapshot.results {
            let mut streams = Vec::with_capacity(spec.functions.len());
            let mut functions = Vec::with_capacity(spec.functions.len());
            for function in &spec.functions {
                let stream = match factory.open(&format!("{}-{}", spec.title, function.name)) {
                    Ok(stream) => stream,
                    Err(e) => {
                        self.streams.push(streams);
                        return Err(e);
                    }
                };
                functions.push(FunctionSeries {
                    name: function.name.clone(),
                    color: function.color.clone(),
                    weight: function.weight,
                    samples: Vec::new(),
                    stream: Some(stream.location()),
                });
                streams.push(stream);
            }
            self.streams.push(streams);
            self.results.push(SimulationResult {
                title: spec.title.clone(),
                x_label: spec.x_label.clone(),
                y_label: spec.y_label.clone(),
                functions,
                time_stream: Some(time_location.clone()),
                total_points: 0,
            });
        }
        debug!(results = self.results.len(), "output streams opened");
        Ok(())
    }

    pub fn points(&self) -> usize {
        self.points
    }

    /// Appends one accepted point. `values` holds one row per result.
    pub fn record(&mut self, t: f64, values: &[Vec<f64>]) -> Result<()> {
        if let Some(time) = self.time.as_mut() {
            time.write_value(t)
                .map_err(|e| SimulationError::io(format!("writing {}", time.location()), e))?;
        }
        let keep = self.cadence == 0 || self.points % self.cadence == 0;
        for ((result, streams), row) in self.results.iter_mut().zip(&mut self.streams).zip(values) {
            for ((function, stream), &value) in result.functions.iter_mut().zip(streams).zip(row) {
                stream
                    .write_value(value)
                    .map_err(|e| SimulationError::io(format!("writing {}", stream.location()), e))?;
                if keep {
                    function.samples.push((t, value));
                }
            }
        }
        self.points += 1;
        Ok(())
    }

    /// Flushes every stream and stamps the point count on each result.
    pub fn finish(&mut self) -> Result<()> {
        let streams = self.time.iter_mut().chain(self.streams.iter_mut().flatten());
        for stream in streams {
            stream
                .finish()
                .map_err(|e| SimulationError::io(format!("flushing {}", stream.location()), e))?;
        }
        for result in &mut self.results {
            result.total_points = self.points;
        }
        Ok(())
    }

    /// Closes the streams, keeping their contents.
    pub fn into_results(self) -> Vec<SimulationResult> {
        self.results
    }

    /// Deletes every stream and returns the results emptied of samples and
    /// stream locations.
    pub fn abort(self) -> Vec<SimulationResult> {
        let ResultSink {
            mut results,
            time,
            streams,
            ..
        } = self;
        for stream in time.into_iter().chain(streams.into_iter().flatten()) {
            stream.discard();
        }
        for result in &mut results {
            result.clear();
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::age_sir;

    fn snapshot() -> ModelSnapshot {
        ModelSnapshot::assemble(age_sir()).expect("model should assemble")
    }

    #[test]
    fn cadence_divides_estimated_steps() {
        assert_eq!(cadence(1000, 1000), 1);
        assert_eq!(cadence(999, 1000), 0);
        assert_eq!(cadence(25_000, 1000), 25);
    }

    #[test]
    fn records_every_point_and_samples_by_cadence() {
        let mut factory = MemoryStreamFactory::new();
        let mut sink = ResultSink::open(&snapshot(), &mut factory, 2).expect("sink should open");
        for i in 0..5 {
            let t = i as f64;
            sink.record(t, &[vec![t, 10.0 * t, 0.0]]).expect("record should succeed");
        }
        sink.finish().expect("sink should finish");
        let results = sink.into_results();

        assert_eq!(results[0].total_points, 5);
        let samples = &results[0].functions[1].samples;
        assert_eq!(samples, &vec![(0.0, 0.0), (2.0, 20.0), (4.0, 40.0)]);
        assert_eq!(factory.stream(TIME_STREAM), Some(vec![0.0, 1.0, 2.0, 3.0, 4.0]));
        assert_eq!(
            factory.stream("SIR-infected"),
            Some(vec![0.0, 10.0, 20.0, 30.0, 40.0])
        );
    }

    #[test]
    fn file_streams_are_newline_delimited() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let mut factory = FileStreamFactory::new(dir.path());
        let mut sink = ResultSink::open(&snapshot(), &mut factory, 0).expect("sink should open");
        sink.record(0.0, &[vec![990.0, 10.0, 0.0]]).expect("record should succeed");
        sink.record(0.5, &[vec![989.5, 10.25, 0.25]]).expect("record should succeed");
        sink.finish().expect("sink should finish");
        let results = sink.into_results();

        let time = results[0].time_stream.as_ref().expect("time stream location");
        assert_eq!(fs::read_to_string(time).expect("time stream"), "0\n0.5\n");
        let infected = results[0].functions[1].stream.as_ref().expect("stream location");
        assert!(infected.ends_with("002-SIR-infected.dat"));
        assert_eq!(fs::read_to_string(infected).expect("stream"), "10\n10.25\n");
    }

    #[test]
    fn abort_removes_streams_and_clears_results() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let mut factory = FileStreamFactory::new(dir.path());
        let mut sink = ResultSink::open(&snapshot(), &mut factory, 0).expect("sink should open");
        sink.record(0.0, &[vec![1.0, 2.0, 3.0]]).expect("record should succeed");
        let results = sink.abort();

        assert_eq!(fs::read_dir(dir.path()).expect("dir").count(), 0);
        assert!(results[0].functions.iter().all(|f| f.samples.is_empty()));
        assert!(results[0].time_stream.is_none());
        assert_eq!(purge_deferred(), 0);
    }

    #[test]
    fn open_failure_reports_io_error() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let mut factory = FileStreamFactory::new(dir.path().join("missing"));
        let err = ResultSink::open(&snapshot(), &mut factory, 0)
            .err()
            .expect("open should fail");
        assert!(matches!(err, SimulationError::Io { .. }));
        assert!(err.to_string().contains("creating"));
    }
}
