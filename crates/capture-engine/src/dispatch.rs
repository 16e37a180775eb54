//! Hand-off of finished clips to the external analysis worker.
//!
//! Dispatch is fire-and-forget: the capture core never waits for the
//! worker and never sees its result. Source context is resolved when the
//! job is actually handed over, after the configured delay, so a link
//! copied right after the clip finished still makes it into the job.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use rewind_common::error::{RewindError, RewindResult};

use crate::context::{LinkTracker, SourceContextProvider};

/// What the analysis worker receives for one clip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub clip_path: PathBuf,
    pub source_package: String,
    /// Display name; resolved by the worker when empty.
    pub app_name: String,
    pub source_url: Option<String>,
    /// Distance from clip start to the trigger instant.
    pub trigger_offset_us: i64,
    /// Length of the written video track.
    pub duration_us: i64,
    /// RFC 3339 time of dispatch.
    pub created_at: String,
}

/// Clip facts known at finalize time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipMetadata {
    pub clip_base: String,
    pub trigger_offset_us: i64,
    pub duration_us: i64,
}

/// Destination for analysis jobs.
pub trait AnalysisSink: Send + Sync {
    fn submit(&self, request: &AnalysisRequest) -> RewindResult<()>;
}

/// Logs jobs and does nothing else.
#[derive(Debug, Default)]
pub struct LogSink;

impl AnalysisSink for LogSink {
    fn submit(&self, request: &AnalysisRequest) -> RewindResult<()> {
        tracing::info!(
            clip = %request.clip_path.display(),
            package = %request.source_package,
            url = ?request.source_url,
            trigger_offset_ms = request.trigger_offset_us / 1_000,
            "Clip ready for analysis"
        );
        Ok(())
    }
}

/// Appends jobs to a JSONL queue file, one request per line.
pub struct JsonlQueueSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonlQueueSink {
    pub fn open(path: impl Into<PathBuf>) -> RewindResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AnalysisSink for JsonlQueueSink {
    fn submit(&self, request: &AnalysisRequest) -> RewindResult<()> {
        let json = serde_json::to_string(request)?;
        let mut writer = self.writer.lock().unwrap_or_else(|p| p.into_inner());
        writeln!(writer, "{json}")
            .and_then(|_| writer.flush())
            .map_err(|e| RewindError::capture(format!("Failed to queue analysis job: {e}")))?;
        Ok(())
    }
}

/// Read back every job in a JSONL queue file.
pub fn read_queue(path: &Path) -> RewindResult<Vec<AnalysisRequest>> {
    let content = std::fs::read_to_string(path)?;
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(RewindError::from))
        .collect()
}

/// Sends finished clips to an [`AnalysisSink`] off the calling thread.
#[derive(Clone)]
pub struct AnalysisDispatcher {
    sink: Arc<dyn AnalysisSink>,
    context: Arc<dyn SourceContextProvider>,
    links: Arc<LinkTracker>,
    delay: Duration,
    link_max_age: Duration,
}

impl AnalysisDispatcher {
    pub fn new(
        sink: Arc<dyn AnalysisSink>,
        context: Arc<dyn SourceContextProvider>,
        links: Arc<LinkTracker>,
        delay: Duration,
        link_max_age: Duration,
    ) -> Self {
        Self {
            sink,
            context,
            links,
            delay,
            link_max_age,
        }
    }

    /// Queue a finished clip for analysis and return immediately.
    pub fn dispatch(&self, clip_path: PathBuf, metadata: ClipMetadata) {
        let this = self.clone();
        let spawned = std::thread::Builder::new()
            .name("rewind-dispatch".to_string())
            .spawn(move || {
                if !this.delay.is_zero() {
                    std::thread::sleep(this.delay);
                }
                let request = this.build_request(clip_path, &metadata);
                match this.sink.submit(&request) {
                    Ok(()) => tracing::info!(clip = %metadata.clip_base, "Scheduled analysis"),
                    Err(e) => tracing::error!(
                        clip = %metadata.clip_base,
                        error = %e,
                        "Failed to hand clip to analysis"
                    ),
                }
            });
        if let Err(e) = spawned {
            tracing::error!(error = %e, "Failed to spawn analysis dispatch thread");
        }
    }

    fn build_request(&self, clip_path: PathBuf, metadata: &ClipMetadata) -> AnalysisRequest {
        let context = self.context.current();
        // A freshly copied link beats whatever the app monitor saw.
        let source_url = self
            .links
            .take_fresh(self.link_max_age)
            .or(context.source_url);

        AnalysisRequest {
            clip_path,
            source_package: context
                .source_package
                .unwrap_or_else(|| "unknown".to_string()),
            app_name: String::new(),
            source_url,
            trigger_offset_us: metadata.trigger_offset_us,
            duration_us: metadata.duration_us,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{SourceContext, StaticContext};

    struct ChannelSink(Mutex<crossbeam_channel::Sender<AnalysisRequest>>);

    impl AnalysisSink for ChannelSink {
        fn submit(&self, request: &AnalysisRequest) -> RewindResult<()> {
            self.0
                .lock()
                .unwrap()
                .send(request.clone())
                .map_err(|e| RewindError::capture(e.to_string()))
        }
    }

    fn metadata() -> ClipMetadata {
        ClipMetadata {
            clip_base: "clip_20260101_000000".into(),
            trigger_offset_us: 3_000_000,
            duration_us: 5_000_000,
        }
    }

    fn dispatcher(
        context: SourceContext,
        links: Arc<LinkTracker>,
    ) -> (AnalysisDispatcher, crossbeam_channel::Receiver<AnalysisRequest>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let dispatcher = AnalysisDispatcher::new(
            Arc::new(ChannelSink(Mutex::new(tx))),
            Arc::new(StaticContext::new(context)),
            links,
            Duration::ZERO,
            Duration::from_secs(180),
        );
        (dispatcher, rx)
    }

    #[test]
    fn test_dispatch_fills_defaults() {
        let (dispatcher, rx) = dispatcher(SourceContext::default(), Arc::new(LinkTracker::new()));
        dispatcher.dispatch(PathBuf::from("/clips/a.mkv"), metadata());

        let request = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(request.clip_path, PathBuf::from("/clips/a.mkv"));
        assert_eq!(request.source_package, "unknown");
        assert_eq!(request.source_url, None);
        assert_eq!(request.trigger_offset_us, 3_000_000);
    }

    #[test]
    fn test_fresh_clipboard_link_beats_monitor_url() {
        let links = Arc::new(LinkTracker::new());
        links.observe_text("https://copied.example/v/1");
        let (dispatcher, rx) = dispatcher(
            SourceContext {
                source_package: Some("com.example.browser".into()),
                source_url: Some("https://monitor.example".into()),
            },
            links.clone(),
        );

        dispatcher.dispatch(PathBuf::from("/clips/a.mkv"), metadata());
        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first.source_url.as_deref(), Some("https://copied.example/v/1"));
        assert_eq!(first.source_package, "com.example.browser");

        // The link was consumed; the next clip falls back to the monitor.
        dispatcher.dispatch(PathBuf::from("/clips/b.mkv"), metadata());
        let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(second.source_url.as_deref(), Some("https://monitor.example"));
    }

    #[test]
    fn test_jsonl_queue_appends_one_job_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue").join("jobs.jsonl");
        let sink = JsonlQueueSink::open(&path).unwrap();
        let (dispatcher, _) = dispatcher(SourceContext::default(), Arc::new(LinkTracker::new()));

        let request = dispatcher.build_request(PathBuf::from("/clips/a.mkv"), &metadata());
        sink.submit(&request).unwrap();
        sink.submit(&request).unwrap();

        let jobs = read_queue(sink.path()).unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0], request);
    }
}
