//! Test utilities: fake separation backends, WAV fixtures and a fully wired test application.

use crate::config::{Config, StorageBackend};
use crate::errors::{Error, Result};
use crate::separation::model::WaveformModel;
use crate::separation::{Separator, Stem};
use async_trait::async_trait;
use axum_test::TestServer;
use hound::{SampleFormat, WavSpec, WavWriter};
use ndarray::{Array3, ArrayView2};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Separator that writes short tone WAVs instead of running a real engine.
pub struct FakeSeparator {
    stems: Vec<String>,
    delay: Duration,
    failure: Option<String>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeSeparator {
    pub fn new(stems: &[&str]) -> Self {
        Self {
            stems: stems.iter().map(|s| s.to_string()).collect(),
            delay: Duration::ZERO,
            failure: None,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// The `2stems` layout: vocals and accompaniment.
    pub fn two_stems() -> Self {
        Self::new(&["vocals", "accompaniment"])
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail every separation with `message`.
    pub fn failing(mut self, message: &str) -> Self {
        self.failure = Some(message.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of separations observed running at the same time
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Separator for FakeSeparator {
    async fn separate(&self, _input: &Path, output_dir: &Path) -> Result<Vec<Stem>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if let Some(message) = &self.failure {
            return Err(Error::Separation { message: message.clone() });
        }

        Ok(self
            .stems
            .iter()
            .map(|name| {
                let path = output_dir.join(format!("{name}.wav"));
                write_test_wav(&path, 2, 8_000, 800);
                Stem { name: name.clone(), path }
            })
            .collect())
    }

    fn stems(&self) -> Vec<String> {
        self.stems.clone()
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

/// Model returning `segment * gains[k]` for each stem `k`, recording what it was fed.
pub struct GainModel {
    gains: Vec<f32>,
    pub calls: usize,
    pub segment_lengths: Vec<usize>,
}

impl GainModel {
    pub fn new(gains: Vec<f32>) -> Self {
        Self {
            gains,
            calls: 0,
            segment_lengths: Vec::new(),
        }
    }
}

impl WaveformModel for GainModel {
    fn infer(&mut self, segment: ArrayView2<f32>) -> anyhow::Result<Array3<f32>> {
        self.calls += 1;
        self.segment_lengths.push(segment.ncols());

        let (channels, frames) = segment.dim();
        Ok(Array3::from_shape_fn((self.gains.len(), channels, frames), |(stem, ch, i)| {
            segment[[ch, i]] * self.gains[stem]
        }))
    }
}

/// Counts inference calls shared by several [`SlowModel`]s.
#[derive(Default)]
pub struct InferenceTracker {
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl InferenceTracker {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of inferences observed running at the same time
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

/// Identity model that blocks its thread for `delay` on every call.
pub struct SlowModel {
    delay: Duration,
    tracker: Arc<InferenceTracker>,
}

impl SlowModel {
    pub fn new(delay: Duration, tracker: Arc<InferenceTracker>) -> Self {
        Self { delay, tracker }
    }
}

impl WaveformModel for SlowModel {
    fn infer(&mut self, segment: ArrayView2<f32>) -> anyhow::Result<Array3<f32>> {
        self.tracker.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.tracker.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.tracker.in_flight);
        self.tracker.max_in_flight.fetch_max(now, Ordering::SeqCst);

        std::thread::sleep(self.delay);
        Ok(segment.to_owned().insert_axis(ndarray::Axis(0)))
    }
}

/// Write a 16-bit WAV holding a 440 Hz tone.
pub fn write_test_wav(path: &Path, channels: u16, sample_rate: u32, frames: usize) {
    let spec = WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(path, spec).expect("Failed to create test WAV");
    for i in 0..frames {
        let t = i as f32 / sample_rate as f32;
        let sample = ((t * 440.0 * std::f32::consts::TAU).sin() * 0.5 * i16::MAX as f32) as i16;
        for _ in 0..channels {
            writer.write_sample(sample).expect("Failed to write test sample");
        }
    }
    writer.finalize().expect("Failed to finalize test WAV");
}

/// Test configuration: local object store and working directories below `root`.
pub fn create_test_config(root: &Path) -> Config {
    let mut config = Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        work_dir: Some(root.join("work")),
        ..Default::default()
    };
    config.storage.backend = StorageBackend::Local;
    config.storage.local_root = root.join("objects");
    config.storage.public_base_url = "http://localhost:8000/objects".to_string();
    config.storage.create_bucket = true;
    config
}

/// A running application plus the mock host serving its source audio.
pub struct TestApp {
    pub server: TestServer,
    pub source: MockServer,
    pub separator: Arc<FakeSeparator>,
    pub root: TempDir,
}

impl TestApp {
    /// Serve some audio bytes at `path` on the source host, returning its URL.
    pub async fn mount_source(&self, audio_path: &str) -> String {
        Mock::given(method("GET"))
            .and(path(audio_path))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ID3-not-really-audio".to_vec()))
            .mount(&self.source)
            .await;
        format!("{}{}", self.source.uri(), audio_path)
    }

    pub fn work_dir(&self) -> PathBuf {
        self.root.path().join("work")
    }

    /// Directory holding the configured bucket's objects
    pub fn bucket_dir(&self) -> PathBuf {
        self.root.path().join("objects").join("processed")
    }

    /// Names of the entries currently in `dir`, sorted.
    pub fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .expect("Failed to list directory")
            .map(|entry| entry.expect("Failed to read entry").file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

pub async fn create_test_app() -> TestApp {
    create_test_app_with(FakeSeparator::two_stems(), |_| {}).await
}

/// Build a test application around `separator`, letting the caller adjust the config first.
pub async fn create_test_app_with(separator: FakeSeparator, configure: impl FnOnce(&mut Config)) -> TestApp {
    let root = tempfile::tempdir().expect("Failed to create test root");
    let source = MockServer::start().await;

    let mut config = create_test_config(root.path());
    configure(&mut config);
    if let Some(work_dir) = &config.work_dir {
        std::fs::create_dir_all(work_dir).expect("Failed to create work dir");
    }

    let separator = Arc::new(separator);
    let app = crate::Application::new_with_separator(config, separator.clone())
        .await
        .expect("Failed to create application");

    TestApp {
        server: app.into_test_server(),
        source,
        separator,
        root,
    }
}
