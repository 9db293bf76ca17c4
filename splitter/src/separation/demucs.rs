//! In-process separation with a pretrained Demucs-style waveform model.
//!
//! The waveform is decoded, conformed to stereo at the model's sample rate, normalized by the
//! mean and standard deviation of its mono mix, separated segment by segment with linear
//! cross-fades, de-normalized and written out as one WAV per stem.
//!
//! Model instances live in a [`ModelPool`]. Each inference checks an instance out exclusively and
//! runs on the blocking thread pool, so the async executor keeps serving other requests. A caller
//! that stops waiting flags the job, which then ends at the next segment boundary and writes
//! nothing; its concurrency slot is held until then.

use super::model::WaveformModel;
use super::{SeparationSlot, Separator, Stem};
use crate::audio;
use crate::errors::{Error, Result};
use anyhow::anyhow;
use async_trait::async_trait;
use ndarray::{Array1, Array2, Array3, ArrayView2, Axis, s};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, instrument};

/// Floor applied to the standard deviation so silent input does not divide by zero.
const MIN_STD: f32 = 1e-8;

/// Stereo models only.
const MODEL_CHANNELS: usize = 2;

/// Fixed pool of model instances, each handed out to one caller at a time.
pub struct ModelPool {
    idle: Mutex<Vec<Box<dyn WaveformModel>>>,
    available: Arc<Semaphore>,
}

impl ModelPool {
    pub fn new(models: Vec<Box<dyn WaveformModel>>) -> Self {
        let available = Arc::new(Semaphore::new(models.len()));
        Self {
            idle: Mutex::new(models),
            available,
        }
    }

    /// Wait for a free instance and take exclusive ownership of it until the guard drops.
    pub async fn checkout(self: &Arc<Self>) -> anyhow::Result<PooledModel> {
        let permit = self.available.clone().acquire_owned().await?;
        let model = self
            .idle
            .lock()
            .map_err(|_| anyhow!("Model pool poisoned"))?
            .pop()
            .ok_or_else(|| anyhow!("Model pool permit granted with no idle instance"))?;

        Ok(PooledModel {
            pool: self.clone(),
            model: Some(model),
            _permit: permit,
        })
    }
}

/// A checked-out model instance; returned to its pool on drop.
pub struct PooledModel {
    pool: Arc<ModelPool>,
    model: Option<Box<dyn WaveformModel>>,
    // Released after the model is back in the idle list (fields drop after `Drop::drop`)
    _permit: OwnedSemaphorePermit,
}

impl PooledModel {
    fn model(&mut self) -> anyhow::Result<&mut dyn WaveformModel> {
        match self.model.as_deref_mut() {
            Some(model) => Ok(model),
            None => Err(anyhow!("Model already returned to the pool")),
        }
    }
}

impl Drop for PooledModel {
    fn drop(&mut self) {
        if let Some(model) = self.model.take()
            && let Ok(mut idle) = self.pool.idle.lock()
        {
            idle.push(model);
        }
    }
}

/// Scalar normalization taken from the mono mix of a waveform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalization {
    pub mean: f32,
    pub std: f32,
}

impl Normalization {
    /// Center `wav` on the mean of its mono mix and scale by the mix's standard deviation.
    pub fn apply(wav: &mut Array2<f32>) -> Self {
        let reference = wav.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(0));
        let n = reference.len();

        let mean = if n == 0 { 0.0 } else { reference.sum() / n as f32 };
        let variance = if n > 1 {
            reference.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / (n - 1) as f32
        } else {
            0.0
        };
        let std = variance.sqrt().max(MIN_STD);

        wav.mapv_inplace(|x| (x - mean) / std);
        Self { mean, std }
    }

    /// Inverse of [`Normalization::apply`] on separated sources.
    pub fn invert(&self, sources: &mut Array3<f32>) {
        let Self { mean, std } = *self;
        sources.mapv_inplace(|x| x * std + mean);
    }
}

/// Run `model` over `wav` (`[channels, frames]`), returning `[stems, channels, frames]`.
///
/// With a segment length the waveform is cut into segments of exactly that length (the last one
/// zero padded) whose starts are `segment * (1 - overlap)` apart. Each segment's output is
/// weighted by a trapezoid that ramps over the overlap region and the weighted sum is divided by
/// the total weight, so every frame is a convex blend of the segments covering it.
///
/// Fails between segments once `abort` is set.
pub fn separate_waveform(
    model: &mut dyn WaveformModel,
    wav: ArrayView2<f32>,
    stems: usize,
    segment_samples: Option<usize>,
    overlap: f32,
    abort: &AtomicBool,
) -> anyhow::Result<Array3<f32>> {
    let (channels, frames) = wav.dim();
    let segment = segment_samples.unwrap_or(frames).max(1);
    let ramp = (segment as f32 * overlap) as usize;
    let stride = (segment - ramp).max(1);

    let weights = Array1::from_shape_fn(segment, |i| {
        if ramp == 0 {
            1.0
        } else {
            let rise = (i + 1) as f32 / ramp as f32;
            let fall = (segment - i) as f32 / ramp as f32;
            rise.min(fall).min(1.0)
        }
    });

    let mut output = Array3::<f32>::zeros((stems, channels, frames));
    let mut total_weight = Array1::<f32>::zeros(frames);

    let mut offset = 0;
    loop {
        if abort.load(Ordering::Relaxed) {
            return Err(anyhow!("Separation abandoned"));
        }
        let end = (offset + segment).min(frames);
        let valid = end - offset;

        let mut chunk = Array2::<f32>::zeros((channels, segment));
        chunk.slice_mut(s![.., ..valid]).assign(&wav.slice(s![.., offset..end]));

        let separated = model.infer(chunk.view())?;
        if separated.dim() != (stems, channels, segment) {
            return Err(anyhow!(
                "Model returned shape {:?}, expected {:?}",
                separated.dim(),
                (stems, channels, segment)
            ));
        }

        let w = weights.slice(s![..valid]);
        let contribution = &separated.slice(s![.., .., ..valid]) * &w;
        let mut target = output.slice_mut(s![.., .., offset..end]);
        target += &contribution;
        let mut target_weight = total_weight.slice_mut(s![offset..end]);
        target_weight += &w;

        if end >= frames {
            break;
        }
        offset += stride;
    }

    output /= &total_weight;
    Ok(output)
}

/// Settings for the in-process backend.
#[derive(Debug, Clone)]
pub struct DemucsParams {
    /// Stem names in the order of the model's output dimension
    pub stems: Vec<String>,
    pub sample_rate: u32,
    pub segment_samples: Option<usize>,
    pub overlap: f32,
}

/// Decode, separate and write one file with a checked-out model.
fn separate_file(
    model: &mut dyn WaveformModel,
    input: &Path,
    output_dir: &Path,
    params: &DemucsParams,
    abort: &AtomicBool,
) -> anyhow::Result<Vec<Stem>> {
    let decoded = audio::read_audio(input)?;
    let stereo = audio::conform_channels(decoded.to_planar(), MODEL_CHANNELS)?;
    let mut wav = audio::resample(stereo.view(), decoded.sample_rate, params.sample_rate)?;

    if wav.ncols() == 0 {
        return Err(anyhow!("Input audio is empty"));
    }

    let normalization = Normalization::apply(&mut wav);
    debug!(?normalization, frames = wav.ncols(), "Normalized input");

    let mut sources = separate_waveform(
        model,
        wav.view(),
        params.stems.len(),
        params.segment_samples,
        params.overlap,
        abort,
    )?;
    if abort.load(Ordering::Relaxed) {
        return Err(anyhow!("Separation abandoned"));
    }
    normalization.invert(&mut sources);

    params
        .stems
        .iter()
        .enumerate()
        .map(|(idx, name)| {
            let path = output_dir.join(format!("{name}.wav"));
            audio::write_wav(&path, sources.index_axis(Axis(0), idx), params.sample_rate)?;
            Ok(Stem {
                name: name.clone(),
                path,
            })
        })
        .collect()
}

/// Sets the flag when the awaiting future goes away. Setting it after the job ended is a no-op.
struct AbortOnDrop(Arc<AtomicBool>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// In-process separator backed by a [`ModelPool`].
pub struct DemucsSeparator {
    pool: Arc<ModelPool>,
    params: Arc<DemucsParams>,
}

impl DemucsSeparator {
    pub fn new(models: Vec<Box<dyn WaveformModel>>, params: DemucsParams) -> Self {
        Self {
            pool: Arc::new(ModelPool::new(models)),
            params: Arc::new(params),
        }
    }
}

#[async_trait]
impl Separator for DemucsSeparator {
    async fn separate(&self, input: &Path, output_dir: &Path) -> Result<Vec<Stem>> {
        self.separate_in_slot(input, output_dir, SeparationSlot::unbounded()).await
    }

    #[instrument(skip(self, slot), err)]
    async fn separate_in_slot(&self, input: &Path, output_dir: &Path, slot: SeparationSlot) -> Result<Vec<Stem>> {
        let mut model = self.pool.checkout().await?;
        let params = self.params.clone();
        let (input, output_dir): (PathBuf, PathBuf) = (input.to_path_buf(), output_dir.to_path_buf());
        let abort = Arc::new(AtomicBool::new(false));
        let _abort_on_drop = AbortOnDrop(abort.clone());

        tokio::task::spawn_blocking(move || {
            let _slot = slot;
            separate_file(model.model()?, &input, &output_dir, &params, &abort)
        })
        .await
        .map_err(|e| Error::Other(anyhow!("Separation task failed: {e}")))?
        .map_err(|e| Error::Separation {
            message: format!("{e:#}"),
        })
    }

    fn stems(&self) -> Vec<String> {
        self.params.stems.clone()
    }

    fn name(&self) -> &'static str {
        "demucs"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{GainModel, write_test_wav};
    use ndarray::Array2;
    use std::time::Duration;

    fn sine(channels: usize, frames: usize) -> Array2<f32> {
        Array2::from_shape_fn((channels, frames), |(ch, i)| 0.3 + 0.5 * ((i as f32) * 0.05 + ch as f32).sin())
    }

    #[test]
    fn test_normalization_roundtrip_and_statistics() {
        let original = sine(2, 1000);
        let mut wav = original.clone();

        let norm = Normalization::apply(&mut wav);
        let mix = wav.mean_axis(Axis(0)).unwrap();
        assert!(mix.mean().unwrap().abs() < 1e-4);
        assert!((mix.std(1.0) - 1.0).abs() < 1e-3);

        let mut sources = wav.clone().insert_axis(Axis(0));
        norm.invert(&mut sources);
        for (a, b) in sources.iter().zip(original.iter()) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn test_normalization_of_silence_is_finite() {
        let mut wav = Array2::<f32>::zeros((2, 64));
        let norm = Normalization::apply(&mut wav);
        assert_eq!(norm.mean, 0.0);
        assert_eq!(norm.std, MIN_STD);
        assert!(wav.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn test_separate_waveform_whole_track() {
        let wav = sine(2, 500);
        let mut model = GainModel::new(vec![0.25, 0.75]);

        let out = separate_waveform(&mut model, wav.view(), 2, None, 0.25, &AtomicBool::new(false)).unwrap();

        assert_eq!(out.dim(), (2, 2, 500));
        for ((stem, ch, i), value) in out.indexed_iter() {
            let expected = wav[[ch, i]] * [0.25, 0.75][stem];
            assert!((value - expected).abs() < 1e-5);
        }
        assert_eq!(model.calls, 1);
    }

    #[test]
    fn test_separate_waveform_segments_with_overlap() {
        let wav = sine(2, 1000);
        let mut model = GainModel::new(vec![1.0]);

        let out = separate_waveform(&mut model, wav.view(), 1, Some(256), 0.25, &AtomicBool::new(false)).unwrap();

        // Overlap-add of an identity model reconstructs the input exactly
        assert_eq!(out.dim(), (1, 2, 1000));
        for ((_, ch, i), value) in out.indexed_iter() {
            assert!((value - wav[[ch, i]]).abs() < 1e-4, "frame {i}");
        }
        // stride 192: offsets 0, 192, ..., 768 (768 + 256 >= 1000)
        assert_eq!(model.calls, 5);
        assert!(model.segment_lengths.iter().all(|&len| len == 256));
    }

    #[test]
    fn test_separate_waveform_pads_short_input_to_segment() {
        let wav = sine(2, 100);
        let mut model = GainModel::new(vec![1.0, 0.0]);

        let out = separate_waveform(&mut model, wav.view(), 2, Some(256), 0.25, &AtomicBool::new(false)).unwrap();

        assert_eq!(out.dim(), (2, 2, 100));
        assert_eq!(model.segment_lengths, vec![256]);
    }

    #[test]
    fn test_separate_waveform_rejects_wrong_stem_count() {
        let wav = sine(2, 100);
        let mut model = GainModel::new(vec![1.0, 1.0, 1.0]);

        assert!(separate_waveform(&mut model, wav.view(), 4, None, 0.0, &AtomicBool::new(false)).is_err());
    }

    #[tokio::test]
    async fn test_demucs_separator_writes_configured_stems() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.wav");
        write_test_wav(&input, 1, 22_050, 4_410);

        let params = DemucsParams {
            stems: vec!["drums".into(), "bass".into(), "other".into(), "vocals".into()],
            sample_rate: 44_100,
            segment_samples: Some(4096),
            overlap: 0.25,
        };
        let separator = DemucsSeparator::new(vec![Box::new(GainModel::new(vec![0.1, 0.2, 0.3, 0.4]))], params);

        let stems = separator.separate(&input, dir.path()).await.unwrap();

        let names: Vec<_> = stems.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["drums", "bass", "other", "vocals"]);
        for stem in &stems {
            let decoded = audio::read_audio(&stem.path).unwrap();
            // Output format comes from the model configuration, not the input
            assert_eq!(decoded.sample_rate, 44_100);
            assert_eq!(decoded.channels, 2);
        }
    }

    #[tokio::test]
    async fn test_demucs_separator_undecodable_input_is_separation_error() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.mp3");
        std::fs::write(&input, b"<html>not audio</html>").unwrap();

        let params = DemucsParams {
            stems: vec!["vocals".into()],
            sample_rate: 44_100,
            segment_samples: None,
            overlap: 0.0,
        };
        let separator = DemucsSeparator::new(vec![Box::new(GainModel::new(vec![1.0]))], params);

        let err = separator.separate(&input, dir.path()).await.unwrap_err();
        assert!(matches!(err, Error::Separation { .. }));
    }

    #[tokio::test]
    async fn test_model_pool_checkout_is_exclusive() {
        let pool = Arc::new(ModelPool::new(vec![Box::new(GainModel::new(vec![1.0]))]));

        let first = pool.checkout().await.unwrap();
        let waiting = tokio::time::timeout(Duration::from_millis(50), pool.checkout()).await;
        assert!(waiting.is_err(), "second checkout should wait for the only instance");

        drop(first);
        let second = tokio::time::timeout(Duration::from_millis(500), pool.checkout()).await;
        assert!(second.is_ok());
    }

    #[test]
    fn test_separate_waveform_stops_when_abandoned() {
        let wav = sine(2, 1000);
        let mut model = GainModel::new(vec![1.0]);

        let result = separate_waveform(&mut model, wav.view(), 1, Some(256), 0.25, &AtomicBool::new(true));

        assert!(result.is_err());
        assert_eq!(model.calls, 0);
    }
}
