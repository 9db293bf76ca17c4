//! Pretrained waveform models used by the in-process backend.

use anyhow::Result;
use ndarray::{Array3, ArrayView2};
use std::path::Path;

/// A waveform-to-stems model.
///
/// Takes a normalized `[channels, frames]` segment and returns `[stems, channels, frames]`.
/// Instances are not assumed to be safe for concurrent use; `&mut self` makes every inference
/// exclusive to the caller holding the instance.
pub trait WaveformModel: Send {
    fn infer(&mut self, segment: ArrayView2<f32>) -> Result<Array3<f32>>;
}

/// Load one model instance from `path`.
#[cfg(feature = "onnx")]
pub fn load_model(path: &Path) -> Result<Box<dyn WaveformModel>> {
    Ok(Box::new(onnx::OnnxModel::load(path)?))
}

/// Load one model instance from `path`.
#[cfg(not(feature = "onnx"))]
pub fn load_model(path: &Path) -> Result<Box<dyn WaveformModel>> {
    anyhow::bail!(
        "Cannot load {:?}: splitter was built without the `onnx` feature required by the demucs engine",
        path
    )
}

#[cfg(feature = "onnx")]
mod onnx {
    use super::WaveformModel;
    use anyhow::{Context, Result, anyhow};
    use ndarray::{Array3, ArrayView2};
    use ort::session::{Session, builder::GraphOptimizationLevel};
    use ort::value::Tensor;
    use std::path::Path;

    /// ONNX export of a waveform model: input `[1, channels, frames]`, first output
    /// `[1, stems, channels, frames]`.
    pub struct OnnxModel {
        session: Session,
    }

    impl OnnxModel {
        pub fn load(path: &Path) -> Result<Self> {
            let session = Session::builder()?
                .with_optimization_level(GraphOptimizationLevel::Level3)?
                .commit_from_file(path)
                .with_context(|| format!("Failed to load ONNX model from {:?}", path))?;

            Ok(Self { session })
        }
    }

    impl WaveformModel for OnnxModel {
        fn infer(&mut self, segment: ArrayView2<f32>) -> Result<Array3<f32>> {
            let (channels, frames) = segment.dim();
            let data: Vec<f32> = segment.iter().copied().collect();
            let input = Tensor::from_array((vec![1, channels, frames], data)).context("input tensor")?;

            let outputs = self.session.run(ort::inputs![input])?;
            let (_, output) = outputs.iter().next().ok_or_else(|| anyhow!("Model returned no outputs"))?;
            let (shape, values) = output.try_extract_tensor::<f32>()?;

            let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
            match dims[..] {
                [1, stems, out_channels, out_frames] => {
                    Ok(Array3::from_shape_vec((stems, out_channels, out_frames), values.to_vec())?)
                }
                _ => Err(anyhow!("Unexpected model output shape {:?}", dims)),
            }
        }
    }
}
