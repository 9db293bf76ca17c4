//! Audio decoding, channel/sample-rate conforming and WAV encoding for in-process separation.

use anyhow::{Context, Result, anyhow};
use hound::{SampleFormat, WavSpec, WavWriter};
use ndarray::{Array2, ArrayView2};
use rubato::{Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction};
use std::{fs::File, path::Path};
use symphonia::core::{
    audio::SampleBuffer, codecs::DecoderOptions, errors::Error as SymphoniaError, formats::FormatOptions, io::MediaSourceStream,
    meta::MetadataOptions, probe::Hint,
};
use symphonia::default::{get_codecs, get_probe};
use tracing::debug;

/// Decoded audio as interleaved `f32` samples.
#[derive(Clone, Debug)]
pub struct AudioData {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioData {
    /// Number of samples per channel.
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels as usize
        }
    }

    /// Planar `[channels, frames]` view of the interleaved samples.
    pub fn to_planar(&self) -> Array2<f32> {
        let channels = self.channels as usize;
        let frames = self.frames();
        Array2::from_shape_fn((channels, frames), |(ch, i)| self.samples[i * channels + ch])
    }
}

/// Decode any container/codec symphonia knows into interleaved `f32` samples.
pub fn read_audio<P: AsRef<Path>>(path: P) -> Result<AudioData> {
    let path: &Path = path.as_ref();

    let file = File::open(path).with_context(|| format!("Failed to open audio file: {:?}", path))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .context("Unrecognised audio format")?;

    let mut format = probed.format;
    let track = format.default_track().context("No default track found")?;
    let track_id = track.id;

    let mut decoder = get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .context("Unsupported audio codec")?;

    let mut samples: Vec<f32> = Vec::new();
    let mut sample_rate: u32 = track.codec_params.sample_rate.unwrap_or(0);
    let mut channels: u16 = track.codec_params.channels.map(|c| c.count() as u16).unwrap_or(0);

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e).context("Failed to read audio packet"),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            // Corrupt frames are skipped rather than failing the whole track
            Err(SymphoniaError::DecodeError(e)) => {
                debug!("Skipping undecodable packet: {}", e);
                continue;
            }
            Err(e) => return Err(e).context("Failed to decode audio"),
        };

        sample_rate = decoded.spec().rate;
        channels = decoded.spec().channels.count() as u16;

        let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, *decoded.spec());
        buffer.copy_interleaved_ref(decoded);
        samples.extend_from_slice(buffer.samples());
    }

    if channels == 0 || sample_rate == 0 || samples.is_empty() {
        return Err(anyhow!("Audio file contains no samples: {:?}", path));
    }

    debug!(sample_rate, channels, samples = samples.len(), "Read audio");

    Ok(AudioData {
        samples,
        sample_rate,
        channels,
    })
}

/// Conform a planar waveform to `channels`: mono is duplicated, extra channels are dropped.
pub fn conform_channels(audio: Array2<f32>, channels: usize) -> Result<Array2<f32>> {
    let (have, frames) = audio.dim();
    if have == channels {
        return Ok(audio);
    }
    if have == 0 {
        return Err(anyhow!("Audio has no channels"));
    }
    Ok(Array2::from_shape_fn((channels, frames), |(ch, i)| audio[[ch.min(have - 1), i]]))
}

/// Resample a planar waveform with a windowed-sinc interpolator.
pub fn resample(audio: ArrayView2<f32>, from_rate: u32, to_rate: u32) -> Result<Array2<f32>> {
    if from_rate == to_rate {
        return Ok(audio.to_owned());
    }

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let (channels, frames) = audio.dim();
    let ratio = to_rate as f64 / from_rate as f64;
    let mut resampler =
        SincFixedIn::<f32>::new(ratio, 2.0, params, frames, channels).context("Failed to build resampler")?;

    let input: Vec<Vec<f32>> = audio.rows().into_iter().map(|row| row.to_vec()).collect();
    let mut output = resampler.process(&input, None).context("Resampling failed")?;

    // The sinc filter still holds the last frames; drain them with an empty final chunk
    let tail = resampler
        .process_partial(None::<&[Vec<f32>]>, None)
        .context("Resampling failed")?;
    for (channel, rest) in output.iter_mut().zip(tail) {
        channel.extend(rest);
    }

    let out_frames = (frames as f64 * ratio).ceil() as usize;
    Ok(Array2::from_shape_fn((channels, out_frames), |(ch, i)| {
        output[ch].get(i).copied().unwrap_or(0.0)
    }))
}

/// Write a planar waveform as 16-bit PCM WAV.
pub fn write_wav(path: &Path, audio: ArrayView2<f32>, sample_rate: u32) -> Result<()> {
    let (channels, frames) = audio.dim();
    let spec = WavSpec {
        channels: channels as u16,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut writer = WavWriter::create(path, spec).with_context(|| format!("Failed to create {:?}", path))?;
    for i in 0..frames {
        for ch in 0..channels {
            let s = (audio[[ch, i]] * i16::MAX as f32).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            writer.write_sample(s)?;
        }
    }
    writer.finalize()?;
    Ok(())
}
