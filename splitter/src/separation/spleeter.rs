//! Spleeter subprocess backend.

use super::{Separator, Stem};
use crate::config::SpleeterPreset;
use crate::errors::{Error, Result, SPLEETER_FAILED_MESSAGE};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, error, instrument};

impl SpleeterPreset {
    /// Value passed to `-p spleeter:<preset>`
    pub fn as_str(&self) -> &'static str {
        match self {
            SpleeterPreset::TwoStems => "2stems",
            SpleeterPreset::FourStems => "4stems",
            SpleeterPreset::FiveStems => "5stems",
        }
    }

    /// Stems the preset writes, in spleeter's output naming
    pub fn stems(&self) -> &'static [&'static str] {
        match self {
            SpleeterPreset::TwoStems => &["vocals", "accompaniment"],
            SpleeterPreset::FourStems => &["vocals", "drums", "bass", "other"],
            SpleeterPreset::FiveStems => &["vocals", "drums", "bass", "piano", "other"],
        }
    }
}

/// Runs `spleeter separate -p spleeter:<preset> -o <output_dir> <input>`.
///
/// Spleeter writes `<output_dir>/<input file stem>/<stem>.wav`. The child is awaited without
/// blocking the runtime and is killed if the request future is dropped.
pub struct SpleeterSeparator {
    binary: PathBuf,
    preset: SpleeterPreset,
}

impl SpleeterSeparator {
    pub fn new(binary: PathBuf, preset: SpleeterPreset) -> Self {
        Self { binary, preset }
    }

    fn command(&self, input: &Path, output_dir: &Path) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .arg("separate")
            .arg("-p")
            .arg(format!("spleeter:{}", self.preset.as_str()))
            .arg("-o")
            .arg(output_dir)
            .arg(input)
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl Separator for SpleeterSeparator {
    #[instrument(skip(self), err)]
    async fn separate(&self, input: &Path, output_dir: &Path) -> Result<Vec<Stem>> {
        let output = self.command(input, output_dir).output().await.map_err(|e| Error::Separation {
            message: format!("Failed to run {}: {e}", self.binary.display()),
        })?;

        if !output.status.success() {
            error!(
                status = %output.status,
                stderr = %String::from_utf8_lossy(&output.stderr),
                "spleeter exited unsuccessfully"
            );
            return Err(Error::Separation {
                message: SPLEETER_FAILED_MESSAGE.to_string(),
            });
        }
        debug!(stdout = %String::from_utf8_lossy(&output.stdout), "spleeter finished");

        let track_dir = output_dir.join(input.file_stem().unwrap_or_default());

        self.preset
            .stems()
            .iter()
            .map(|name| {
                let path = track_dir.join(format!("{name}.wav"));
                if path.is_file() {
                    Ok(Stem {
                        name: name.to_string(),
                        path,
                    })
                } else {
                    Err(Error::Separation {
                        message: format!("spleeter did not produce {}", path.display()),
                    })
                }
            })
            .collect()
    }

    fn stems(&self) -> Vec<String> {
        self.preset.stems().iter().map(|s| s.to_string()).collect()
    }

    fn name(&self) -> &'static str {
        "spleeter"
    }
}
