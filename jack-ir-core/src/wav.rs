use std::{
    fs,
    io::{self},
    path::{Path, PathBuf},
};

use thiserror::Error;

pub const MAX_CHANNELS: usize = 4;

#[derive(Error, Debug)]
pub enum WriteError {
    #[error("{0} channels can not be written, at most 4 are supported")]
    TooManyChannels(usize),
    #[error("nothing to write")]
    Empty,
    #[error("channels differ in length")]
    LengthMismatch,
    #[error("writing '{}' failed: {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },
    #[error("writing '{}' failed: {source}", .path.display())]
    Wav { path: PathBuf, source: hound::Error },
}

/// Writes the channels as an interleaved 32 bit float wav file.
///
/// The data goes to a hidden scratch file next to `path` first, which is only
/// renamed to `path` once everything was written. On failure the scratch file
/// is removed, so `path` either holds the complete result or is untouched.
pub fn write_channels(
    path: impl AsRef<Path>,
    sample_rate: u32,
    channels: &[&[f32]],
) -> Result<(), WriteError> {
    let path = path.as_ref();

    let n_frames = match channels.first() {
        Some(first) => first.len(),
        None => return Err(WriteError::Empty),
    };

    if channels.len() > MAX_CHANNELS {
        return Err(WriteError::TooManyChannels(channels.len()));
    }

    if channels.iter().any(|c| c.len() != n_frames) {
        return Err(WriteError::LengthMismatch);
    }

    let scratch = scratch_path(path);
    let result = write_interleaved(&scratch, sample_rate, channels, n_frames).and_then(|_| {
        fs::rename(&scratch, path).map_err(|source| WriteError::Io {
            path: path.to_path_buf(),
            source,
        })
    });

    if result.is_err() {
        let _ = fs::remove_file(&scratch);
    }

    result
}

fn write_interleaved(
    scratch: &Path,
    sample_rate: u32,
    channels: &[&[f32]],
    n_frames: usize,
) -> Result<(), WriteError> {
    let map_hound_error = |source| WriteError::Wav {
        path: scratch.to_path_buf(),
        source,
    };

    let spec = hound::WavSpec {
        channels: channels.len() as u16,
        sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };

    let mut writer = hound::WavWriter::create(scratch, spec).map_err(map_hound_error)?;

    for frame in 0..n_frames {
        for channel in channels {
            writer
                .write_sample(channel[frame])
                .map_err(map_hound_error)?;
        }
    }

    writer.finalize().map_err(map_hound_error)?;

    Ok(())
}

fn scratch_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    path.with_file_name(format!(".{file_name}.part"))
}
