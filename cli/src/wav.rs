use std::fs::File;
use std::path::Path;

use hound::{SampleFormat, WavSpec};

use crate::CliError;

/// Write mono samples as 16-bit PCM.
pub fn write_mono(path: &Path, sample_rate: u32, samples: &[f32]) -> Result<(), CliError> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let file = File::create(path)?;
    let mut writer = hound::WavWriter::new(file, spec)?;
    for &sample in samples {
        writer.write_sample((sample.clamp(-1.0, 1.0) * 32767.0) as i16)?;
    }
    writer.finalize()?;
    Ok(())
}

/// Read a WAV file as mono f32. Multi-channel files keep the first channel.
pub fn read_mono(path: &Path) -> Result<(u32, Vec<f32>), CliError> {
    let file = File::open(path)?;
    let mut reader = hound::WavReader::new(file)?;
    let spec = reader.spec();
    tracing::debug!(
        "{}: {} Hz, {} channels, {} bits {:?}",
        path.display(),
        spec.sample_rate,
        spec.channels,
        spec.bits_per_sample,
        spec.sample_format
    );

    let interleaved: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
        (SampleFormat::Int, 16) => reader
            .samples::<i16>()
            .map(|s| s.map(|v| v as f32 / 32768.0))
            .collect::<Result<_, _>>()?,
        (SampleFormat::Int, 24) => reader
            .samples::<i32>()
            .map(|s| s.map(|v| v as f32 / 8_388_608.0))
            .collect::<Result<_, _>>()?,
        (SampleFormat::Float, 32) => reader.samples::<f32>().collect::<Result<_, _>>()?,
        (format, bits) => {
            return Err(CliError::UnsupportedWav(format!("{:?} {}-bit", format, bits)));
        }
    };

    let channels = spec.channels.max(1) as usize;
    let mono = interleaved.into_iter().step_by(channels).collect();
    Ok((spec.sample_rate, mono))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcm_round_trip_keeps_rate_and_shape() {
        let dir = std::env::temp_dir().join(format!("arqmodem-wav-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("tone.wav");
        let samples: Vec<f32> = (0..800).map(|i| (i as f32 * 0.05).sin() * 0.5).collect();

        write_mono(&path, 8000, &samples).unwrap();
        let (rate, read) = read_mono(&path).unwrap();

        assert_eq!(rate, 8000);
        assert_eq!(read.len(), samples.len());
        for (a, b) in samples.iter().zip(&read) {
            assert!((a - b).abs() < 1e-3);
        }
        let _ = std::fs::remove_dir_all(&dir);
    }
}
