//! Turns spectrograms back into audio on disk. The network predicts normalised spectrograms,
//! so the pipeline here is denormalise to log-amplitude, invert with Griffin-Lim and write
//! 16-bit mono PCM. Inversion needs no trained vocoder which keeps the synthesiser entirely
//! self-contained at some cost in fidelity.
use crate::params::Params;
use anyhow::Context;
use chrono::Local;
use griffin_lim::mel::create_mel_filter_bank;
use griffin_lim::GriffinLim;
use hound::{SampleFormat, WavSpec, WavWriter};
use ndarray::{Array1, Array2};
use std::path::Path;

/// Creates a Griffin-Lim vocoder matching the loaded model. Mel models get the mel filter bank
/// the spectrograms were extracted with, linear models an identity basis so the magnitudes
/// pass straight through to the phase reconstruction.
///
/// The momentum is the default from the librosa implementation which has been fine for every
/// model so far. The power is tuned by ear, spectrograms out of attention models come out a bit
/// quiet and values around 1.2-1.7 compensate without audible pumping. More iterations than
/// this were inaudible in listening checks but the extra runtime is cheap.
pub fn create_vocoder(params: &Params) -> anyhow::Result<GriffinLim> {
    let basis = if params.predict_linear {
        Array2::eye(params.frequency_bins())
    } else {
        create_mel_filter_bank(
            params.sample_rate as f32,
            params.num_fft,
            params.num_mels,
            params.mel_fmin,
            Some(params.mel_fmax),
        )
    };
    // Overlap is window size minus hop, getting this wrong yields time-stretched noise
    let vocoder = GriffinLim::new(
        basis,
        params.win_length - params.hop_length,
        params.griffin_lim_power,
        params.griffin_lim_iters,
        params.griffin_lim_momentum,
    )?;
    Ok(vocoder)
}

/// Maps the network's [0, 1] output back to the log-amplitude scale the vocoder expects. The
/// training normalisation squashed the dynamic range above `minimum_db` into [0, 1] after
/// subtracting the reference level, this is the exact inverse, values outside [0, 1] clamp.
pub fn denormalize_spectrogram(spectrogram: &Array2<f32>, params: &Params) -> Array2<f32> {
    let range = -params.minimum_db;
    spectrogram.mapv(|v| {
        let db = v.clamp(0.0, 1.0) * range + params.minimum_db + params.reference_db;
        db * std::f32::consts::LN_10 / 20.0
    })
}

/// Reconstructs a waveform from a denormalised spectrogram.
pub fn inverse_spectrogram(
    vocoder: &GriffinLim,
    spectrogram: &Array2<f32>,
) -> anyhow::Result<Array1<f32>> {
    vocoder.infer(spectrogram).context("inverting spectrogram")
}

/// Output name for the nth input line. The index keeps the files in input order when sorted,
/// the timestamp keeps reruns from clobbering earlier output.
pub fn output_filename(index: usize) -> String {
    format!("{index:03}-{}.wav", Local::now().format("%Y-%m-%dT%H-%M-%S"))
}

/// Writes a waveform as 16 bit mono PCM, samples clamped to [-1, 1].
pub fn save_wav(waveform: &Array1<f32>, path: &Path, sample_rate: u32) -> anyhow::Result<()> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut writer = WavWriter::create(path, spec)
        .with_context(|| format!("creating {}", path.display()))?;
    for sample in waveform.iter() {
        writer.write_sample((sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)?;
    }
    writer.finalize()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn denormalization_restores_the_training_range() {
        let params = Params::default();
        let spectrogram = arr2(&[[0.0_f32, 1.0, 2.0]]);
        let restored = denormalize_spectrogram(&spectrogram, &params);

        let ln10 = std::f32::consts::LN_10;
        // 0 maps to the dB floor plus reference, 1 to the reference level, >1 clamps
        assert!((restored[[0, 0]] - (-80.0 * ln10 / 20.0)).abs() < 1e-4);
        assert!((restored[[0, 1]] - (20.0 * ln10 / 20.0)).abs() < 1e-4);
        assert_eq!(restored[[0, 1]], restored[[0, 2]]);
    }

    #[test]
    fn output_names_order_by_zero_padded_index() {
        let name = output_filename(7);
        assert!(name.starts_with("007-"));
        assert!(name.ends_with(".wav"));
    }

    #[test]
    fn waveforms_round_trip_through_the_wav_writer() {
        let dir = std::env::temp_dir().join("babel-tts-wav-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("ramp.wav");

        let waveform = Array1::from_vec(vec![0.0_f32, 0.5, -0.5, 2.0]);
        save_wav(&waveform, &path, 22050).unwrap();

        let mut reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, 22050);
        assert_eq!(reader.spec().channels, 1);
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples.len(), 4);
        assert_eq!(samples[0], 0);
        // The out-of-range sample clamps instead of wrapping
        assert_eq!(samples[3], i16::MAX);
        std::fs::remove_file(&path).ok();
    }
}
