use anyhow::Context;
use babel_tts::audio;
use babel_tts::input::InputRecord;
use babel_tts::Synthesizer;
use clap::Parser;
use ndarray_npy::write_npy;
use std::io::{self, BufRead};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
pub struct Args {
    /// Model checkpoint
    #[clap(long)]
    checkpoint: PathBuf,
    /// Path to output directory
    #[clap(long, default_value = ".")]
    output: PathBuf,
    /// Saves the generated spectrograms for debugging purposes
    #[clap(long)]
    output_spectrogram: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    babel_tts::setup_logging();
    let args = Args::parse();

    info!("Loading checkpoint {}", args.checkpoint.display());
    let synthesizer = Synthesizer::load(&args.checkpoint)?;
    let params = synthesizer.params();
    let vocoder = audio::create_vocoder(params)?;

    // One utterance per line on stdin. Multi-speaker models expect `text|speaker`,
    // multi-language models `text|speaker|de-10,fr-9,de` where the final language span
    // takes all remaining characters.
    let mut records = Vec::new();
    for (line_number, line) in io::stdin().lock().lines().enumerate() {
        let line = line.context("reading stdin")?;
        if line.trim().is_empty() {
            continue;
        }
        let record = InputRecord::parse(&line, params)
            .with_context(|| format!("parsing input line {}", line_number + 1))?;
        records.push(record);
    }
    info!("Synthesising {} utterances", records.len());

    let mut spectrograms = Vec::with_capacity(records.len());
    for record in &records {
        info!("Synthesising `{}`", record.text);
        let spectrogram = synthesizer
            .synthesize(record)
            .with_context(|| format!("synthesising `{}`", record.text))?;
        spectrograms.push(spectrogram);
    }

    for (index, spectrogram) in spectrograms.iter().enumerate() {
        if let Some(dir) = &args.output_spectrogram {
            write_npy(dir.join(format!("{index:03}.npy")), spectrogram)
                .context("saving spectrogram")?;
        }
        let denormalized = audio::denormalize_spectrogram(spectrogram, params);
        let waveform = audio::inverse_spectrogram(&vocoder, &denormalized)?;

        let path = args.output.join(audio::output_filename(index));
        info!("Writing {}", path.display());
        audio::save_wav(&waveform, &path, params.sample_rate)?;
    }

    Ok(())
}
