//! Batch text-to-speech synthesis from a trained checkpoint. The crate wires a symbol
//! tokenizer, a Tacotron-style spectrogram network and a Griffin-Lim audio back end together
//! behind [`Synthesizer`], the binary in `src/bin/synth.rs` drives it over stdin.
use std::env;
use std::path::Path;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::{Layer, Registry};

pub mod audio;
pub mod checkpoint;
pub mod input;
pub mod params;
pub mod tacotron;
pub mod text;

use anyhow::Context;
use candle_core::DType;
use candle_nn::VarBuilder;
use checkpoint::Checkpoint;
use input::{decode_language_spans, InputRecord};
use ndarray::Array2;
use params::Params;
use tacotron::{SpectrogramGenerator, Tacotron};
use text::Tokenizer;

pub fn setup_logging() {
    let filter = match env::var("RUST_LOG") {
        Ok(_) => EnvFilter::from_env("RUST_LOG"),
        _ => EnvFilter::new("babel_tts=info,synth=info"),
    };

    let fmt = tracing_subscriber::fmt::Layer::default();

    let subscriber = filter.and_then(fmt).with_subscriber(Registry::default());

    tracing::subscriber::set_global_default(subscriber).unwrap();
}

/// The loaded model plus the front end that feeds it. Owns the parameters from the checkpoint
/// so every stage interprets inputs the way the model was trained.
pub struct Synthesizer<G = Tacotron> {
    params: Params,
    tokenizer: Tokenizer,
    generator: G,
}

impl Synthesizer {
    /// Loads a checkpoint and builds the model on the best available device.
    pub fn load(checkpoint: impl AsRef<Path>) -> anyhow::Result<Self> {
        let Checkpoint {
            params,
            weights,
            device,
        } = Checkpoint::load(checkpoint)?;
        let tokenizer = Tokenizer::new(&params);
        let vb = VarBuilder::from_tensors(weights, DType::F32, &device);
        let model = Tacotron::new(&params, tokenizer.vocab_size(), vb, device)?;
        Ok(Self::with_generator(params, model))
    }
}

impl<G: SpectrogramGenerator> Synthesizer<G> {
    /// Assembles a synthesiser around an already-built generator.
    pub fn with_generator(params: Params, generator: G) -> Self {
        let tokenizer = Tokenizer::new(&params);
        Self {
            params,
            tokenizer,
            generator,
        }
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Runs the front end and the model for one input record, producing a normalised
    /// spectrogram. Speaker and language conditioning are only derived when the model was
    /// trained with them, unknown names and codes are hard errors.
    pub fn synthesize(&self, record: &InputRecord) -> anyhow::Result<Array2<f32>> {
        let tokens = self.tokenizer.to_sequence(&record.text);

        let speaker = match (self.params.multi_speaker, record.speaker.as_deref()) {
            (true, Some(name)) => Some(
                self.params
                    .speakers
                    .iter()
                    .position(|known| known == name)
                    .with_context(|| format!("unknown speaker `{name}`"))?,
            ),
            _ => None,
        };

        let languages = match (self.params.multi_language, record.languages.as_deref()) {
            (true, Some(spans)) => Some(decode_language_spans(
                spans,
                &self.params.languages,
                record.utterance_len(),
            )?),
            _ => None,
        };

        self.generator.infer(&tokens, speaker, languages.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    /// Captures what the front end hands to the model so the wiring can be checked without
    /// real weights.
    #[derive(Default)]
    struct Recorder {
        calls: RefCell<Vec<(Vec<u32>, Option<usize>, Option<Vec<u32>>)>>,
    }

    impl SpectrogramGenerator for &Recorder {
        fn infer(
            &self,
            tokens: &[u32],
            speaker: Option<usize>,
            languages: Option<&[u32]>,
        ) -> anyhow::Result<Array2<f32>> {
            self.calls.borrow_mut().push((
                tokens.to_vec(),
                speaker,
                languages.map(|ids| ids.to_vec()),
            ));
            Ok(Array2::zeros((80, 5)))
        }
    }

    fn multi_params() -> Params {
        Params {
            multi_speaker: true,
            multi_language: true,
            speakers: vec!["speaker1".to_string(), "speaker2".to_string()],
            languages: vec!["de".to_string(), "fr".to_string()],
            ..Params::default()
        }
    }

    #[test]
    fn every_record_produces_one_spectrogram_in_order() {
        let recorder = Recorder::default();
        let synthesizer = Synthesizer::with_generator(Params::default(), &recorder);

        let lines = ["hello world", "second line", "third line"];
        for line in lines {
            let record = InputRecord::parse(line, synthesizer.params()).unwrap();
            synthesizer.synthesize(&record).unwrap();
        }

        let calls = recorder.calls.borrow();
        assert_eq!(calls.len(), 3);
        // 11 characters plus the end-of-sequence symbol, no conditioning for a plain model
        assert_eq!(calls[0].0.len(), 12);
        assert_eq!(calls[0].1, None);
        assert_eq!(calls[0].2, None);
    }

    #[test]
    fn conditioned_line_resolves_speaker_and_language_ids() {
        let recorder = Recorder::default();
        let synthesizer = Synthesizer::with_generator(multi_params(), &recorder);

        let record = InputRecord::parse(
            "guten tag jean-paul.|speaker1|de-10,fr-9,de",
            synthesizer.params(),
        )
        .unwrap();
        synthesizer.synthesize(&record).unwrap();

        let calls = recorder.calls.borrow();
        let (tokens, speaker, languages) = &calls[0];
        assert_eq!(*speaker, Some(0));

        let languages = languages.as_ref().unwrap();
        assert_eq!(languages.len(), record.utterance_len() + 1);
        assert_eq!(tokens.len(), languages.len());
        assert!(languages[..10].iter().all(|&id| id == 0));
        assert!(languages[10..19].iter().all(|&id| id == 1));
        assert!(languages[19..].iter().all(|&id| id == 0));
    }

    #[test]
    fn unknown_speakers_are_lookup_errors() {
        let recorder = Recorder::default();
        let synthesizer = Synthesizer::with_generator(multi_params(), &recorder);

        let record = InputRecord::parse("hallo|nobody|de", synthesizer.params()).unwrap();
        let err = synthesizer.synthesize(&record).unwrap_err();
        assert!(err.to_string().contains("nobody"));
        assert!(recorder.calls.borrow().is_empty());
    }
}
