//! Hyperparameters and front-end configuration for a trained model. These are embedded in the
//! checkpoint by the exporter so a model can never be paired with the wrong alphabet, speaker
//! list or spectrogram settings. The struct is deserialized once at load time and then threaded
//! through everything that needs it, there is no global parameter state.
use serde::Deserialize;

/// Everything the synthesiser needs to know about the loaded model. Fields not present in the
/// checkpoint fall back to the defaults below, which match the values our models are trained
/// with.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct Params {
    /// If set the model consumes phoneme IDs, otherwise character IDs
    pub use_phonemes: bool,
    /// Whether the model was trained with per-character language conditioning
    pub multi_language: bool,
    /// Whether the model was trained on more than one voice
    pub multi_speaker: bool,
    /// Language codes the model knows, a code's position is its embedding ID
    pub languages: Vec<String>,
    /// Speaker names the model knows, a name's position is its embedding ID
    pub speakers: Vec<String>,
    /// Character alphabet in model input order
    pub characters: String,
    /// Phoneme inventory in model input order, only consulted when `use_phonemes` is set
    pub phonemes: String,

    pub sample_rate: u32,
    pub num_fft: usize,
    pub win_length: usize,
    pub hop_length: usize,
    pub num_mels: usize,
    pub mel_fmin: f32,
    pub mel_fmax: f32,
    /// If set the model predicts full linear-scale spectrograms instead of mel spectrograms
    pub predict_linear: bool,
    /// Reference level subtracted during training normalisation
    pub reference_db: f32,
    /// Floor of the dynamic range the training normalisation mapped to [0, 1]
    pub minimum_db: f32,

    pub griffin_lim_iters: usize,
    pub griffin_lim_power: f32,
    pub griffin_lim_momentum: f32,

    pub embedding_dim: usize,
    pub encoder_dim: usize,
    pub prenet_dim: usize,
    pub attention_dim: usize,
    pub attention_rnn_dim: usize,
    pub attention_location_filters: usize,
    pub attention_location_kernel: usize,
    pub decoder_rnn_dim: usize,
    pub postnet_dim: usize,
    pub speaker_embedding_dim: usize,
    pub language_embedding_dim: usize,
    /// Decoding stops once the stop-token sigmoid exceeds this
    pub gate_threshold: f32,
    /// Hard ceiling on decoder steps for inputs where the gate never fires
    pub max_decoder_steps: usize,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            use_phonemes: false,
            multi_language: false,
            multi_speaker: false,
            languages: vec![],
            speakers: vec![],
            characters: "abcdefghijklmnopqrstuvwxyz0123456789 !'(),-.:;?".to_string(),
            phonemes: String::new(),
            sample_rate: 22050,
            num_fft: 1024,
            win_length: 1024,
            hop_length: 256,
            num_mels: 80,
            mel_fmin: 0.0,
            mel_fmax: 8000.0,
            predict_linear: false,
            reference_db: 20.0,
            minimum_db: -100.0,
            griffin_lim_iters: 30,
            griffin_lim_power: 1.7,
            griffin_lim_momentum: 0.99,
            embedding_dim: 512,
            encoder_dim: 512,
            prenet_dim: 256,
            attention_dim: 128,
            attention_rnn_dim: 1024,
            attention_location_filters: 32,
            attention_location_kernel: 31,
            decoder_rnn_dim: 1024,
            postnet_dim: 512,
            speaker_embedding_dim: 64,
            language_embedding_dim: 8,
            gate_threshold: 0.5,
            max_decoder_steps: 1000,
        }
    }
}

impl Params {
    /// Number of frequency bins in a linear spectrogram frame
    pub fn frequency_bins(&self) -> usize {
        self.num_fft / 2 + 1
    }

    /// Rows in one spectrogram frame as the model predicts it, mel bands or linear bins
    /// depending on `predict_linear`
    pub fn frame_channels(&self) -> usize {
        if self.predict_linear {
            self.frequency_bins()
        } else {
            self.num_mels
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unspecified_fields_fall_back_to_defaults() {
        let params: Params =
            serde_json::from_str(r#"{"multi_speaker": true, "speakers": ["anna", "bert"]}"#)
                .unwrap();
        assert!(params.multi_speaker);
        assert_eq!(params.speakers, vec!["anna", "bert"]);
        assert_eq!(params.sample_rate, 22050);
        assert_eq!(params.max_decoder_steps, 1000);
    }

    #[test]
    fn frame_channels_follow_the_prediction_scale() {
        let mut params = Params::default();
        assert_eq!(params.frame_channels(), 80);
        params.predict_linear = true;
        assert_eq!(params.frame_channels(), 513);
    }
}
