//! The spectrogram generation network, a Tacotron-flavoured encoder-decoder. A token sequence
//! is embedded and encoded by a convolutional front end plus a bidirectional LSTM, then an
//! attention-guided LSTM decoder emits spectrogram frames one at a time until a learned stop
//! token fires. A convolutional postnet adds a residual polish over the whole spectrogram at
//! the end.
//!
//! The attention is the location-sensitive variant: alongside the usual content term it
//! convolves over where the model attended previously (and cumulatively), which keeps the
//! decoder marching forward through the text instead of stalling or looping on a phrase. The
//! cumulative weights are why you rarely hear these models repeat a word.
//!
//! Multi-voice and multi-language checkpoints carry extra embedding tables. A speaker is one ID
//! for the whole utterance broadcast over every encoder step, languages arrive as one ID per
//! character so an utterance can switch language mid-sentence. Both are concatenated onto the
//! encoder output rather than summed into it, widening the decoder instead of disturbing the
//! text encoding.
//!
//! Everything here runs in inference mode only. Prenet dropout, which some implementations
//! leave on at synthesis time for output variety, stays off so a given checkpoint and input
//! always produce the same spectrogram.
use crate::params::Params;
use anyhow::bail;
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::ops::{sigmoid, softmax};
use candle_nn::{
    batch_norm, conv1d, conv1d_no_bias, embedding, linear, linear_no_bias, BatchNorm, Conv1d,
    Conv1dConfig, Embedding, Linear, Module, ModuleT, VarBuilder,
};
use ndarray::Array2;
use tracing::{debug, warn};

/// Boundary contract for the spectrogram generation stage. The front end only needs something
/// that maps a token sequence to a spectrogram, which also lets the pipeline run against a stub
/// in tests.
pub trait SpectrogramGenerator {
    /// Produces a spectrogram with one column per audio frame. Speaker and language
    /// conditioning are structural options: `None` means the model does without, never an
    /// empty-but-present value.
    fn infer(
        &self,
        tokens: &[u32],
        speaker: Option<usize>,
        languages: Option<&[u32]>,
    ) -> anyhow::Result<Array2<f32>>;
}

/// A single LSTM cell stepped manually. The decoder needs frame-by-frame control for the
/// attention feedback loop so there is no use for a whole-sequence RNN abstraction here.
struct LstmCell {
    weight_ih: Tensor,
    weight_hh: Tensor,
    bias_ih: Tensor,
    bias_hh: Tensor,
    hidden_dim: usize,
}

impl LstmCell {
    fn new(in_dim: usize, hidden_dim: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            weight_ih: vb.get((4 * hidden_dim, in_dim), "weight_ih")?,
            weight_hh: vb.get((4 * hidden_dim, hidden_dim), "weight_hh")?,
            bias_ih: vb.get(4 * hidden_dim, "bias_ih")?,
            bias_hh: vb.get(4 * hidden_dim, "bias_hh")?,
            hidden_dim,
        })
    }

    fn zero_state(&self, batch: usize, device: &Device) -> candle_core::Result<(Tensor, Tensor)> {
        let h = Tensor::zeros((batch, self.hidden_dim), DType::F32, device)?;
        let c = h.clone();
        Ok((h, c))
    }

    /// One update of the cell, gate layout is input, forget, candidate, output.
    fn step(
        &self,
        input: &Tensor,
        h: &Tensor,
        c: &Tensor,
    ) -> candle_core::Result<(Tensor, Tensor)> {
        let gates = input
            .matmul(&self.weight_ih.t()?)?
            .broadcast_add(&self.bias_ih)?
            .add(&h.matmul(&self.weight_hh.t()?)?)?
            .broadcast_add(&self.bias_hh)?;
        let gates = gates.chunk(4, 1)?;

        let input_gate = sigmoid(&gates[0])?;
        let forget_gate = sigmoid(&gates[1])?;
        let candidate = gates[2].tanh()?;
        let output_gate = sigmoid(&gates[3])?;

        let c = forget_gate.mul(c)?.add(&input_gate.mul(&candidate)?)?;
        let h = output_gate.mul(&c.tanh()?)?;
        Ok((h, c))
    }
}

struct Encoder {
    convolutions: Vec<(Conv1d, BatchNorm)>,
    forward_lstm: LstmCell,
    backward_lstm: LstmCell,
}

impl Encoder {
    fn new(params: &Params, vb: VarBuilder) -> candle_core::Result<Self> {
        let config = Conv1dConfig {
            padding: 2,
            ..Default::default()
        };
        let mut convolutions = Vec::with_capacity(3);
        for i in 0..3 {
            let conv = conv1d(
                params.embedding_dim,
                params.embedding_dim,
                5,
                config,
                vb.pp(format!("conv{i}")),
            )?;
            let norm = batch_norm(params.embedding_dim, 1e-5, vb.pp(format!("norm{i}")))?;
            convolutions.push((conv, norm));
        }
        let half = params.encoder_dim / 2;
        Ok(Self {
            convolutions,
            forward_lstm: LstmCell::new(params.embedding_dim, half, vb.pp("lstm_fw"))?,
            backward_lstm: LstmCell::new(params.embedding_dim, half, vb.pp("lstm_bw"))?,
        })
    }

    /// (batch, steps, embedding) in, (batch, steps, encoder_dim) out
    fn forward(&self, embedded: &Tensor) -> candle_core::Result<Tensor> {
        let (batch, steps, _) = embedded.dims3()?;
        let device = embedded.device();

        let mut x = embedded.transpose(1, 2)?;
        for (conv, norm) in &self.convolutions {
            x = norm.forward_t(&conv.forward(&x)?, false)?.relu()?;
        }
        let x = x.transpose(1, 2)?.contiguous()?;

        let (mut h, mut c) = self.forward_lstm.zero_state(batch, device)?;
        let mut forward_states = Vec::with_capacity(steps);
        for t in 0..steps {
            let frame = x.i((.., t, ..))?;
            (h, c) = self.forward_lstm.step(&frame, &h, &c)?;
            forward_states.push(h.clone());
        }

        let (mut h, mut c) = self.backward_lstm.zero_state(batch, device)?;
        let mut backward_states = Vec::with_capacity(steps);
        for t in (0..steps).rev() {
            let frame = x.i((.., t, ..))?;
            (h, c) = self.backward_lstm.step(&frame, &h, &c)?;
            backward_states.push(h.clone());
        }
        backward_states.reverse();

        let mut outputs = Vec::with_capacity(steps);
        for (forward, backward) in forward_states.iter().zip(&backward_states) {
            outputs.push(Tensor::cat(&[forward, backward], 1)?);
        }
        Tensor::stack(&outputs, 1)
    }
}

struct Attention {
    query_layer: Linear,
    memory_layer: Linear,
    location_conv: Conv1d,
    location_layer: Linear,
    score: Linear,
}

impl Attention {
    fn new(params: &Params, memory_dim: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        let config = Conv1dConfig {
            padding: (params.attention_location_kernel - 1) / 2,
            ..Default::default()
        };
        Ok(Self {
            query_layer: linear_no_bias(
                params.attention_rnn_dim,
                params.attention_dim,
                vb.pp("query"),
            )?,
            memory_layer: linear_no_bias(memory_dim, params.attention_dim, vb.pp("memory"))?,
            location_conv: conv1d_no_bias(
                2,
                params.attention_location_filters,
                params.attention_location_kernel,
                config,
                vb.pp("location_conv"),
            )?,
            location_layer: linear_no_bias(
                params.attention_location_filters,
                params.attention_dim,
                vb.pp("location"),
            )?,
            score: linear_no_bias(params.attention_dim, 1, vb.pp("score"))?,
        })
    }

    /// The content term over the encoder output never changes during decoding so it's computed
    /// once up front.
    fn prepare_memory(&self, memory: &Tensor) -> candle_core::Result<Tensor> {
        self.memory_layer.forward(memory)
    }

    /// Returns the attention context vector and the fresh attention weights.
    fn forward(
        &self,
        query: &Tensor,
        memory: &Tensor,
        processed_memory: &Tensor,
        weights: &Tensor,
        weights_cum: &Tensor,
    ) -> candle_core::Result<(Tensor, Tensor)> {
        let location = Tensor::stack(&[weights, weights_cum], 1)?;
        let location = self
            .location_conv
            .forward(&location)?
            .transpose(1, 2)?
            .contiguous()?;
        let location = self.location_layer.forward(&location)?;

        let query = self.query_layer.forward(query)?.unsqueeze(1)?;
        let energies = processed_memory
            .broadcast_add(&query)?
            .add(&location)?
            .tanh()?;
        let energies = self.score.forward(&energies)?.squeeze(2)?;

        let weights = softmax(&energies, 1)?;
        let context = weights.unsqueeze(1)?.matmul(memory)?.squeeze(1)?;
        Ok((context, weights))
    }
}

struct Decoder {
    prenet_a: Linear,
    prenet_b: Linear,
    attention_rnn: LstmCell,
    attention: Attention,
    decoder_rnn: LstmCell,
    frame_projection: Linear,
    gate_projection: Linear,
    frame_channels: usize,
    gate_threshold: f32,
    max_decoder_steps: usize,
}

impl Decoder {
    fn new(
        params: &Params,
        memory_dim: usize,
        frame_channels: usize,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        Ok(Self {
            prenet_a: linear_no_bias(frame_channels, params.prenet_dim, vb.pp("prenet_a"))?,
            prenet_b: linear_no_bias(params.prenet_dim, params.prenet_dim, vb.pp("prenet_b"))?,
            attention_rnn: LstmCell::new(
                params.prenet_dim + memory_dim,
                params.attention_rnn_dim,
                vb.pp("attention_rnn"),
            )?,
            attention: Attention::new(params, memory_dim, vb.pp("attention"))?,
            decoder_rnn: LstmCell::new(
                params.attention_rnn_dim + memory_dim,
                params.decoder_rnn_dim,
                vb.pp("decoder_rnn"),
            )?,
            frame_projection: linear(
                params.decoder_rnn_dim + memory_dim,
                frame_channels,
                vb.pp("frame_projection"),
            )?,
            gate_projection: linear(
                params.decoder_rnn_dim + memory_dim,
                1,
                vb.pp("gate_projection"),
            )?,
            frame_channels,
            gate_threshold: params.gate_threshold,
            max_decoder_steps: params.max_decoder_steps,
        })
    }

    fn prenet(&self, frame: &Tensor) -> candle_core::Result<Tensor> {
        self.prenet_b
            .forward(&self.prenet_a.forward(frame)?.relu()?)?
            .relu()
    }

    /// Runs the attention loop over the encoder output until the gate fires, returning the raw
    /// spectrogram as (batch, channels, frames).
    fn infer(&self, memory: &Tensor) -> candle_core::Result<Tensor> {
        let (batch, steps, memory_dim) = memory.dims3()?;
        let device = memory.device();
        let processed_memory = self.attention.prepare_memory(memory)?;

        // The decoder starts from an all-zero frame and empty attention history
        let mut frame = Tensor::zeros((batch, self.frame_channels), DType::F32, device)?;
        let mut context = Tensor::zeros((batch, memory_dim), DType::F32, device)?;
        let mut weights = Tensor::zeros((batch, steps), DType::F32, device)?;
        let mut weights_cum = weights.clone();
        let (mut attention_h, mut attention_c) = self.attention_rnn.zero_state(batch, device)?;
        let (mut decoder_h, mut decoder_c) = self.decoder_rnn.zero_state(batch, device)?;

        let mut frames = Vec::new();
        for step in 0..self.max_decoder_steps {
            let prenet_out = self.prenet(&frame)?;
            let attention_input = Tensor::cat(&[&prenet_out, &context], 1)?;
            (attention_h, attention_c) =
                self.attention_rnn
                    .step(&attention_input, &attention_h, &attention_c)?;

            let (new_context, new_weights) = self.attention.forward(
                &attention_h,
                memory,
                &processed_memory,
                &weights,
                &weights_cum,
            )?;
            context = new_context;
            weights_cum = weights_cum.add(&new_weights)?;
            weights = new_weights;

            let decoder_input = Tensor::cat(&[&attention_h, &context], 1)?;
            (decoder_h, decoder_c) =
                self.decoder_rnn
                    .step(&decoder_input, &decoder_h, &decoder_c)?;

            let projection_input = Tensor::cat(&[&decoder_h, &context], 1)?;
            frame = self.frame_projection.forward(&projection_input)?;
            frames.push(frame.clone());

            let gate = sigmoid(&self.gate_projection.forward(&projection_input)?)?
                .i((0, 0))?
                .to_scalar::<f32>()?;
            debug!("Gate at frame {step}: {gate}");
            if gate > self.gate_threshold {
                debug!("Stopping after {} frames", frames.len());
                break;
            }
            if step + 1 == self.max_decoder_steps {
                warn!("Gate never fired, stopping at the decoder step ceiling");
            }
        }

        Tensor::stack(&frames, 2)
    }
}

struct Postnet {
    convolutions: Vec<(Conv1d, BatchNorm, bool)>,
}

impl Postnet {
    fn new(params: &Params, frame_channels: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        let config = Conv1dConfig {
            padding: 2,
            ..Default::default()
        };
        let dims = [
            (frame_channels, params.postnet_dim, true),
            (params.postnet_dim, params.postnet_dim, true),
            (params.postnet_dim, params.postnet_dim, true),
            (params.postnet_dim, params.postnet_dim, true),
            (params.postnet_dim, frame_channels, false),
        ];
        let mut convolutions = Vec::with_capacity(dims.len());
        for (i, (in_dim, out_dim, tanh)) in dims.into_iter().enumerate() {
            let conv = conv1d(in_dim, out_dim, 5, config, vb.pp(format!("conv{i}")))?;
            let norm = batch_norm(out_dim, 1e-5, vb.pp(format!("norm{i}")))?;
            convolutions.push((conv, norm, tanh));
        }
        Ok(Self { convolutions })
    }

    /// Residual refinement over the whole spectrogram, (batch, channels, frames) both ways.
    fn forward(&self, spectrogram: &Tensor) -> candle_core::Result<Tensor> {
        let mut x = spectrogram.clone();
        for (conv, norm, tanh) in &self.convolutions {
            x = norm.forward_t(&conv.forward(&x)?, false)?;
            if *tanh {
                x = x.tanh()?;
            }
        }
        spectrogram.add(&x)
    }
}

/// The assembled network with its weights loaded, ready for inference.
pub struct Tacotron {
    embedding: Embedding,
    encoder: Encoder,
    speaker_embedding: Option<Embedding>,
    language_embedding: Option<Embedding>,
    decoder: Decoder,
    postnet: Postnet,
    device: Device,
}

impl Tacotron {
    /// Builds the architecture described by `params` and resolves every weight against the var
    /// builder. A weight the checkpoint doesn't carry, or carries with the wrong shape, fails
    /// here.
    pub fn new(
        params: &Params,
        vocab_size: usize,
        vb: VarBuilder,
        device: Device,
    ) -> anyhow::Result<Self> {
        if params.encoder_dim % 2 != 0 {
            bail!("encoder_dim must be even, it is split across two LSTM directions");
        }
        let mut memory_dim = params.encoder_dim;

        let speaker_embedding = if params.multi_speaker {
            memory_dim += params.speaker_embedding_dim;
            Some(embedding(
                params.speakers.len(),
                params.speaker_embedding_dim,
                vb.pp("speaker_embedding"),
            )?)
        } else {
            None
        };
        let language_embedding = if params.multi_language {
            memory_dim += params.language_embedding_dim;
            Some(embedding(
                params.languages.len(),
                params.language_embedding_dim,
                vb.pp("language_embedding"),
            )?)
        } else {
            None
        };

        let frame_channels = params.frame_channels();
        Ok(Self {
            embedding: embedding(vocab_size, params.embedding_dim, vb.pp("embedding"))?,
            encoder: Encoder::new(params, vb.pp("encoder"))?,
            speaker_embedding,
            language_embedding,
            decoder: Decoder::new(params, memory_dim, frame_channels, vb.pp("decoder"))?,
            postnet: Postnet::new(params, frame_channels, vb.pp("postnet"))?,
            device,
        })
    }
}

impl SpectrogramGenerator for Tacotron {
    fn infer(
        &self,
        tokens: &[u32],
        speaker: Option<usize>,
        languages: Option<&[u32]>,
    ) -> anyhow::Result<Array2<f32>> {
        if tokens.is_empty() {
            bail!("empty token sequence");
        }
        let steps = tokens.len();
        let tokens = Tensor::from_vec(tokens.to_vec(), (1, steps), &self.device)?;
        let embedded = self.embedding.forward(&tokens)?;
        let mut memory = self.encoder.forward(&embedded)?;

        match (&self.speaker_embedding, speaker) {
            (Some(table), Some(id)) => {
                let id = Tensor::from_vec(vec![id as u32], (1,), &self.device)?;
                let voice = table.forward(&id)?;
                let (_, speaker_dim) = voice.dims2()?;
                let voice = voice
                    .unsqueeze(1)?
                    .expand((1, steps, speaker_dim))?
                    .contiguous()?;
                memory = Tensor::cat(&[&memory, &voice], 2)?;
            }
            (Some(_), None) => bail!("the model is multi-speaker but no speaker was resolved"),
            (None, Some(_)) => bail!("a speaker was given but the model is single-speaker"),
            (None, None) => {}
        }

        match (&self.language_embedding, languages) {
            (Some(table), Some(ids)) => {
                if ids.len() != steps {
                    bail!(
                        "language sequence covers {} positions but the utterance tokenized to \
                         {steps} (unsupported symbols in the utterance?)",
                        ids.len()
                    );
                }
                let ids = Tensor::from_vec(ids.to_vec(), (1, steps), &self.device)?;
                memory = Tensor::cat(&[&memory, &table.forward(&ids)?], 2)?;
            }
            (Some(_), None) => bail!("the model is multi-language but no languages were resolved"),
            (None, Some(_)) => bail!("languages were given but the model is mono-lingual"),
            (None, None) => {}
        }

        let spectrogram = self.decoder.infer(&memory.contiguous()?)?;
        let spectrogram = self
            .postnet
            .forward(&spectrogram)?
            .squeeze(0)?
            .to_device(&Device::Cpu)?;

        let (channels, frames) = spectrogram.dims2()?;
        let data = spectrogram.flatten_all()?.to_vec1::<f32>()?;
        Ok(Array2::from_shape_vec((channels, frames), data)?)
    }
}
