//! Checkpoint loading. A checkpoint is a single safetensors file produced by the training
//! exporter: the weight table itself plus a `parameters` entry in the metadata header holding
//! the JSON-encoded [`Params`] the model was trained with. Because training runs wrapped in the
//! distributed-data-parallel container, every weight name carries a `module.` prefix which has
//! to go before the names line up with what [`crate::tacotron::Tacotron`] asks the var builder
//! for. A name that doesn't resolve after stripping is a fatal load error, there is no partial
//! restore.
use crate::params::Params;
use anyhow::{bail, Context};
use candle_core::{Device, Tensor};
use safetensors::SafeTensors;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Name prefix the distributed training wrapper adds to every weight
const DISTRIBUTED_PREFIX: &str = "module.";

/// A deserialized checkpoint, weights already on the compute device.
pub struct Checkpoint {
    pub params: Params,
    pub weights: HashMap<String, Tensor>,
    pub device: Device,
}

impl Checkpoint {
    /// Reads a checkpoint from disk, picking the GPU when one is available and falling back to
    /// the CPU otherwise. The returned parameters and weights always travel together so a model
    /// can't be built against the wrong configuration.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = fs::read(path)
            .with_context(|| format!("reading checkpoint {}", path.display()))?;

        let (_, metadata) =
            SafeTensors::read_metadata(&raw).context("parsing checkpoint header")?;
        let params = match metadata.metadata().as_ref().and_then(|m| m.get("parameters")) {
            Some(json) => serde_json::from_str::<Params>(json)
                .context("deserializing checkpoint parameters")?,
            None => bail!(
                "checkpoint {} has no `parameters` entry in its metadata",
                path.display()
            ),
        };

        let device = Device::cuda_if_available(0)?;
        let tensors = candle_core::safetensors::load_buffer(&raw, &device)
            .context("loading checkpoint weights")?;
        let weights = remove_distributed_prefix(tensors)?;

        Ok(Self {
            params,
            weights,
            device,
        })
    }
}

/// Strips the fixed-length wrapper prefix from every weight name. The stripped table must be
/// the same size as the input table, if two names collapse into one the checkpoint was not
/// produced by the wrapper this prefix belongs to and loading it would silently drop a weight.
pub fn remove_distributed_prefix(
    weights: HashMap<String, Tensor>,
) -> anyhow::Result<HashMap<String, Tensor>> {
    let mut stripped = HashMap::with_capacity(weights.len());
    for (name, tensor) in weights {
        let bare = match name.get(DISTRIBUTED_PREFIX.len()..) {
            Some(bare) => bare,
            None => bail!("weight name `{name}` is shorter than the distributed wrapper prefix"),
        };
        if stripped.insert(bare.to_string(), tensor).is_some() {
            bail!("stripping the distributed wrapper prefix collapsed two weights into `{bare}`");
        }
    }
    Ok(stripped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn weight() -> Tensor {
        Tensor::zeros((1,), DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn prefix_stripping_drops_exactly_seven_characters() {
        let mut weights = HashMap::new();
        weights.insert("module.encoder.lstm_fw.weight_ih".to_string(), weight());
        weights.insert("module.embedding.weight".to_string(), weight());

        let stripped = remove_distributed_prefix(weights).unwrap();
        assert_eq!(stripped.len(), 2);
        assert!(stripped.contains_key("encoder.lstm_fw.weight_ih"));
        assert!(stripped.contains_key("embedding.weight"));
    }

    #[test]
    fn colliding_names_after_stripping_are_rejected() {
        let mut weights = HashMap::new();
        weights.insert("module.gate.bias".to_string(), weight());
        weights.insert("modele.gate.bias".to_string(), weight());

        let err = remove_distributed_prefix(weights).unwrap_err();
        assert!(err.to_string().contains("gate.bias"));
    }

    #[test]
    fn names_shorter_than_the_prefix_are_rejected() {
        let mut weights = HashMap::new();
        weights.insert("w".to_string(), weight());

        assert!(remove_distributed_prefix(weights).is_err());
    }
}
