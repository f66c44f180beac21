use std::{
    fs,
    ops::ControlFlow,
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;
use serde::Deserialize;
use tch::{Device, IValue, Kind, Tensor, no_grad};
use tokenizers::{PaddingParams, Tokenizer, TruncationParams};
use tracing::{debug, info, warn};

use crate::{
    error::ServiceError,
    model::{
        ChatMessage, DeviceKind, LoadedModel, ModelBackend, ModelSource, SamplingParams,
        template,
    },
};

const MODULE_FILES: &[&str] = &["model.pt", "model.ts", "model.torchscript", "traced_model.pt"];
const EOS_CANDIDATES: &[&str] = &["</s>", "<|endoftext|>", "<|im_end|>", "<|eot_id|>", "<eos>"];

pub struct TorchBackend {
    max_input_tokens: usize,
}

impl TorchBackend {
    pub fn new(max_input_tokens: usize) -> Self {
        Self { max_input_tokens }
    }
}

impl ModelBackend for TorchBackend {
    fn detect_device(&self) -> DeviceKind {
        if tch::Cuda::is_available() {
            DeviceKind::Cuda
        } else if tch::utils::has_mps() {
            DeviceKind::Mps
        } else {
            DeviceKind::Cpu
        }
    }

    fn load(
        &self,
        source: &ModelSource,
        device: DeviceKind,
    ) -> Result<Arc<dyn LoadedModel>, ServiceError> {
        let artifacts = match source {
            ModelSource::Local(path) => ModelFiles::from_dir(path)?,
            ModelSource::Remote(repo_id) => ModelFiles::fetch(repo_id)?,
        };
        let model = TorchModel::load(&artifacts, device, self.max_input_tokens)?;
        Ok(Arc::new(model))
    }

    fn reclaim_memory(&self, device: DeviceKind) {
        // libtorch frees tensors on drop; waiting on the stream makes sure the
        // frees have been issued before the caller reports the unload.
        if device == DeviceKind::Cuda && tch::Cuda::is_available() {
            tch::Cuda::synchronize(0);
        }
    }
}

#[derive(Debug)]
struct ModelFiles {
    module: PathBuf,
    tokenizer: PathBuf,
    tokenizer_config: Option<PathBuf>,
}

impl ModelFiles {
    fn from_dir(dir: &Path) -> Result<Self, ServiceError> {
        let tokenizer = dir.join("tokenizer.json");
        if !tokenizer.exists() {
            return Err(ServiceError::Tokenizer(format!(
                "tokenizer artifact missing: {}",
                tokenizer.display()
            )));
        }
        let module = find_module(dir)?;
        let tokenizer_config = Some(dir.join("tokenizer_config.json")).filter(|p| p.exists());
        Ok(Self {
            module,
            tokenizer,
            tokenizer_config,
        })
    }

    fn fetch(repo_id: &str) -> Result<Self, ServiceError> {
        info!(%repo_id, "resolving model from the Hugging Face Hub");
        let api = hf_hub::api::sync::Api::new()
            .map_err(|e| ServiceError::Inference(format!("hub client: {e}")))?;
        let repo = api.model(repo_id.to_string());

        let tokenizer = repo
            .get("tokenizer.json")
            .map_err(|e| ServiceError::Tokenizer(format!("tokenizer.json: {e}")))?;
        let tokenizer_config = repo.get("tokenizer_config.json").ok();
        let module = MODULE_FILES
            .iter()
            .find_map(|name| repo.get(name).ok())
            .ok_or_else(|| {
                ServiceError::Inference(format!(
                    "no TorchScript module ({}) in {repo_id}",
                    MODULE_FILES.join(", ")
                ))
            })?;

        Ok(Self {
            module,
            tokenizer,
            tokenizer_config,
        })
    }
}

fn find_module(dir: &Path) -> Result<PathBuf, ServiceError> {
    if let Some(found) = MODULE_FILES
        .iter()
        .map(|name| dir.join(name))
        .find(|candidate| candidate.exists())
    {
        return Ok(found);
    }

    let mut scripted: Vec<PathBuf> = fs::read_dir(dir)?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("pt" | "ts")
            )
        })
        .collect();
    scripted.sort();
    scripted.into_iter().next().ok_or_else(|| {
        ServiceError::Inference(format!(
            "model artifact missing: no TorchScript module in {}",
            dir.display()
        ))
    })
}

#[derive(Debug, Default, Deserialize)]
struct TokenizerConfig {
    chat_template: Option<serde_json::Value>,
    eos_token: Option<serde_json::Value>,
    model_max_length: Option<f64>,
}

impl TokenizerConfig {
    fn read(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };
        let parsed = fs::read_to_string(path)
            .map_err(|e| e.to_string())
            .and_then(|raw| serde_json::from_str::<Self>(&raw).map_err(|e| e.to_string()));
        match parsed {
            Ok(config) => config,
            Err(err) => {
                warn!(path = %path.display(), %err, "ignoring unreadable tokenizer config");
                Self::default()
            }
        }
    }

    fn chat_template(&self) -> Option<String> {
        match self.chat_template.as_ref()? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Array(items) => items
                .iter()
                .find(|item| item.get("name").and_then(|n| n.as_str()) == Some("default"))
                .and_then(|item| item.get("template"))
                .and_then(|t| t.as_str())
                .map(str::to_string),
            _ => None,
        }
    }

    // Configs without a real limit carry a sentinel such as 1e30.
    fn truncation_length(&self, max_input_tokens: usize) -> usize {
        self.model_max_length
            .filter(|len| *len >= 1.0 && *len < max_input_tokens as f64)
            .map(|len| len as usize)
            .unwrap_or(max_input_tokens)
    }

    fn eos_token(&self) -> Option<String> {
        match self.eos_token.as_ref()? {
            serde_json::Value::String(s) => Some(s.clone()),
            other => other.get("content").and_then(|c| c.as_str()).map(str::to_string),
        }
    }
}

pub struct TorchModel {
    tokenizer: Tokenizer,
    chat_template: Option<String>,
    eos_token_id: Option<u32>,
    device: Device,
    module: Mutex<tch::CModule>,
}

impl TorchModel {
    fn load(
        files: &ModelFiles,
        device: DeviceKind,
        max_input_tokens: usize,
    ) -> Result<Self, ServiceError> {
        let config = TokenizerConfig::read(files.tokenizer_config.as_deref());

        let mut tokenizer = Tokenizer::from_file(&files.tokenizer)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))?;

        let eos_token = config
            .eos_token()
            .filter(|tok| tokenizer.token_to_id(tok).is_some())
            .or_else(|| {
                EOS_CANDIDATES
                    .iter()
                    .find(|tok| tokenizer.token_to_id(tok).is_some())
                    .map(|tok| tok.to_string())
            });
        let eos_token_id = eos_token.as_deref().and_then(|tok| tokenizer.token_to_id(tok));

        if tokenizer.get_padding().is_none() {
            if let (Some(pad_token), Some(pad_id)) = (eos_token.clone(), eos_token_id) {
                debug!(%pad_token, "pad token undefined, using end-of-sequence token");
                tokenizer.with_padding(Some(PaddingParams {
                    pad_id,
                    pad_token,
                    ..Default::default()
                }));
            }
        }

        let max_length = config.truncation_length(max_input_tokens);
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length,
                ..Default::default()
            }))
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))?;

        let torch_device = to_torch_device(device);
        let kind = if device.is_accelerator() {
            Kind::Half
        } else {
            Kind::Float
        };
        let mut module = tch::CModule::load_on_device(&files.module, torch_device)
            .map_err(|e| ServiceError::Inference(e.to_string()))?;
        module.to(torch_device, kind, false);
        module.set_eval();

        info!(
            module = %files.module.display(),
            %device,
            ?kind,
            max_length,
            "TorchScript module ready"
        );

        Ok(Self {
            tokenizer,
            chat_template: config.chat_template(),
            eos_token_id,
            device: torch_device,
            module: Mutex::new(module),
        })
    }

    fn next_logits(&self, module: &tch::CModule, ids: &[i64]) -> Result<Tensor, ServiceError> {
        let input = Tensor::from_slice(ids)
            .reshape([1, ids.len() as i64])
            .to(self.device);

        let output = module
            .forward_is(&[IValue::Tensor(input)])
            .map_err(|e| ServiceError::Inference(e.to_string()))?;

        // Traced causal LMs return either the logits or a (logits, past) tuple.
        let logits = match output {
            IValue::Tensor(t) => t,
            IValue::Tuple(ref items) if !items.is_empty() => match &items[0] {
                IValue::Tensor(t) => t.shallow_clone(),
                _ => {
                    return Err(ServiceError::Inference(
                        "expected tensor as first tuple element".into(),
                    ));
                }
            },
            _ => {
                return Err(ServiceError::Inference(
                    "unexpected model output format".into(),
                ));
            }
        };

        // [1, seq, vocab] -> [vocab]
        Ok(logits.select(1, -1).squeeze().to_kind(Kind::Float))
    }
}

fn to_torch_device(device: DeviceKind) -> Device {
    match device {
        DeviceKind::Cpu => Device::Cpu,
        DeviceKind::Cuda => Device::Cuda(0),
        DeviceKind::Mps => Device::Mps,
    }
}

/// Appends ids produced by `step` until `max_new_tokens`, the end-of-sequence
/// id or a `Break` from `on_token`. The end-of-sequence id is kept in `ids` so
/// it counts as generated, but `on_token` never sees it.
fn decode_loop(
    ids: &mut Vec<i64>,
    params: &SamplingParams,
    eos_token_id: Option<u32>,
    on_token: &mut dyn FnMut(u32) -> ControlFlow<()>,
    mut step: impl FnMut(&[i64]) -> Result<i64, ServiceError>,
) -> Result<(), ServiceError> {
    let prompt_len = ids.len();
    for _ in 0..params.max_new_tokens {
        let next = step(ids)?;
        ids.push(next);

        if eos_token_id.map(i64::from) == Some(next) {
            break;
        }
        if on_token(next as u32).is_break() {
            debug!(generated = ids.len() - prompt_len, "generation stopped early");
            break;
        }
    }
    Ok(())
}

fn sample_next(logits: &Tensor, params: &SamplingParams) -> i64 {
    if !params.do_sample() {
        return logits.argmax(0, false).int64_value(&[]);
    }

    let probs = (logits / params.temperature).softmax(-1, Kind::Float);
    let (sorted, indices) = probs.sort(-1, true);
    let cumulative = sorted.cumsum(-1, Kind::Float);
    // Drop every token whose preceding mass already exceeds top_p; the most
    // likely token always survives.
    let outside_nucleus = (&cumulative - &sorted).gt(params.top_p);
    let kept = sorted.masked_fill(&outside_nucleus, 0.0);
    let choice = kept.multinomial(1, false);
    indices.gather(-1, &choice, false).int64_value(&[0])
}

impl LoadedModel for TorchModel {
    fn apply_chat_template(&self, messages: &[ChatMessage]) -> Result<String, ServiceError> {
        template::apply_chat_template(self.chat_template.as_deref(), messages)
    }

    fn encode(&self, prompt: &str) -> Result<Vec<u32>, ServiceError> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String, ServiceError> {
        self.tokenizer
            .decode(ids, skip_special_tokens)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))
    }

    fn generate(
        &self,
        prompt_ids: &[u32],
        params: &SamplingParams,
        on_token: &mut dyn FnMut(u32) -> ControlFlow<()>,
    ) -> Result<Vec<u32>, ServiceError> {
        let mut ids: Vec<i64> = prompt_ids.iter().map(|&id| id as i64).collect();
        if ids.is_empty() {
            ids.push(self.eos_token_id.unwrap_or(0) as i64);
        }
        let prompt_len = ids.len();

        no_grad(|| {
            let module = self.module.lock();
            decode_loop(&mut ids, params, self.eos_token_id, on_token, |context| {
                let logits = self.next_logits(&module, context)?;
                Ok(sample_next(&logits, params))
            })
        })?;

        Ok(ids[prompt_len..].iter().map(|&id| id as u32).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(temperature: f64, top_p: f64) -> SamplingParams {
        SamplingParams {
            max_new_tokens: 8,
            temperature,
            top_p,
        }
    }

    fn config(raw: &str) -> TokenizerConfig {
        serde_json::from_str(raw).unwrap()
    }

    #[test]
    fn sampling_is_off_at_zero_temperature() {
        assert!(!params(0.0, 1.0).do_sample());
        assert!(!params(-0.5, 1.0).do_sample());
        assert!(params(0.7, 1.0).do_sample());
    }

    #[test]
    fn greedy_decoding_takes_the_argmax() {
        let logits = Tensor::from_slice(&[0.1f32, 2.5, -1.0, 2.4]);
        for _ in 0..10 {
            assert_eq!(sample_next(&logits, &params(0.0, 0.9)), 1);
        }
    }

    #[test]
    fn zero_top_p_keeps_only_the_most_likely_token() {
        let logits = Tensor::from_slice(&[1.0f32, 0.5, 3.0, 2.9]);
        for _ in 0..20 {
            assert_eq!(sample_next(&logits, &params(1.0, 0.0)), 2);
        }
    }

    #[test]
    fn decode_loop_counts_eos_without_emitting_it() {
        let eos = 2u32;
        let mut script = vec![7i64, 8, 2, 9].into_iter();
        let mut ids = vec![100i64, 101];
        let mut seen = Vec::new();

        decode_loop(
            &mut ids,
            &params(0.0, 1.0),
            Some(eos),
            &mut |id| {
                seen.push(id);
                ControlFlow::Continue(())
            },
            |_| Ok(script.next().unwrap()),
        )
        .unwrap();

        assert_eq!(ids, vec![100, 101, 7, 8, 2]);
        assert_eq!(seen, vec![7, 8]);
    }

    #[test]
    fn decode_loop_stops_on_break_and_token_budget() {
        let mut ids = vec![1i64];
        let mut calls = 0;
        decode_loop(
            &mut ids,
            &params(0.0, 1.0),
            None,
            &mut |_| {
                calls += 1;
                if calls == 3 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            },
            |context| Ok(context.len() as i64 + 10),
        )
        .unwrap();
        assert_eq!(ids, vec![1, 11, 12, 13]);

        let mut ids = vec![1i64];
        decode_loop(
            &mut ids,
            &params(0.0, 1.0),
            None,
            &mut |_| ControlFlow::Continue(()),
            |_| Ok(5),
        )
        .unwrap();
        assert_eq!(ids.len(), 1 + 8);
    }

    #[test]
    fn chat_template_accepts_string_and_named_list() {
        let plain = config(r#"{"chat_template": "{{ '<|im_start|>' }}"}"#);
        assert_eq!(plain.chat_template().as_deref(), Some("{{ '<|im_start|>' }}"));

        let named = config(
            r#"{"chat_template": [
                {"name": "tool_use", "template": "tools"},
                {"name": "default", "template": "chat"}
            ]}"#,
        );
        assert_eq!(named.chat_template().as_deref(), Some("chat"));

        let missing = config(r#"{"chat_template": [{"name": "rag", "template": "x"}]}"#);
        assert_eq!(missing.chat_template(), None);
    }

    #[test]
    fn eos_token_accepts_string_and_added_token_object() {
        assert_eq!(
            config(r#"{"eos_token": "</s>"}"#).eos_token().as_deref(),
            Some("</s>")
        );
        assert_eq!(
            config(r#"{"eos_token": {"content": "<|im_end|>", "lstrip": false}}"#)
                .eos_token()
                .as_deref(),
            Some("<|im_end|>")
        );
        assert_eq!(config("{}").eos_token(), None);
    }

    #[test]
    fn truncation_ignores_sentinel_model_max_length() {
        assert_eq!(config(r#"{"model_max_length": 1e30}"#).truncation_length(2048), 2048);
        assert_eq!(config(r#"{"model_max_length": 1024}"#).truncation_length(2048), 1024);
        assert_eq!(config(r#"{"model_max_length": 0}"#).truncation_length(2048), 2048);
        assert_eq!(config("{}").truncation_length(512), 512);
    }

    #[test]
    fn unreadable_tokenizer_config_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokenizer_config.json");
        fs::write(&path, "not json").unwrap();

        let config = TokenizerConfig::read(Some(&path));
        assert_eq!(config.chat_template(), None);
        assert_eq!(config.truncation_length(64), 64);
    }

    #[test]
    fn find_module_prefers_known_names_then_sorted_scan() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("zeta.pt"), b"").unwrap();
        fs::write(dir.path().join("alpha.ts"), b"").unwrap();
        fs::write(dir.path().join("weights.bin"), b"").unwrap();
        assert_eq!(find_module(dir.path()).unwrap(), dir.path().join("alpha.ts"));

        fs::write(dir.path().join("model.pt"), b"").unwrap();
        assert_eq!(find_module(dir.path()).unwrap(), dir.path().join("model.pt"));
    }

    #[test]
    fn find_module_fails_without_torchscript_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("model.safetensors"), b"").unwrap();
        assert!(matches!(
            find_module(dir.path()),
            Err(ServiceError::Inference(msg)) if msg.contains("no TorchScript module")
        ));
    }
}
