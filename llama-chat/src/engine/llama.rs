use super::{ContextConfig, FimTokens, InferenceContext, InferenceEngine, Token};
use crate::error::ChatError;
use crate::template::{ChatTemplate, ChatmlTemplate};
use crate::types::{ChatMessage, SamplingParams};
use llama_common::ValidatedConfig;
use llama_cpp_2::{
    context::{params::LlamaContextParams, LlamaContext},
    llama_backend::LlamaBackend,
    llama_batch::LlamaBatch,
    model::{AddBos, LlamaChatMessage, LlamaChatTemplate, LlamaModel, Special},
    sampling::LlamaSampler,
    token::LlamaToken,
};
use llama_loader::LoadedModel;
use std::num::NonZeroU32;
use std::sync::Arc;
use tracing::{debug, info, warn};

const FIM_PREFIX_SPELLINGS: &[&str] = &["<|fim_prefix|>", "<fim_prefix>", "<fim-prefix>", "<PRE>", "<|fim▁begin|>"];
const FIM_SUFFIX_SPELLINGS: &[&str] = &["<|fim_suffix|>", "<fim_suffix>", "<fim-suffix>", "<SUF>", "<|fim▁hole|>"];
const FIM_MIDDLE_SPELLINGS: &[&str] = &["<|fim_middle|>", "<fim_middle>", "<fim-middle>", "<MID>", "<|fim▁end|>"];
const FIM_SEPARATOR_SPELLINGS: &[&str] = &["<|file_sep|>", "<file_sep>"];

/// The model's own chat template, applied by llama.cpp
pub struct NativeTemplate {
    model: Arc<LlamaModel>,
    template: LlamaChatTemplate,
}

impl ChatTemplate for NativeTemplate {
    fn apply(
        &self,
        messages: &[ChatMessage],
        add_generation_prompt: bool,
    ) -> Result<String, ChatError> {
        let chat_messages = messages
            .iter()
            .map(|m| LlamaChatMessage::new(m.role.as_str().to_string(), m.content.clone()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(ChatError::template)?;
        self.model
            .apply_chat_template(&self.template, &chat_messages, add_generation_prompt)
            .map_err(ChatError::template)
    }

    fn name(&self) -> &str {
        "native"
    }
}

/// [`InferenceEngine`] backed by a GGUF model in llama.cpp
pub struct LlamaEngine {
    model: Arc<LlamaModel>,
    backend: Arc<LlamaBackend>,
    template: Box<dyn ChatTemplate>,
    fim: Result<FimTokens, String>,
    adds_bos: bool,
    name: String,
}

impl LlamaEngine {
    pub fn new(loaded: LoadedModel, backend: Arc<LlamaBackend>) -> Self {
        let model = Arc::new(loaded.model);
        let template = Self::select_template(&model);
        let fim = Self::detect_fim_tokens(&model);
        let adds_bos = Self::detect_adds_bos(&model);
        info!(
            "Engine ready for {}: template {}, FIM {}, BOS {}",
            loaded.metadata.filename,
            template.name(),
            if fim.is_ok() { "available" } else { "unavailable" },
            adds_bos
        );
        Self {
            model,
            backend,
            template,
            fim,
            adds_bos,
            name: loaded.metadata.filename,
        }
    }

    pub fn model(&self) -> &LlamaModel {
        &self.model
    }

    // The fallback is chosen once at load; a template that renders a sample
    // conversation is trusted for the lifetime of the engine.
    fn select_template(model: &Arc<LlamaModel>) -> Box<dyn ChatTemplate> {
        let template = match model.chat_template(None) {
            Ok(template) => template,
            Err(e) => {
                warn!("Model has no chat template ({}), falling back to ChatML", e);
                return Box::new(ChatmlTemplate);
            }
        };
        let native = NativeTemplate {
            model: model.clone(),
            template,
        };
        let sample = [ChatMessage::system("s"), ChatMessage::user("u")];
        match native.apply(&sample, true) {
            Ok(_) => Box::new(native),
            Err(e) => {
                warn!("Model chat template cannot be applied ({}), falling back to ChatML", e);
                Box::new(ChatmlTemplate)
            }
        }
    }

    fn single_token(model: &LlamaModel, spellings: &[&str]) -> Option<Token> {
        spellings.iter().find_map(|spelling| {
            match model.str_to_token(spelling, AddBos::Never) {
                Ok(tokens) if tokens.len() == 1 => Some(tokens[0].0),
                _ => None,
            }
        })
    }

    fn detect_fim_tokens(model: &LlamaModel) -> Result<FimTokens, String> {
        let prefix = Self::single_token(model, FIM_PREFIX_SPELLINGS)
            .ok_or_else(|| "prefix token is missing.".to_string())?;
        let suffix = Self::single_token(model, FIM_SUFFIX_SPELLINGS)
            .ok_or_else(|| "suffix token is missing.".to_string())?;
        let middle = Self::single_token(model, FIM_MIDDLE_SPELLINGS)
            .ok_or_else(|| "middle token is missing.".to_string())?;
        Ok(FimTokens {
            prefix,
            suffix,
            middle,
            separator: Self::single_token(model, FIM_SEPARATOR_SPELLINGS),
        })
    }

    fn detect_adds_bos(model: &LlamaModel) -> bool {
        let with = model.str_to_token("a", AddBos::Always).map(|t| t.len());
        let without = model.str_to_token("a", AddBos::Never).map(|t| t.len());
        matches!((with, without), (Ok(a), Ok(b)) if a > b)
    }

    fn token_text(&self, token: LlamaToken) -> String {
        self.model
            .token_to_bytes(token, Special::Tokenize)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default()
    }
}

impl InferenceEngine for LlamaEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn new_context(&self, config: &ContextConfig) -> Result<Box<dyn InferenceContext>, ChatError> {
        config.validate().map_err(ChatError::context_init)?;
        debug!(
            "Creating context: n_ctx {}, n_batch {}",
            config.n_ctx, config.n_batch
        );
        let params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(config.n_ctx))
            .with_n_batch(config.n_batch);
        let ctx = self
            .model
            .new_context(&self.backend, params)
            .map_err(ChatError::context_init)?;

        // SAFETY: the context borrows the model, and LlamaInferenceContext keeps
        // an Arc of that model alive in a field dropped after the context.
        let ctx = unsafe { std::mem::transmute::<LlamaContext<'_>, LlamaContext<'static>>(ctx) };
        let capacity = ctx.n_ctx() as usize;
        Ok(Box::new(LlamaInferenceContext {
            ctx,
            sampler: None,
            model: self.model.clone(),
            n_batch: config.n_batch as usize,
            capacity,
            n_past: 0,
            logits_index: 0,
        }))
    }

    fn tokenize(&self, text: &str, add_special: bool) -> Result<Vec<Token>, ChatError> {
        let add_bos = if add_special {
            AddBos::Always
        } else {
            AddBos::Never
        };
        self.model
            .str_to_token(text, add_bos)
            .map(|tokens| tokens.into_iter().map(|t| t.0).collect())
            .map_err(ChatError::tokenization)
    }

    fn token_bytes(&self, token: Token) -> Result<Vec<u8>, ChatError> {
        self.model
            .token_to_bytes(LlamaToken::new(token), Special::Tokenize)
            .map_err(ChatError::tokenization)
    }

    fn is_end_of_generation(&self, token: Token) -> bool {
        self.model.is_eog_token(LlamaToken::new(token))
    }

    fn template(&self) -> &dyn ChatTemplate {
        self.template.as_ref()
    }

    fn fim_tokens(&self) -> Result<FimTokens, ChatError> {
        self.fim.clone().map_err(ChatError::MissingCapability)
    }

    fn bos_token(&self) -> Option<Token> {
        self.adds_bos.then(|| self.model.token_bos().0)
    }

    fn bos_text(&self) -> String {
        self.token_text(self.model.token_bos())
    }

    fn eos_text(&self) -> String {
        self.token_text(self.model.token_eos())
    }

    fn n_ctx_train(&self) -> u32 {
        self.model.n_ctx_train()
    }
}

struct LlamaInferenceContext {
    // Field order matters: the context and sampler are dropped before the model.
    ctx: LlamaContext<'static>,
    sampler: Option<LlamaSampler>,
    #[allow(dead_code)]
    model: Arc<LlamaModel>,
    n_batch: usize,
    capacity: usize,
    n_past: usize,
    logits_index: i32,
}

// SAFETY: a context is owned by one session and only touched through &mut self
// while that session's lock is held.
unsafe impl Send for LlamaInferenceContext {}

impl LlamaInferenceContext {
    fn build_sampler(params: &SamplingParams) -> LlamaSampler {
        if params.is_greedy() {
            if params.has_repeat_penalty() {
                return LlamaSampler::chain_simple([
                    LlamaSampler::penalties(params.repeat_last_n, params.repeat_penalty, 0.0, 0.0),
                    LlamaSampler::greedy(),
                ]);
            }
            return LlamaSampler::greedy();
        }

        let mut chain = Vec::with_capacity(5);
        if params.has_repeat_penalty() {
            chain.push(LlamaSampler::penalties(
                params.repeat_last_n,
                params.repeat_penalty,
                0.0,
                0.0,
            ));
        }
        chain.push(LlamaSampler::top_k(params.top_k));
        chain.push(LlamaSampler::top_p(params.top_p, params.min_keep));
        chain.push(LlamaSampler::temp(params.temperature));
        chain.push(LlamaSampler::dist(params.seed));
        LlamaSampler::chain_simple(chain)
    }
}

impl InferenceContext for LlamaInferenceContext {
    fn capacity(&self) -> usize {
        self.capacity
    }

    fn used_cells(&self) -> usize {
        self.n_past
    }

    fn max_batch(&self) -> usize {
        self.n_batch
    }

    fn decode(&mut self, tokens: &[Token]) -> Result<(), ChatError> {
        if tokens.is_empty() {
            return Ok(());
        }
        if tokens.len() > self.n_batch {
            return Err(ChatError::decoding(format!(
                "batch of {} tokens exceeds n_batch {}",
                tokens.len(),
                self.n_batch
            )));
        }

        let mut batch = LlamaBatch::new(tokens.len(), 1);
        let last = tokens.len() - 1;
        for (i, token) in tokens.iter().enumerate() {
            batch
                .add(
                    LlamaToken::new(*token),
                    (self.n_past + i) as i32,
                    &[0],
                    i == last,
                )
                .map_err(ChatError::decoding)?;
        }
        self.ctx.decode(&mut batch).map_err(ChatError::decoding)?;

        self.n_past += tokens.len();
        self.logits_index = batch.n_tokens() - 1;
        Ok(())
    }

    fn begin_sampling(&mut self, params: &SamplingParams) {
        self.sampler = Some(Self::build_sampler(params));
    }

    fn sample_next(&mut self) -> Result<Token, ChatError> {
        if self.n_past == 0 {
            return Err(ChatError::decoding("nothing decoded yet"));
        }
        let sampler = self
            .sampler
            .get_or_insert_with(|| Self::build_sampler(&SamplingParams::greedy()));
        Ok(sampler.sample(&self.ctx, self.logits_index).0)
    }

    fn clear(&mut self) {
        self.ctx.clear_kv_cache();
        self.n_past = 0;
        self.logits_index = 0;
        debug!("Context cleared");
    }
}
