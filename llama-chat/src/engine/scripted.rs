//! Deterministic in-process engine for tests.
//!
//! Tokens are single bytes (`256 + byte`) plus a handful of special tokens
//! whose spellings are recognised anywhere in the input. Every context replies
//! with the next scripted string, one byte per sampled token, then emits EOS.

use super::{ContextConfig, FimTokens, InferenceContext, InferenceEngine, Token};
use crate::error::ChatError;
use crate::template::{ChatTemplate, ChatmlTemplate};
use crate::types::SamplingParams;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

pub const BOS: Token = 1;
pub const EOS: Token = 2;
pub const FIM_PRE: Token = 3;
pub const FIM_SUF: Token = 4;
pub const FIM_MID: Token = 5;
pub const FIM_SEP: Token = 6;
pub const IM_START: Token = 7;
pub const IM_END: Token = 8;
const BYTE_BASE: Token = 256;

const SPECIALS: &[(&str, Token)] = &[
    ("<s>", BOS),
    ("</s>", EOS),
    ("<|fim_prefix|>", FIM_PRE),
    ("<|fim_suffix|>", FIM_SUF),
    ("<|fim_middle|>", FIM_MID),
    ("<|file_sep|>", FIM_SEP),
    ("<|im_start|>", IM_START),
    ("<|im_end|>", IM_END),
];

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Every batch passed to `decode`, across all contexts of one engine
#[derive(Debug, Clone, Default)]
pub struct DecodeLog(Arc<Mutex<Vec<Vec<Token>>>>);

impl DecodeLog {
    pub fn batches(&self) -> Vec<Vec<Token>> {
        lock(&self.0).clone()
    }

    pub fn total_tokens(&self) -> usize {
        lock(&self.0).iter().map(Vec::len).sum()
    }

    pub fn clear(&self) {
        lock(&self.0).clear();
    }

    fn record(&self, tokens: &[Token]) {
        lock(&self.0).push(tokens.to_vec());
    }
}

#[derive(Debug, Default)]
pub struct ScriptedEngineBuilder {
    replies: Vec<String>,
    endless: bool,
    fim: bool,
    separator: bool,
    adds_bos: bool,
}

impl ScriptedEngineBuilder {
    /// Queue a reply; once the queue is drained the last reply repeats
    pub fn reply(mut self, text: impl Into<String>) -> Self {
        self.replies.push(text.into());
        self
    }

    /// Never emit EOS; the reply text is repeated forever
    pub fn endless(mut self) -> Self {
        self.endless = true;
        self
    }

    pub fn with_fim(mut self, separator: bool) -> Self {
        self.fim = true;
        self.separator = separator;
        self
    }

    pub fn adds_bos(mut self, adds_bos: bool) -> Self {
        self.adds_bos = adds_bos;
        self
    }

    pub fn build(self) -> ScriptedEngine {
        ScriptedEngine {
            replies: Arc::new(Mutex::new(self.replies.into_iter().collect())),
            last_reply: Arc::new(Mutex::new(String::new())),
            endless: self.endless,
            fim: self.fim,
            separator: self.separator,
            adds_bos: self.adds_bos,
            log: DecodeLog::default(),
            fail_after: Arc::new(Mutex::new(None)),
            template: ChatmlTemplate,
        }
    }
}

pub struct ScriptedEngine {
    replies: Arc<Mutex<VecDeque<String>>>,
    last_reply: Arc<Mutex<String>>,
    endless: bool,
    fim: bool,
    separator: bool,
    adds_bos: bool,
    log: DecodeLog,
    /// Successful decode calls left before one fails
    fail_after: Arc<Mutex<Option<usize>>>,
    template: ChatmlTemplate,
}

impl ScriptedEngine {
    pub fn builder() -> ScriptedEngineBuilder {
        ScriptedEngineBuilder::default()
    }

    /// Engine that always answers `reply`
    pub fn replying(reply: impl Into<String>) -> Self {
        Self::builder().reply(reply).build()
    }

    pub fn decode_log(&self) -> DecodeLog {
        self.log.clone()
    }

    /// Let `calls` more decode calls succeed, then fail the next one
    pub fn fail_decode_after(&self, calls: usize) {
        *lock(&self.fail_after) = Some(calls);
    }
}

impl InferenceEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted.gguf"
    }

    fn new_context(&self, config: &ContextConfig) -> Result<Box<dyn InferenceContext>, ChatError> {
        if config.n_ctx == 0 || config.n_batch == 0 {
            return Err(ChatError::context_init("empty context"));
        }
        Ok(Box::new(ScriptedContext {
            capacity: config.n_ctx as usize,
            n_batch: config.n_batch as usize,
            n_past: 0,
            pending: VecDeque::new(),
            reply_source: ReplySource {
                replies: self.replies.clone(),
                last_reply: self.last_reply.clone(),
            },
            endless: self.endless,
            log: self.log.clone(),
            fail_after: self.fail_after.clone(),
        }))
    }

    fn tokenize(&self, text: &str, add_special: bool) -> Result<Vec<Token>, ChatError> {
        let mut tokens = Vec::with_capacity(text.len() + 1);
        if add_special && self.adds_bos {
            tokens.push(BOS);
        }
        let bytes = text.as_bytes();
        let mut i = 0;
        'outer: while i < bytes.len() {
            for (spelling, token) in SPECIALS {
                if bytes[i..].starts_with(spelling.as_bytes()) {
                    tokens.push(*token);
                    i += spelling.len();
                    continue 'outer;
                }
            }
            tokens.push(BYTE_BASE + bytes[i] as Token);
            i += 1;
        }
        Ok(tokens)
    }

    fn token_bytes(&self, token: Token) -> Result<Vec<u8>, ChatError> {
        if (BYTE_BASE..BYTE_BASE + 256).contains(&token) {
            return Ok(vec![(token - BYTE_BASE) as u8]);
        }
        SPECIALS
            .iter()
            .find(|(_, t)| *t == token)
            .map(|(spelling, _)| spelling.as_bytes().to_vec())
            .ok_or_else(|| ChatError::tokenization(format!("unknown token {}", token)))
    }

    fn is_end_of_generation(&self, token: Token) -> bool {
        token == EOS || token == IM_END
    }

    fn template(&self) -> &dyn ChatTemplate {
        &self.template
    }

    fn fim_tokens(&self) -> Result<FimTokens, ChatError> {
        if !self.fim {
            return Err(ChatError::MissingCapability(
                "prefix token is missing.".to_string(),
            ));
        }
        Ok(FimTokens {
            prefix: FIM_PRE,
            suffix: FIM_SUF,
            middle: FIM_MID,
            separator: self.separator.then_some(FIM_SEP),
        })
    }

    fn bos_token(&self) -> Option<Token> {
        self.adds_bos.then_some(BOS)
    }

    fn bos_text(&self) -> String {
        "<s>".to_string()
    }

    fn eos_text(&self) -> String {
        "</s>".to_string()
    }

    fn n_ctx_train(&self) -> u32 {
        4096
    }
}

struct ReplySource {
    replies: Arc<Mutex<VecDeque<String>>>,
    last_reply: Arc<Mutex<String>>,
}

impl ReplySource {
    fn next(&self) -> String {
        let mut last = lock(&self.last_reply);
        if let Some(reply) = lock(&self.replies).pop_front() {
            *last = reply;
        }
        last.clone()
    }
}

struct ScriptedContext {
    capacity: usize,
    n_batch: usize,
    n_past: usize,
    pending: VecDeque<Token>,
    reply_source: ReplySource,
    endless: bool,
    log: DecodeLog,
    fail_after: Arc<Mutex<Option<usize>>>,
}

impl ScriptedContext {
    fn script(&self, reply: &str) -> VecDeque<Token> {
        let mut tokens: VecDeque<Token> = reply
            .bytes()
            .map(|b| BYTE_BASE + b as Token)
            .collect();
        if !self.endless {
            tokens.push_back(EOS);
        }
        tokens
    }
}

impl InferenceContext for ScriptedContext {
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
        if tokens.len() > self.n_batch {
            return Err(ChatError::decoding("batch larger than n_batch"));
        }
        if self.n_past + tokens.len() > self.capacity {
            return Err(ChatError::decoding("KV cache is full"));
        }
        {
            let mut fail_after = lock(&self.fail_after);
            match *fail_after {
                Some(0) => {
                    *fail_after = None;
                    return Err(ChatError::decoding("scripted decode failure"));
                }
                Some(n) => *fail_after = Some(n - 1),
                None => {}
            }
        }
        self.log.record(tokens);
        self.n_past += tokens.len();
        Ok(())
    }

    fn begin_sampling(&mut self, _params: &SamplingParams) {
        let reply = self.reply_source.next();
        self.pending = self.script(&reply);
    }

    fn sample_next(&mut self) -> Result<Token, ChatError> {
        if self.n_past == 0 {
            return Err(ChatError::decoding("nothing decoded yet"));
        }
        if self.endless && self.pending.is_empty() {
            let reply = self.reply_source.next();
            self.pending = self.script(if reply.is_empty() { " " } else { &reply });
        }
        Ok(self.pending.pop_front().unwrap_or(EOS))
    }

    fn clear(&mut self) {
        self.n_past = 0;
        self.pending.clear();
    }
}
