use crate::error::ModelError;
use crate::types::{LoadedModel, ModelConfig, ModelMetadata, ResolvedModel};
use llama_common::ValidatedConfig;
use llama_cpp_2::{
    llama_backend::LlamaBackend,
    model::{params::LlamaModelParams, LlamaModel},
    send_logs_to_tracing, LogOptions,
};
use std::ffi::c_void;
use std::os::raw::c_char;
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tracing::info;

/// llama.cpp allows one backend initialisation per process; every model shares it
static GLOBAL_BACKEND: OnceLock<Result<Arc<LlamaBackend>, String>> = OnceLock::new();

/// Get or initialise the process-wide llama backend
pub fn global_backend() -> Result<Arc<LlamaBackend>, ModelError> {
    let result = GLOBAL_BACKEND.get_or_init(|| {
        LlamaBackend::init()
            .map(Arc::new)
            .map_err(|e| format!("Backend init failed: {}", e))
    });

    match result {
        Ok(backend) => Ok(backend.clone()),
        Err(e) => Err(ModelError::LoadingFailed(e.clone())),
    }
}

extern "C" fn null_log_callback(_level: i32, _text: *const c_char, _user_data: *mut c_void) {}

/// Route llama.cpp's log output into tracing, or silence it
pub fn configure_native_logging(debug: bool) {
    if debug {
        send_logs_to_tracing(LogOptions::default());
        return;
    }
    // SAFETY: llama_log_set only stores the callback pointer; the callback
    // is a plain function that ignores its arguments.
    unsafe {
        extern "C" {
            fn llama_log_set(
                log_callback: Option<extern "C" fn(i32, *const c_char, *mut c_void)>,
                user_data: *mut c_void,
            );
        }
        llama_log_set(Some(null_log_callback), std::ptr::null_mut());
    }
}

/// Loads resolved GGUF files through the shared backend
pub struct ModelLoader {
    backend: Arc<LlamaBackend>,
    config: ModelConfig,
}

impl ModelLoader {
    pub fn new(config: ModelConfig) -> Result<Self, ModelError> {
        config
            .validate()
            .map_err(|e| ModelError::InvalidConfig(e.to_string()))?;
        configure_native_logging(config.debug);
        Ok(Self {
            backend: global_backend()?,
            config,
        })
    }

    pub fn backend(&self) -> Arc<LlamaBackend> {
        self.backend.clone()
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn model_params(config: &ModelConfig) -> LlamaModelParams {
        LlamaModelParams::default()
            .with_n_gpu_layers(config.n_gpu_layers)
            .with_use_mlock(config.use_mlock)
    }

    /// Load the file behind `resolved` on a blocking thread
    pub async fn load(&self, resolved: &ResolvedModel) -> Result<LoadedModel, ModelError> {
        let start_time = Instant::now();
        let path = resolved.path.clone();
        info!("Loading model from {} ({})", path.display(), resolved.source);

        let size_bytes = tokio::fs::metadata(&path)
            .await
            .map_err(|e| ModelError::not_found(format!("{}: {}", path.display(), e)))?
            .len();

        let backend = self.backend.clone();
        let config = self.config.clone();
        let load_path = path.clone();
        let model = tokio::task::spawn_blocking(move || {
            LlamaModel::load_from_file(&backend, &load_path, &Self::model_params(&config))
        })
        .await
        .map_err(|e| ModelError::LoadingFailed(format!("loader task failed: {}", e)))?
        .map_err(|e| {
            ModelError::LoadingFailed(format!(
                "Failed to load model from {}: {}",
                path.display(),
                e
            ))
        })?;

        let load_time = start_time.elapsed();
        let context_size = model.n_ctx_train() as usize;
        info!(
            "Model loaded in {:.2?}, trained context {} tokens",
            load_time, context_size
        );

        Ok(LoadedModel {
            model,
            metadata: ModelMetadata {
                source: resolved.source.clone(),
                filename: resolved.file_name(),
                size_bytes,
                load_time,
                cache_hit: resolved.cache_hit,
                context_size,
            },
            path,
        })
    }
}
