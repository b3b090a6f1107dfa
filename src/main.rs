//! Embedding Server Main
//!
//! Usage: `mrl_embedding_server [config.toml]`

use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

use mrl_embedding_server::{
    start_hyper_http_server, EmbeddingError, EmbeddingService, MockModelLoader, ModelDescriptor,
    ModelLoader, ServerConfig,
};

const DEFAULT_CONFIG_PATH: &str = "config.toml";

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let explicit_path = std::env::args().nth(1);
    let config_path = explicit_path
        .clone()
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    // An explicit path must exist; the default one may be absent
    let (config, used_defaults) = if explicit_path.is_none() && !Path::new(&config_path).exists() {
        (ServerConfig::default(), true)
    } else {
        (ServerConfig::from_file(&config_path)?, false)
    };

    init_tracing(&config.monitoring.log_level);
    if used_defaults {
        warn!("{} not found, using built-in defaults", config_path);
    } else {
        info!("Loaded configuration from {}", config_path);
    }

    config.validate()?;
    let embedding_config = config.embedding_config()?;

    println!("🚀 MRL Embedding Server");
    println!("📊 Log Level: {}", config.monitoring.log_level);
    println!("🧠 Model: {}", embedding_config.model().name);
    println!("===============================");

    let loader = build_loader(&config, embedding_config.model())?;
    let service = Arc::new(EmbeddingService::new(embedding_config, loader));
    service.start()?;

    if config.embedding.preload {
        info!("Preloading embedding model");
        if let Err(e) = service.warm_up().await {
            error!("Model preload failed: {}", e);
            service.shutdown(config.shutdown_timeout()).await?;
            return Err(e.into());
        }
    }

    println!("📡 Ready to accept embedding requests on {}", config.network.bind_address);
    println!("🛑 Press Ctrl+C to stop");

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Shutdown signal received");
    };

    let config = Arc::new(config);
    let served = start_hyper_http_server(Arc::clone(&config), Arc::clone(&service), shutdown).await;

    match service.shutdown(config.shutdown_timeout()).await {
        Ok(processed) => info!(processed, "Embedding service shut down cleanly"),
        Err(e) => warn!("Embedding service shutdown incomplete: {}", e),
    }

    served
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
fn init_tracing(log_level: &str) {
    let level = match log_level.to_lowercase().as_str() {
        level @ ("trace" | "debug" | "info" | "warn" | "error") => level.to_string(),
        _ => "info".to_string(),
    };
    let default_filter = format!("mrl_embedding_server={level},{level}");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with_target(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .init();
}

fn build_loader(
    config: &ServerConfig,
    model: &ModelDescriptor,
) -> Result<Arc<dyn ModelLoader>, EmbeddingError> {
    if model.name == ModelDescriptor::MOCK.name {
        warn!("Using the mock model, embeddings are not semantically meaningful");
        return Ok(Arc::new(MockModelLoader::new()));
    }

    #[cfg(feature = "onnx")]
    {
        Ok(Arc::new(mrl_embedding_server::OnnxModelLoader::new(
            config.embedding.model_dir.clone(),
            config.onnx.clone(),
        )))
    }

    #[cfg(not(feature = "onnx"))]
    {
        let _ = config;
        Err(EmbeddingError::config(format!(
            "Model '{}' needs the onnx feature; rebuild with --features onnx",
            model.name
        )))
    }
}
