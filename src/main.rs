//! wsi-gleason - Gleason grading maps for Whole Slide Images.
//!
//! This binary parses the configuration, starts the model process and runs
//! every input slide through the pipeline.

use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wsi_gleason::{
    config::Config,
    expand_inputs,
    inference::{
        CommandClassifier, ModelLaunch, ModelManifest, PreprocessChain, StainNormalization,
    },
    SlideController,
};

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();
    init_logging(config.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    run(config).await
}

async fn run(config: Config) -> ExitCode {
    let inputs = match expand_inputs(&config.input) {
        Ok(inputs) if !inputs.is_empty() => inputs,
        Ok(_) => {
            error!("No input slides found");
            return ExitCode::FAILURE;
        }
        Err(e) => {
            error!("Failed to list inputs: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = std::fs::create_dir_all(&config.output) {
        error!("Failed to create {}: {}", config.output.display(), e);
        return ExitCode::FAILURE;
    }

    // Without --cache the tile caches live in a temporary root removed at exit
    let (cache_root, temp_cache) = match &config.cache {
        Some(root) => (root.clone(), None),
        None => match tempfile::Builder::new().prefix("tmp.wsi-gleason.").tempdir() {
            Ok(dir) => (dir.path().to_path_buf(), Some(dir)),
            Err(e) => {
                error!("Failed to create a temporary cache: {}", e);
                return ExitCode::FAILURE;
            }
        },
    };
    if let Err(e) = std::fs::create_dir_all(&cache_root) {
        error!("Failed to create {}: {}", cache_root.display(), e);
        return ExitCode::FAILURE;
    }

    info!("Configuration:");
    info!("  Inputs: {} slide(s)", inputs.len());
    info!("  Output: {}", config.output.display());
    info!(
        "  Cache: {}{}",
        cache_root.display(),
        if temp_cache.is_some() { " (temporary)" } else { "" }
    );
    info!("  Model: {} ({})", config.model.display(), config.model_family);
    info!("  Device: {}", config.device);
    info!(
        "  Tiles: {}px, batch {}, {} concurrent",
        config.tile_size,
        config.batch_size,
        config.tile_concurrency()
    );
    if config.generate_overlay {
        info!("  Overlay: weight {}", config.blend_weight);
    }

    let chain = match build_chain(&config) {
        Ok(chain) => chain,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let manifest = match ModelManifest::load(&config.model) {
        Ok(manifest) => manifest,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    let launch = ModelLaunch {
        program: config.model_command.clone(),
        args: config.model_args.clone(),
        family: config.model_family,
        device: config.device,
        manifest,
    };
    let classifier = match tokio::task::spawn_blocking(move || CommandClassifier::spawn(&launch))
        .await
    {
        Ok(Ok(classifier)) => Arc::new(classifier),
        Ok(Err(e)) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
        Err(e) => {
            error!("Model startup failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let controller = SlideController::new(config.pipeline_config(&cache_root), classifier, chain);
    let report = controller.run_batch(&inputs).await;

    info!("");
    for slide in &report.slides {
        if slide.is_success() {
            info!("  {}", slide);
        } else {
            error!("  {}", slide);
        }
    }

    if report.failed() > 0 && temp_cache.is_some() {
        warn!("Caches of failed slides were temporary; pass --cache to resume them later");
    }

    if report.failed() == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Build the preprocessing chain, loading the stain reference if configured.
fn build_chain(config: &Config) -> Result<PreprocessChain, String> {
    let stain = match &config.stain_reference {
        Some(path) => {
            let reference = image::open(path)
                .map_err(|e| format!("Failed to load stain reference {}: {}", path.display(), e))?
                .to_rgb8();
            Some(StainNormalization::from_reference(&reference))
        }
        None => None,
    };
    Ok(PreprocessChain::standard(
        stain,
        config.model_family.input_size(),
    ))
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "wsi_gleason=debug"
    } else {
        "wsi_gleason=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
