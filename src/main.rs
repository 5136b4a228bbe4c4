// src/main.rs

mod cascade;
mod config;
mod detector;
mod pipeline;
mod preprocessing;
mod recognition;
mod regions;
mod service;
mod types;
mod validator;

use anyhow::Result;
use service::PlateScanService;
use std::path::PathBuf;
use tracing::{error, info};
use types::Config;
use walkdir::WalkDir;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());
    let config = Config::load(&config_path)?;

    tracing_subscriber::fmt()
        .with_env_filter(format!("platescan={},ort=warn", config.logging.level))
        .init();

    info!("🚘 Plate recognition backend {}", types::VERSION);
    info!("✓ Configuration loaded from {}", config_path);

    let input_dir = config.scan.input_dir.clone();
    let service = PlateScanService::new(config)?;

    let images = find_image_files(&input_dir);
    if images.is_empty() {
        error!("No image files found in {}", input_dir);
        return Ok(());
    }

    info!("Found {} image file(s) to analyze", images.len());

    for path in images {
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to read {}: {}", path.display(), e);
                continue;
            }
        };

        info!("Analyzing {} ({} bytes)", path.display(), bytes.len());
        let response = service.analyze(bytes).await;

        let report = serde_json::json!({
            "file": path.display().to_string(),
            "result": response,
        });
        println!("{}", serde_json::to_string(&report)?);
    }

    Ok(())
}

fn find_image_files(input_dir: &str) -> Vec<PathBuf> {
    let image_extensions = ["jpg", "jpeg", "png", "bmp", "webp"];

    let mut images: Vec<PathBuf> = WalkDir::new(input_dir)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| image_extensions.contains(&ext.to_lowercase().as_str()))
                .unwrap_or(false)
        })
        .map(|e| e.into_path())
        .collect();

    images.sort();
    images
}
