#[cfg(feature = "cli")]
mod cli {
    use anyhow::{Context, Result};
    use clap::{Parser, Subcommand};
    use inference_host::model_runtime::platform::{self, HostProbe, SystemProbe};
    use inference_host::model_runtime::{ChatMessage, FormatDetector, InferenceRequest};
    use inference_host::{metrics, telemetry};
    use inference_host::{BackendKind, DeviceRequest, HostConfig, LoadOptions, LoadRequest, ModelManager};
    use std::path::PathBuf;
    use tracing::info;

    #[derive(Parser)]
    #[command(name = "inference-host")]
    #[command(about = "Load, inspect and unload local LLM runtimes")]
    #[command(version)]
    struct Cli {
        /// Debug-level logs for this crate
        #[arg(short, long, global = true)]
        verbose: bool,
        #[command(subcommand)]
        command: Commands,
    }

    #[derive(Subcommand)]
    enum Commands {
        /// Load a model and hold it until Ctrl-C
        Load {
            /// Logical name, `owner/name` hub id, or hub-native `name[:tag]`
            model: String,
            #[arg(long, default_value = "auto")]
            backend: BackendKind,
            #[arg(long)]
            path: Option<PathBuf>,
            #[arg(long, default_value = "auto")]
            device: DeviceRequest,
            /// Backend options as a JSON object
            #[arg(long)]
            options: Option<String>,
            /// Send one prompt, print the reply and unload
            #[arg(long)]
            prompt: Option<String>,
        },
        /// Print artifact metadata without loading
        Metadata {
            model: String,
            #[arg(long, default_value = "auto")]
            backend: BackendKind,
            #[arg(long)]
            path: Option<PathBuf>,
        },
        /// Detect the backend for a file or directory
        Detect { path: PathBuf },
        /// Show device resolution for a backend on this host
        Device {
            #[arg(long, default_value = "llama.cpp")]
            backend: BackendKind,
            #[arg(long, default_value = "auto")]
            device: DeviceRequest,
        },
    }

    fn build_request(
        model: String,
        backend: BackendKind,
        path: Option<PathBuf>,
        device: DeviceRequest,
        options: Option<&str>,
    ) -> Result<LoadRequest> {
        let options: LoadOptions = match options {
            Some(json) => serde_json::from_str(json).context("--options must be a JSON object")?,
            None => LoadOptions::default(),
        };
        let mut request = LoadRequest::new(model)
            .with_backend(backend)
            .with_device(device)
            .with_options(options);
        if let Some(path) = path {
            request = request.with_path(path);
        }
        Ok(request)
    }

    pub async fn run() -> Result<()> {
        let cli = Cli::parse();
        telemetry::init_tracing(cli.verbose);
        let config = HostConfig::from_env()?;

        match cli.command {
            Commands::Load { model, backend, path, device, options, prompt } => {
                config.print_config();
                let manager = ModelManager::new(&config);
                let request = build_request(model, backend, path, device, options.as_deref())?;
                manager.load(request).await?;
                println!("{}", serde_json::to_string_pretty(&manager.get_info())?);

                match prompt {
                    Some(text) => {
                        let reply = manager
                            .generate(InferenceRequest {
                                messages: vec![ChatMessage { role: "user".into(), content: text }],
                                max_tokens: 512,
                                temperature: 0.7,
                            })
                            .await?;
                        println!("{}", reply.content);
                    }
                    None => {
                        info!("Model loaded, press Ctrl-C to unload");
                        tokio::signal::ctrl_c().await?;
                    }
                }
                manager.unload();
                print!("{}", metrics::gather_text());
            }
            Commands::Metadata { model, backend, path } => {
                let manager = ModelManager::new(&config);
                let request = build_request(model, backend, path, DeviceRequest::Auto, None)?;
                match manager.get_metadata(&request).await {
                    Some(meta) => println!("{}", serde_json::to_string_pretty(&meta)?),
                    None => println!("No local artifact for {}", request.model_name),
                }
            }
            Commands::Detect { path } => match FormatDetector::detect_backend(&path) {
                Some(kind) => println!("{}", kind),
                None => anyhow::bail!("Could not detect model type: {}", path.display()),
            },
            Commands::Device { backend, device } => {
                let caps = SystemProbe::new().capabilities();
                let resolution = platform::resolve(device, backend, &caps);
                println!("{}", serde_json::to_string_pretty(&caps)?);
                println!(
                    "{} -> {} (compatible: {}, {})",
                    backend, resolution.device, resolution.compatible, resolution.reason
                );
            }
        }
        Ok(())
    }
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cli::run().await
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
