use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use animo_core::config::{Config, LoggingConfig};
use animo_render::{AspectRatio, ProgressEvent, RenderRequest};

#[derive(Parser)]
#[command(
    name = "animo",
    about = "Manim animation backend: code generation, chat with previews, and video rendering",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to listen on (default: 8080)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Render a scene file locally
    Render {
        /// Python source containing the scene class
        file: PathBuf,

        /// Scene class to render
        #[arg(long, default_value = animo_render::DEFAULT_CLASS_NAME)]
        class: String,

        /// 16:9, 9:16 or 1:1
        #[arg(long)]
        aspect_ratio: Option<String>,

        /// Print progress lines as they arrive
        #[arg(long)]
        stream: bool,

        /// Name the published artifact
        #[arg(long, default_value = "video-local")]
        name: String,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective configuration
    Show,
    /// Check the configuration for problems
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(|p| PathBuf::from(shellexpand::tilde(&p).as_ref()))
        .unwrap_or_else(Config::default_path);
    let mut config = Config::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    config.apply_env_overrides();

    init_logging(config.logging.as_ref(), cli.verbose);
    tracing::debug!(path = %config_path.display(), "Config loaded");

    match cli.command {
        Commands::Serve { port } => {
            let port = port.unwrap_or_else(|| config.port());
            tracing::info!("Starting Animo on port {port}");
            let state = animo_gateway::GatewayState::from_config(config)?;
            animo_gateway::start_gateway(Arc::new(state), port).await?;
        }
        Commands::Render {
            file,
            class,
            aspect_ratio,
            stream,
            name,
        } => {
            let code = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            render(&config, code, &class, aspect_ratio.as_deref(), stream, name).await?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for warning in &warnings {
                    println!("warning: {warning}");
                }
                for error in &errors {
                    println!("error: {error}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("{} configuration error(s)", errors.len());
                }
                println!("Configuration OK");
            }
        },
    }

    Ok(())
}

async fn render(
    config: &Config,
    code: String,
    class: &str,
    aspect_ratio: Option<&str>,
    stream: bool,
    name: String,
) -> anyhow::Result<()> {
    let renderer = animo_render::renderer_from_config(config)?;
    let request = RenderRequest::new(code, name)
        .with_class_name(Some(class))
        .with_aspect_ratio(AspectRatio::parse(aspect_ratio));

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let mut handle = renderer.submit(request, cancel).await?;

    if stream {
        let mut failed = None;
        while let Some(event) = handle.next_event().await {
            print!("{}", event.to_wire_line());
            if let ProgressEvent::Failed { message } = &event {
                failed = Some(message.clone());
            }
        }
        if let Some(message) = failed {
            anyhow::bail!("render failed: {message}");
        }
        return Ok(());
    }

    let outcome = handle.wait_outcome().await;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    if !outcome.completed {
        anyhow::bail!("render failed");
    }
    Ok(())
}

/// Install the tracing subscriber. `RUST_LOG` takes precedence over config.
fn init_logging(logging: Option<&LoggingConfig>, verbose: bool) {
    let level = if verbose {
        "debug".to_string()
    } else {
        logging
            .and_then(|l| l.level.clone())
            .unwrap_or_else(|| "info".to_string())
    };
    let mut directives = vec![level];
    if let Some(logging) = logging {
        directives.extend(logging.filters.iter().cloned());
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directives.join(",")))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let to_stdout = logging.is_some_and(|l| l.output == "stdout");
    let writer = if to_stdout {
        BoxMakeWriter::new(std::io::stdout)
    } else {
        BoxMakeWriter::new(std::io::stderr)
    };

    if logging.is_some_and(|l| l.format == "json") {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(writer)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .init();
    }
}
