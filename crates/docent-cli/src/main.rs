use std::path::PathBuf;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use docent_core::{load_config, GenerationOptions};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod bootstrap;

use bootstrap::bootstrap;

#[derive(Parser)]
#[command(name = "docent", version, about = "Documentation assistant for Slack")]
struct Cli {
    #[arg(
        long,
        default_value = "~/.docent",
        help = "Config root directory (contains config/, data/ and logs/)"
    )]
    config_root: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Start the HTTP API server")]
    Serve {
        #[arg(long, help = "Override the configured port")]
        port: Option<u16>,
    },
    #[command(about = "Ask a question from the command line")]
    Ask {
        query: String,
        #[arg(long, help = "Skip document retrieval")]
        no_rag: bool,
        #[arg(long, help = "Prompt template to use")]
        template: Option<String>,
        #[arg(long, help = "Record the exchange under this conversation id")]
        conversation: Option<String>,
        #[arg(long, help = "Generator type: default, rag or chat")]
        generator: Option<String>,
    },
    #[command(subcommand, about = "Feedback reports")]
    Feedback(FeedbackCommands),
    #[command(about = "Validate config files")]
    Validate,
}

#[derive(Subcommand)]
enum FeedbackCommands {
    #[command(about = "Aggregate counts for the last N days")]
    Stats {
        #[arg(long)]
        days: Option<u32>,
    },
    #[command(about = "Counts grouped by skill")]
    BySkill {
        #[arg(long)]
        days: Option<u32>,
    },
    #[command(about = "Export raw feedback records")]
    Export {
        #[arg(long)]
        days: Option<u32>,
        #[arg(long, default_value = "json", help = "json or csv")]
        format: String,
        #[arg(long, short = 'o', help = "Write to a file instead of stdout")]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut cli = Cli::parse();

    // Expand ~ to home directory
    if cli.config_root.starts_with("~") {
        if let Some(home) = std::env::var_os("HOME") {
            cli.config_root = PathBuf::from(home).join(
                cli.config_root
                    .strip_prefix("~")
                    .unwrap_or(&cli.config_root),
            );
        }
    }

    let log_dir = cli.config_root.join("logs");
    std::fs::create_dir_all(&log_dir)?;
    let file_appender = tracing_appender::rolling::daily(&log_dir, "docent.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .init();

    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        println!();
        return Ok(());
    };

    match command {
        Commands::Validate => {
            let config = load_config(&cli.config_root.join("config"))?;
            println!(
                "Config valid. backend {} ({}), {} custom templates, retrieval {}.",
                config.backend.id,
                config.backend.backend_type.as_str(),
                config.templates.len(),
                if config.retrieval.enabled { "on" } else { "off" }
            );
        }
        Commands::Serve { port } => {
            let (config, state) = bootstrap(&cli.config_root).await?;
            let addr = match port {
                Some(port) => bind_with_port(&config.server.bind, port),
                None => config.server.bind.clone(),
            };
            docent_server::serve(state, &addr).await?;
        }
        Commands::Ask {
            query,
            no_rag,
            template,
            conversation,
            generator,
        } => {
            let (config, state) = bootstrap(&cli.config_root).await?;
            let generator_type = generator
                .unwrap_or_else(|| config.generation.default_generator.as_str().to_string());
            let generator = state.generators.get_generator(&generator_type, None)?;
            let options = GenerationOptions {
                template_type: template,
                max_tokens: Some(config.generation.max_tokens),
                max_context_chunks: Some(config.generation.max_context_chunks),
                ..GenerationOptions::default()
            };
            let result = generator
                .generate_response(
                    &query,
                    None,
                    conversation.as_deref(),
                    config.generation.use_rag && !no_rag,
                    &options,
                )
                .await?;
            println!("{}", result.response_text);
            if let Some(chunks) = result.context_chunks.filter(|c| !c.is_empty()) {
                println!();
                for chunk in chunks {
                    println!("  - {}", chunk.source.as_deref().unwrap_or("(unknown)"));
                }
            }
        }
        Commands::Feedback(cmd) => {
            let (config, state) = bootstrap(&cli.config_root).await?;
            let default_days = config.feedback.default_days;
            match cmd {
                FeedbackCommands::Stats { days } => {
                    let stats = state
                        .feedback
                        .get_feedback_stats(days.unwrap_or(default_days))
                        .await;
                    println!("{}", serde_json::to_string_pretty(&stats)?);
                }
                FeedbackCommands::BySkill { days } => {
                    let skills = state
                        .feedback
                        .get_feedback_by_skill(days.unwrap_or(default_days))
                        .await;
                    if skills.is_empty() {
                        println!("No feedback in window.");
                    }
                    for s in skills {
                        println!(
                            "{:<24} total {:>4}  +{:<4} -{:<4} {:>5.1}%",
                            s.skill, s.total, s.positive, s.negative, s.positive_percentage
                        );
                    }
                }
                FeedbackCommands::Export {
                    days,
                    format,
                    output,
                } => {
                    let body = state
                        .feedback
                        .export_feedback_data(days.unwrap_or(default_days), &format)
                        .await?;
                    match output {
                        Some(path) => {
                            std::fs::write(&path, body)?;
                            println!("Wrote {}", path.display());
                        }
                        None => print!("{body}"),
                    }
                }
            }
        }
    }

    Ok(())
}

/// Replace the port of a `host:port` bind address.
fn bind_with_port(bind: &str, port: u16) -> String {
    let host = bind.rsplit_once(':').map_or(bind, |(host, _)| host);
    format!("{host}:{port}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_override_keeps_host() {
        assert_eq!(bind_with_port("127.0.0.1:3000", 8080), "127.0.0.1:8080");
        assert_eq!(bind_with_port("0.0.0.0:3000", 9), "0.0.0.0:9");
        assert_eq!(bind_with_port("localhost", 4000), "localhost:4000");
    }

    #[test]
    fn cli_parses_feedback_export() {
        let cli = Cli::try_parse_from([
            "docent",
            "feedback",
            "export",
            "--days",
            "7",
            "--format",
            "csv",
        ])
        .expect("parse");
        match cli.command {
            Some(Commands::Feedback(FeedbackCommands::Export { days, format, output })) => {
                assert_eq!(days, Some(7));
                assert_eq!(format, "csv");
                assert!(output.is_none());
            }
            _ => panic!("unexpected command"),
        }
    }
}
