mod analyzer;
mod config;
mod db;
mod github;
mod http;
mod orchestrator;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use analyzer::OpenAiGenerator;
use config::Config;
use db::Database;
use github::{parse_repo_url, GitHubClient};
use orchestrator::Orchestrator;

#[derive(Parser)]
#[command(name = "repolens")]
#[command(about = "Analyze GitHub repositories with LLM-generated summaries and alternatives")]
#[command(after_help = "\x1b[36mExamples:\x1b[0m
  repolens serve                       # Start the web service on port 8080
  repolens analyze octocat/Hello-World # One-shot analysis from the terminal
  repolens stats                       # Show stored row counts")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the web service
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8080")]
        port: u16,

        /// Database file path (default: platform data dir)
        #[arg(long)]
        db: Option<PathBuf>,

        /// Log request timing and API calls
        #[arg(long)]
        debug: bool,
    },

    /// Analyze one repository and print the result
    Analyze {
        /// Repository URL or "owner/name"
        repo: String,

        /// Refetch metadata and regenerate even if cached
        #[arg(long)]
        refresh: bool,

        /// Log request timing and API calls
        #[arg(long)]
        debug: bool,
    },

    /// Show stored row counts
    Stats,
}

fn build_orchestrator(debug: bool) -> Orchestrator {
    let github_token = Config::github_token();
    if github_token.is_none() {
        eprintln!("\x1b[33m..\x1b[0m No GitHub token found. Rate limit: 60 req/hour");
        eprintln!("  Set GITHUB_TOKEN or run: gh auth login");
    }

    let openai_key = Config::openai_api_key().unwrap_or_default();
    if openai_key.is_empty() {
        eprintln!("\x1b[33m..\x1b[0m OPENAI_API_KEY not set; analyses will use synthesized fallbacks");
    }

    let provider = Arc::new(GitHubClient::new_with_options(github_token, debug));
    let generator = Arc::new(OpenAiGenerator::new(openai_key, debug));
    Orchestrator::new(provider, generator, debug)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Serve { port, db, debug }) => {
            let db_path = match db {
                Some(path) => path,
                None => Config::db_path()?,
            };
            // Open once up front so schema problems surface before binding
            Database::open(&db_path)?;
            let orch = build_orchestrator(debug);
            http::start_server(db_path, port, orch).await
        }
        Some(Commands::Analyze { repo, refresh, debug }) => {
            analyze_one(&repo, refresh, debug).await
        }
        Some(Commands::Stats) => show_stats(),
        None => {
            use clap::CommandFactory;
            Cli::command().print_help()?;
            eprintln!();
            std::process::exit(0);
        }
    }
}

/// One-shot resolve from the terminal
async fn analyze_one(repo: &str, refresh: bool, debug: bool) -> Result<()> {
    let Some((owner, name)) = parse_repo_url(repo) else {
        eprintln!("\x1b[31mx\x1b[0m Not a GitHub repository URL: {}", repo);
        std::process::exit(1);
    };

    let db = Database::open(&Config::db_path()?)?;
    let orch = build_orchestrator(debug);

    let (repository, analysis) = match orch.resolve(&db, &owner, &name, refresh).await {
        Ok(result) => result,
        Err(e) => {
            eprintln!("\x1b[31mx\x1b[0m {}", e);
            std::process::exit(1);
        }
    };

    println!(
        "\x1b[1m{}\x1b[0m  \x1b[33m★ {}\x1b[0m  \x1b[36m[{}]\x1b[0m",
        repository.full_name, repository.stars, analysis.category
    );
    if let Some(desc) = &repository.description {
        println!("\x1b[90m{}\x1b[0m", desc);
    }
    println!();
    println!("{}", analysis.summary);

    if !analysis.strengths.is_empty() {
        println!("\n\x1b[32mStrengths\x1b[0m");
        for s in &analysis.strengths {
            println!("  + {}", s);
        }
    }
    if !analysis.considerations.is_empty() {
        println!("\n\x1b[33mConsiderations\x1b[0m");
        for c in &analysis.considerations {
            println!("  - {}", c);
        }
    }
    if !analysis.alternatives.is_empty() {
        println!("\n\x1b[36mAlternatives\x1b[0m");
        for alt in &analysis.alternatives {
            let stars = alt
                .stars
                .map(|s| format!(" (★ {})", s))
                .unwrap_or_default();
            println!("  {}{}  {}", alt.name, stars, alt.url);
            println!("    \x1b[90m{}\x1b[0m", alt.reasoning);
        }
    }

    Ok(())
}

fn show_stats() -> Result<()> {
    let db = Database::open(&Config::db_path()?)?;
    let (repos, analyses) = db.stats()?;
    println!("{} repositories, {} analyses", repos, analyses);
    println!("db: {}", db.path().display());
    Ok(())
}
