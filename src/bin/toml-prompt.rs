//! toml-prompt CLI tool
//!
//! Command-line interface for decoding prompt documents with toml-prompt.
//!
//! ## Commands
//!
//! - `decode <file>`: Resolve a selector against a prompt file
//! - `read-summary <file>`: Print the fields of a summary blob
//! - `list [dir]`: List prompt files
//! - `hash <file>`: Content hash of a prompt file
//! - `split-lora <file>`: Split a lora list into its high and low parts

use clap::{Parser, Subcommand};
use std::{
    fs::read_to_string,
    io::{self, Read},
    path::{Path, PathBuf},
    sync::Arc,
};
use toml_prompt::{
    codec::{content_hash, list_prompt_files, summary::split_lora_list, PromptFile, Summary},
    config::{current_config, install_provider, TomlConfigProvider},
    decode::decode_prompt,
};

#[derive(Parser)]
#[command(name = "toml-prompt")]
#[command(author, version, about = "Resolve nested TOML/YAML prompt documents into prompt text", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, default_value = "toml-prompt.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve a selector against a prompt file
    Decode {
        /// Prompt file, relative to the configured prompts dir
        file: PathBuf,

        /// Selector markup
        #[arg(short, long, conflicts_with = "selector_file")]
        selector: Option<String>,

        /// File holding the selector markup
        #[arg(long)]
        selector_file: Option<PathBuf>,

        /// Random seed
        #[arg(long)]
        seed: Option<u64>,

        /// Print the summary blob instead of the separate fields
        #[arg(long)]
        summary: bool,
    },

    /// Print the fields of a summary blob (`-` reads stdin)
    ReadSummary {
        file: PathBuf,

        /// Print the exports as JSON only
        #[arg(long)]
        json: bool,
    },

    /// List prompt files
    List {
        /// Directory to list, defaults to the configured prompts dir
        dir: Option<PathBuf>,
    },

    /// Content hash of a prompt file
    Hash { file: PathBuf },

    /// Split a lora list (`-` reads stdin) into its high and low parts
    SplitLora { file: PathBuf },
}

fn read_input(path: &Path) -> io::Result<String> {
    if path == Path::new("-") {
        let mut text = String::new();
        io::stdin().read_to_string(&mut text)?;
        Ok(text)
    } else {
        read_to_string(path)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    install_provider(Arc::new(TomlConfigProvider::new(cli.config.clone())));
    let config = current_config()?;

    match cli.command {
        Commands::Decode {
            file,
            selector,
            selector_file,
            seed,
            summary,
        } => {
            let selector = match (selector, selector_file.or(config.selector_file.clone())) {
                (Some(selector), _) => selector,
                (None, Some(path)) => read_input(&path)?,
                (None, None) => read_input(Path::new("-"))?,
            };
            let seed = seed.or(config.seed).unwrap_or_default();
            let prompt_file = PromptFile::open(config.resolve_path(&file))?;
            let out = decode_prompt(prompt_file.load()?, &selector, seed, config.decode)?;
            if summary {
                println!("{}", out.summary_text());
            } else {
                println!("positive: {}", out.positive);
                println!("negative: {}", out.negative);
                println!("seed: {}", out.seed);
                println!("loras:\n{}", out.lora_list);
                println!("exports: {}", out.exports_json()?);
            }
        }
        Commands::ReadSummary { file, json } => {
            let summary = Summary::decode(&read_input(&file)?)?;
            if json {
                println!("{}", summary.exports_json()?);
            } else {
                println!("positive: {}", summary.positive);
                println!("negative: {}", summary.negative);
                println!("seed: {}", summary.seed);
                println!("loras:\n{}", summary.lora_list);
                println!("exports: {}", summary.exports_json()?);
            }
        }
        Commands::List { dir } => {
            let dir = dir
                .or(config.prompts_dir.clone())
                .unwrap_or_else(|| PathBuf::from("."));
            for file in list_prompt_files(&dir)? {
                println!("{file}");
            }
        }
        Commands::Hash { file } => {
            println!("{}", content_hash(config.resolve_path(&file))?);
        }
        Commands::SplitLora { file } => {
            let (high, low) = split_lora_list(&read_input(&file)?);
            println!("---- High ----\n{high}\n---- Low ----\n{low}");
        }
    }

    Ok(())
}
