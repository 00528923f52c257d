//! CLI binary for the advocacy reply assistant.

mod batch;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tracing_subscriber::EnvFilter;

use advocate_llm::{CostTrackingMiddleware, LlmClient, LoggingMiddleware};
use advocate_pipeline::{
    embedder_from_config, AdvocateConfig, BuiltinCorpus, CorpusHandle, Embedder, HashingEmbedder,
    JsonFileCorpus, Orchestrator, SafetyGate, StrategyCorpus, StrategyRetriever,
};
use advocate_types::{InputKind, Tag, TagCategory, TurnResult};

#[derive(Parser)]
#[command(
    name = "advocate",
    version,
    about = "Drafts persuasive, compassionate replies for animal advocacy conversations"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JSON config file (environment variables still override it)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive session with a rating and critique loop
    Chat {
        /// Your own draft reply to improve, applied to the first comment
        #[arg(long)]
        draft: Option<String>,
    },

    /// Draft a reply to one comment
    Submit {
        /// The comment to respond to
        comment: String,

        /// Your own draft reply to improve
        #[arg(long)]
        draft: Option<String>,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Process comments from a CSV file
    Batch {
        /// CSV with Category and Comment columns
        #[arg(short, long)]
        input: PathBuf,

        /// Category numbers from the listing, e.g. 5,2
        #[arg(long, value_delimiter = ',')]
        categories: Vec<usize>,

        /// Comments to take from each category
        #[arg(long, default_value = "2")]
        per_category: usize,

        /// Directory for the results file
        #[arg(short, long, default_value = ".")]
        output_dir: PathBuf,
    },

    /// Show the safety gate's verdict for a comment, with internal detail
    Gate {
        comment: String,

        #[arg(long)]
        draft: Option<String>,
    },

    /// List the strategy corpus, or rank it against tags
    Corpus {
        /// Tags to rank against, e.g. "theme:naturalistic fallacy,tone:defensive"
        #[arg(long, value_delimiter = ',')]
        query: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = AdvocateConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Chat { draft } => {
            cmd_chat(config, draft).await?;
        }
        Commands::Submit {
            comment,
            draft,
            json,
        } => {
            cmd_submit(config, &comment, draft.as_deref(), json).await?;
        }
        Commands::Batch {
            input,
            categories,
            per_category,
            output_dir,
        } => {
            let (orchestrator, cost) = build_orchestrator(config).await?;
            let opts = batch::BatchOptions {
                input,
                categories,
                per_category,
                output_dir,
            };
            batch::run(&orchestrator, &opts).await?;
            orchestrator.flush_persistence().await;
            print_usage(&cost);
        }
        Commands::Gate { comment, draft } => {
            cmd_gate(&config, &comment, draft.as_deref())?;
        }
        Commands::Corpus { query } => {
            cmd_corpus(&config, &query).await?;
        }
    }

    Ok(())
}

async fn build_orchestrator(
    config: AdvocateConfig,
) -> anyhow::Result<(Orchestrator, CostTrackingMiddleware)> {
    let cost = CostTrackingMiddleware::new();
    let client = LlmClient::from_env()?
        .with_middleware(LoggingMiddleware)
        .with_middleware(cost.clone());
    let orchestrator = Orchestrator::builder(config, Arc::new(client))
        .build()
        .await?;
    Ok((orchestrator, cost))
}

fn print_usage(cost: &CostTrackingMiddleware) {
    let (input, output) = (cost.total_input_tokens(), cost.total_output_tokens());
    if input + output > 0 {
        println!("Tokens: {} in, {} out", input, output);
    }
}

pub(crate) fn print_result(result: &TurnResult) {
    match result {
        TurnResult::Halted { reason, .. } => {
            println!("Can't draft a reply for this one: {}", reason);
            println!("Try adding a bit more context about what was said.");
        }
        TurnResult::Completed {
            reply,
            rationale,
            rebuttal,
            input_kind,
            ..
        } => {
            let heading = match input_kind {
                InputKind::DraftReply => "Here's your improved reply:",
                InputKind::Comment => "Here's a suggested response:",
            };
            println!("{}\n{}\n", heading, reply);
            println!("Why this works:\n{}\n", rationale);
            println!("What a skeptic might say back:\n{}", rebuttal);
        }
    }
}

async fn cmd_submit(
    config: AdvocateConfig,
    comment: &str,
    draft: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    let (orchestrator, cost) = build_orchestrator(config).await?;
    let outcome = orchestrator.submit(comment, draft).await;
    orchestrator.flush_persistence().await;

    let result = match outcome {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(error = %e, "Submission failed");
            anyhow::bail!("{}", e.user_message());
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result);
        print_usage(&cost);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Interactive session
// ---------------------------------------------------------------------------

async fn prompt(lines: &mut Lines<BufReader<Stdin>>, label: &str) -> anyhow::Result<Option<String>> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(label.as_bytes()).await?;
    stdout.flush().await?;
    Ok(lines.next_line().await?.map(|l| l.trim().to_string()))
}

async fn cmd_chat(config: AdvocateConfig, mut draft: Option<String>) -> anyhow::Result<()> {
    let (orchestrator, cost) = build_orchestrator(config).await?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!("Paste a comment to respond to. Commands: /reload (corpus), /quit.");

    loop {
        let Some(comment) = prompt(&mut lines, "\ncomment> ").await? else {
            break;
        };
        match comment.as_str() {
            "" => continue,
            "/quit" | "/exit" => break,
            "/reload" => {
                match orchestrator.corpus().reload().await {
                    Ok(n) => println!("Reloaded {} strategies.", n),
                    Err(e) => println!("Reload failed, keeping current corpus: {}", e),
                }
                continue;
            }
            _ => {}
        }

        let outcome = orchestrator.submit(&comment, draft.take().as_deref()).await;
        let mut current = match outcome {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(error = %e, "Turn failed");
                println!("{}", e.user_message());
                continue;
            }
        };
        print_result(&current);

        // Rate-and-revise loop until the user moves on.
        while let TurnResult::Completed {
            session_id,
            turn_id,
            ..
        } = current
        {
            let Some(raw) =
                prompt(&mut lines, "\nRate 1-5 to revise, or press enter to move on: ").await?
            else {
                break;
            };
            if raw.is_empty() {
                break;
            }
            let Ok(rating) = raw.parse::<u8>() else {
                println!("Ratings are whole numbers from 1 to 5.");
                continue;
            };
            let critique = prompt(&mut lines, "What should change? ")
                .await?
                .unwrap_or_default();

            match orchestrator
                .submit_feedback(session_id, turn_id, rating, &critique)
                .await
            {
                Ok(next) => {
                    print_result(&next);
                    current = next;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Regeneration failed");
                    println!("{}", e.user_message());
                }
            }
        }
    }

    orchestrator.flush_persistence().await;
    print_usage(&cost);
    Ok(())
}

// ---------------------------------------------------------------------------
// Operator tools
// ---------------------------------------------------------------------------

fn cmd_gate(config: &AdvocateConfig, comment: &str, draft: Option<&str>) -> anyhow::Result<()> {
    let gate = SafetyGate::new(config.min_input_chars, config.min_input_words)?;
    let verdict = gate.evaluate(comment, draft);
    println!("{}", serde_json::to_string_pretty(&verdict)?);
    if let Some(reason) = verdict.user_reason() {
        println!("User would see: {}", reason);
    }
    Ok(())
}

fn parse_query_tag(raw: &str) -> Option<Tag> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let (category, label) = match raw.split_once(':') {
        Some(("theme", l)) => (TagCategory::Theme, l),
        Some(("topic", l)) => (TagCategory::Topic, l),
        Some(("tone", l)) | Some(("emotional_tone", l)) => (TagCategory::EmotionalTone, l),
        _ => (TagCategory::Theme, raw),
    };
    Some(Tag::new(category, label.trim(), 1.0))
}

async fn cmd_corpus(config: &AdvocateConfig, query: &[String]) -> anyhow::Result<()> {
    let source: Arc<dyn StrategyCorpus> = match &config.corpus_path {
        Some(path) => Arc::new(JsonFileCorpus::new(path)),
        None => Arc::new(BuiltinCorpus),
    };
    let tags: Vec<Tag> = query.iter().filter_map(|q| parse_query_tag(q)).collect();

    // Listing needs no vectors worth paying for.
    let embedder: Arc<dyn Embedder> = if tags.is_empty() {
        Arc::new(HashingEmbedder::new(config.embedding_dimensions))
    } else {
        embedder_from_config(config)?
    };
    let corpus = CorpusHandle::load(source, embedder.clone()).await?;
    let strategies = corpus.snapshot().await;

    if tags.is_empty() {
        println!("Strategies: {}", strategies.len());
        for s in strategies.iter() {
            println!("  {} ({})\n    {}", s.id, s.name, s.principle);
        }
        return Ok(());
    }

    let ranked = StrategyRetriever::new(embedder)
        .retrieve(&tags, &strategies, config.top_k)
        .await?;
    println!("Top {} for {} tag(s):", ranked.len(), tags.len());
    for (i, r) in ranked.iter().enumerate() {
        println!("  {}. {:.3} {} ({})", i + 1, r.score, r.strategy_id, r.name);
    }
    Ok(())
}
