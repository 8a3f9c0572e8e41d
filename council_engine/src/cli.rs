//! Command-line interface definitions using clap derive API, and the
//! commands behind them.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    engine::EchoEngine,
    learning::{Feedback, OutcomeReceipt},
    orchestrator::Council,
    router::{CouncilRequest, CouncilResponse, RoutingMode},
    settings::Settings,
};

/// Advisor Council CLI
#[derive(Parser)]
#[command(name = "council-cli")]
#[command(about = "Ask a council of specialized advisors that learns from your feedback")]
#[command(version)]
pub struct Cli {
    /// Configuration file (defaults to ./council.toml when present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Ask the council one question
    Ask {
        /// The request text
        #[arg(required = true)]
        text: Vec<String>,
        /// Routing mode (defaults to router.default_mode)
        #[arg(short, long, value_enum)]
        mode: Option<RoutingMode>,
        /// Send the request to this advisor only
        #[arg(long)]
        advisor: Option<String>,
        /// Feedback to record right away: a rating or a short comment
        #[arg(long)]
        feedback: Option<String>,
        /// Print the full response with its trace as JSON
        #[arg(long)]
        json: bool,
    },
    /// Interactive session with feedback commands
    Chat {
        #[arg(short, long, value_enum)]
        mode: Option<RoutingMode>,
    },
    /// Store an instruction the advisors will see on related requests
    Teach {
        #[arg(long)]
        topic: String,
        #[arg(required = true)]
        instruction: Vec<String>,
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
    },
    /// Show generation, advisors, proficiency and mini-agents
    Status {
        #[arg(long)]
        json: bool,
    },
    /// List active and retired advisors
    Advisors,
    /// Run one nursery pass: spawn for recurring topics, retire idle clones
    Maintain,
    /// Move all memory records into an archive and start empty
    ArchiveMemory {
        /// Confirm the archival
        #[arg(long)]
        yes: bool,
    },
    /// Print the effective configuration
    Config,
}

const CHAT_HELP: &str = "commands: /good  /bad  /feedback <rating|text>  /mode <auto|reflex|council|strategic>  \
/advisor <id|off>  /status  /quit";

pub async fn run(command: Commands, settings: Settings) -> Result<()> {
    if let Commands::Config = command {
        print!("{}", settings.to_toml()?);
        return Ok(());
    }

    let default_mode = settings.router.default_mode;
    let council = Arc::new(
        Council::new(settings, Arc::new(EchoEngine::new()))
            .await
            .context("failed to start the council")?,
    );

    match command {
        Commands::Ask {
            text,
            mode,
            advisor,
            feedback,
            json,
        } => {
            let mut request = CouncilRequest::new(text.join(" "), mode.unwrap_or(default_mode));
            if let Some(advisor) = advisor {
                request = request.with_override(advisor);
            }
            let response = council.handle(request).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                print_response(&response);
            }

            let receipts = match feedback {
                Some(input) if response.is_answered() => {
                    vec![council.feedback(response.request_id, Feedback::parse(&input)).await?]
                }
                _ => council.settle_all().await,
            };
            after_settle(&council, &receipts).await;
        }
        Commands::Chat { mode } => chat(council.clone(), mode.unwrap_or(default_mode)).await?,
        Commands::Teach {
            topic,
            instruction,
            tags,
        } => {
            let teaching = council.teach(&topic, &instruction.join(" "), &tags).await?;
            println!("Stored teaching {} on '{}'", teaching.id, teaching.topic);
        }
        Commands::Status { json } => {
            let status = council.status().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!(
                    "generation {} | recorded turns {} | routed turns {} | memory: {} turns, {} teachings",
                    status.generation,
                    status.recorded_turns,
                    status.turn_clock,
                    status.memory.turns,
                    status.memory.teachings
                );
                for advisor in &status.advisors {
                    let weights: Vec<String> = advisor
                        .proficiency
                        .iter()
                        .map(|(tag, entry)| {
                            format!("{}={:.2} ({}/{})", tag, entry.weight, entry.success_count, entry.attempt_count)
                        })
                        .collect();
                    println!("  {:<16} {}", advisor.descriptor.id, weights.join(", "));
                }
                for mini in &status.mini_agents {
                    println!(
                        "  mini-agent {} [{:?}] topic '{}' from {} ({} selections)",
                        mini.id, mini.status, mini.topic, mini.cloned_from, mini.selections
                    );
                }
            }
        }
        Commands::Advisors => {
            for descriptor in council.registry().descriptors() {
                println!(
                    "{:<16} {:<28} [{}]",
                    descriptor.id,
                    descriptor.role,
                    descriptor.capabilities.join(", ")
                );
            }
            for descriptor in council.registry().retired() {
                println!("{:<16} retired", descriptor.id);
            }
        }
        Commands::Maintain => {
            let report = council.run_maintenance(true).await;
            match &report.spawned {
                Some(record) => println!("Spawned {} for '{}': {}", record.id, record.topic, record.reason),
                None => println!("No recurring topic needs a specialist"),
            }
            for record in &report.retired {
                println!("Retired {}", record.id);
            }
        }
        Commands::ArchiveMemory { yes } => {
            if !yes {
                println!("This moves every turn, teaching and reflection into an archive. Re-run with --yes.");
                return Ok(());
            }
            let receipt = council.archive_memory().await?;
            println!("Archived {} records as {}", receipt.records, receipt.label);
        }
        Commands::Config => {}
    }

    Ok(())
}

/// Run the nursery after a generation advance; one-shot commands have no
/// background loop to do it.
async fn after_settle(council: &Council, receipts: &[OutcomeReceipt]) {
    if receipts.iter().any(|r| r.generation_advanced) {
        let report = council.run_maintenance(true).await;
        if let Some(record) = report.spawned {
            info!("Spawned mini-agent {} for '{}'", record.id, record.topic);
        }
    }
}

fn print_response(response: &CouncilResponse) {
    let decision = &response.trace.decision;
    println!("[{} -> {}]", decision.mode, decision.selected.join(", "));
    match &response.final_text {
        Some(text) => println!("{}", text),
        None => println!("No advisor could answer this request."),
    }
    if !response.actions.is_empty() {
        println!("  actions: {}", response.actions.join("; "));
    }
    for failure in &response.trace.failures {
        println!("  ({} {:?}: {})", failure.advisor_id, failure.kind, failure.reason);
    }
}

async fn chat(council: Arc<Council>, mut mode: RoutingMode) -> Result<()> {
    let maintenance = council.spawn_maintenance();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut last: Option<Uuid> = None;
    let mut pinned: Option<String> = None;

    println!("{}", CHAT_HELP);
    loop {
        print!("{}> ", mode);
        std::io::stdout().flush()?;
        let next = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                println!();
                None
            }
        };
        let Some(line) = next else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(command) = line.strip_prefix('/') {
            let (name, arg) = command.split_once(' ').unwrap_or((command, ""));
            let arg = arg.trim();
            let feedback = match name {
                "quit" | "exit" => break,
                "good" => Some(Feedback::Positive),
                "bad" => Some(Feedback::Negative),
                "feedback" if !arg.is_empty() => Some(Feedback::parse(arg)),
                "mode" => {
                    match arg.parse::<RoutingMode>() {
                        Ok(m) => mode = m,
                        Err(e) => println!("{}", e),
                    }
                    None
                }
                "advisor" => {
                    pinned = match arg {
                        "" | "off" => None,
                        id => Some(id.to_string()),
                    };
                    None
                }
                "status" => {
                    let status = council.status().await;
                    println!(
                        "generation {} | {} advisors | {} mini-agents | {} awaiting feedback",
                        status.generation,
                        status.advisors.len(),
                        status.mini_agents.iter().filter(|m| m.is_active()).count(),
                        status.pending_feedback
                    );
                    None
                }
                _ => {
                    println!("{}", CHAT_HELP);
                    None
                }
            };

            if let Some(feedback) = feedback {
                match last.take() {
                    Some(id) => match council.feedback(id, feedback).await {
                        Ok(receipt) => println!("noted ({}, generation {})", receipt.signal, receipt.generation),
                        Err(e) => println!("{}", e),
                    },
                    None => println!("nothing to rate yet"),
                }
            }
            continue;
        }

        let mut request = CouncilRequest::new(line, mode);
        if let Some(id) = &pinned {
            request = request.with_override(id.clone());
        }
        match council.handle(request).await {
            Ok(response) => {
                print_response(&response);
                last = response.is_answered().then_some(response.request_id);
            }
            Err(e) => warn!("Request failed: {}", e),
        }
    }

    council.settle_all().await;
    council.shutdown();
    if let Err(e) = maintenance.await {
        warn!("Maintenance task ended abnormally: {}", e);
    }
    Ok(())
}
