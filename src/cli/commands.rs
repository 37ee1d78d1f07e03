//! CLI commands

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::TryStreamExt;

use crate::config::Config;
use crate::core::Store;
use crate::db::repositories::{InteractionType, WorkflowStatus};
use crate::rpc::RpcServer;

#[derive(Parser)]
#[command(name = "wfledger")]
#[command(about = "Durable workflow state and audit ledger for multi-agent code analysis", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: ~/.workflow-ledger/config.yml)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Database path, overriding the config file
    #[arg(long, global = true)]
    database: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the config file and database schema
    Init,

    /// List registered repositories
    Repos {
        #[arg(long, default_value = "50")]
        limit: usize,
    },

    /// List workflows
    Workflows {
        /// Only workflows of this repository ID
        #[arg(long)]
        repository: Option<String>,
    },

    /// Move a workflow to a new status
    Transition {
        workflow_id: String,

        /// initialized, running, paused, completed or failed
        status: WorkflowStatus,
    },

    /// Print the interaction log of a workflow
    Interactions {
        workflow_id: String,

        /// Only messages sent or received by this agent
        #[arg(long)]
        agent: Option<String>,

        /// handoff, feedback, query or result
        #[arg(long = "type")]
        interaction_type: Option<InteractionType>,
    },

    /// Show aggregate summaries
    Summary {
        #[command(subcommand)]
        target: SummaryTarget,
    },

    /// Start the JSON-RPC server
    Serve {
        /// Port number (default from config)
        #[arg(long)]
        port: Option<u16>,
    },
}

#[derive(Subcommand)]
enum SummaryTarget {
    /// One repository by ID
    Repo { id: String },
    /// One workflow by workflow ID
    Workflow { workflow_id: String },
    /// Suggestions of a repository
    Suggestions { repository_id: String },
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref())?;
    let db_path = match &cli.database {
        Some(path) => PathBuf::from(path),
        None => config.resolve_db_path()?,
    };

    let store = Store::from_config(&config, &db_path)
        .with_context(|| format!("Failed to open database {:?}", db_path))?;

    // Create a multi-threaded runtime for CLI operations
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(async {
        match cli.command {
            Commands::Init => {
                println!("Database ready at {}", store.db.path());
                Ok(())
            }

            Commands::Repos { limit } => {
                let repos = store.repositories.list(limit, 0).await?;

                if repos.is_empty() {
                    println!("No repositories found");
                } else {
                    for repo in repos {
                        println!(
                            "[{}] {}/{} - {} ({}) - last analyzed {}",
                            short(&repo.id),
                            repo.owner,
                            repo.name,
                            repo.url,
                            repo.clone_status,
                            repo.last_analyzed
                                .map(|t| t.to_rfc3339())
                                .unwrap_or_else(|| "never".to_string())
                        );
                    }
                }
                Ok(())
            }

            Commands::Workflows { repository } => {
                let workflows = match repository {
                    Some(repository_id) => store.workflows.list_by_repository(&repository_id).await?,
                    None => store.workflows.active().await?,
                };

                if workflows.is_empty() {
                    println!("No workflows found");
                } else {
                    for wf in workflows {
                        println!(
                            "{} [{}] {:.1}% - {} / {} - files {} suggestions {} approved {}",
                            wf.workflow_id,
                            wf.status,
                            wf.progress_percentage,
                            wf.current_agent.as_deref().unwrap_or("-"),
                            wf.current_step.as_deref().unwrap_or("-"),
                            wf.total_files_analyzed,
                            wf.total_suggestions,
                            wf.approved_suggestions
                        );
                    }
                }
                Ok(())
            }

            Commands::Transition { workflow_id, status } => {
                let wf = store.workflows.transition(&workflow_id, status).await?;
                println!("{} is now {}", wf.workflow_id, wf.status);
                if let Some(seconds) = wf.execution_time_seconds {
                    println!("Execution time: {:.3}s", seconds);
                }
                Ok(())
            }

            Commands::Interactions {
                workflow_id,
                agent,
                interaction_type,
            } => {
                let mut query = store.audit.interactions(&workflow_id);
                if let Some(agent) = agent {
                    query = query.agent(agent);
                }
                if let Some(kind) = interaction_type {
                    query = query.kind(kind);
                }

                let mut stream = query.stream();
                let mut count = 0usize;
                while let Some(interaction) = stream.try_next().await? {
                    println!(
                        "#{} {} {} -> {} ({}): {}",
                        interaction.seq,
                        interaction.created_at.to_rfc3339(),
                        interaction.from_agent,
                        interaction.to_agent,
                        interaction.interaction_type,
                        interaction.content
                    );
                    count += 1;
                }
                if count == 0 {
                    println!("No interactions found");
                }
                Ok(())
            }

            Commands::Summary { target } => {
                let json = match target {
                    SummaryTarget::Repo { id } => {
                        let summary = store
                            .summaries
                            .repository_summary(&id)
                            .await?
                            .with_context(|| format!("Repository not found: {}", id))?;
                        serde_json::to_string_pretty(&summary)?
                    }
                    SummaryTarget::Workflow { workflow_id } => {
                        let summary = store
                            .summaries
                            .workflow_summary(&workflow_id)
                            .await?
                            .with_context(|| format!("Workflow not found: {}", workflow_id))?;
                        serde_json::to_string_pretty(&summary)?
                    }
                    SummaryTarget::Suggestions { repository_id } => {
                        let summaries = store.summaries.suggestion_summaries(&repository_id).await?;
                        serde_json::to_string_pretty(&summaries)?
                    }
                };
                println!("{}", json);
                Ok(())
            }

            Commands::Serve { port } => {
                let port = port.unwrap_or(config.server.port);
                tracing::info!("Starting RPC server on {}:{}", config.server.host, port);

                let server = RpcServer::new(config.server.host.clone(), port, store.clone());
                server.run().await?;

                Ok(())
            }
        }
    })
}

fn short(id: &str) -> String {
    id.chars().take(8).collect()
}
