use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use hamc::apply::ApplyOutcome;
use hamc::cli::{Cli, Command, OutputFormat};
use hamc::config::{self, SessionConfig};
use hamc::error::HamcError;
use hamc::intent::RecordingExecutor;
use hamc::logging;
use hamc::registry::RefFamily;
use hamc::session::Session;
use hamc::snapshot::{ClusterStateSource, FileStateSource, StaticStateSource};
use hamc::workers::WorkerPool;

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();
    let file_handle = logging::init(cli.verbose);

    let sys_config = config::load_config(&cli.config)?;

    let journal = match sys_config.journal_dir() {
        Some(dir) => {
            file_handle.set_file(&dir.join("hamc.log")).ok();
            let journal =
                logging::IntentJournal::create(&dir).map_err(|source| HamcError::ConfigLoad {
                    path: dir.display().to_string(),
                    source,
                })?;
            logging::rotate_journals(&dir, sys_config.config.cluster.journal_keep);
            Some(journal)
        }
        None => None,
    };

    match &cli.command {
        Command::Check => {
            let cluster = &sys_config.config.cluster;
            let summary = CheckJson {
                config: sys_config.config_path.display().to_string(),
                hosts: cluster.hosts.len(),
                dc_host: sys_config.dc_host().to_string(),
                resources: sys_config.config.resources.len(),
                edges: sys_config.config.edges.len(),
            };
            // Building the session catches what field validation cannot.
            open_session(&sys_config, None, None).await?;
            if cli.output == OutputFormat::Json {
                println!("{}", to_json(&summary)?);
            } else {
                println!(
                    "{}: ok ({} hosts, dc {}, {} resources, {} edges)",
                    summary.config, summary.hosts, summary.dc_host, summary.resources, summary.edges
                );
            }
        }
        Command::Plan { live } => {
            let pool = open_session(&sys_config, live.clone(), journal).await?;
            run_plan(&pool, &cli.output).await?;
        }
        Command::Status { live } => {
            let pool = open_session(&sys_config, live.clone(), journal).await?;
            let statuses = pool.session().status();
            if cli.output == OutputFormat::Json {
                println!("{}", to_json(&statuses)?);
            } else {
                for s in &statuses {
                    let state = if s.removed {
                        "removed".to_string()
                    } else if s.new {
                        "new".to_string()
                    } else if s.changed {
                        format!("changed ({})", s.fields.join(", "))
                    } else {
                        "unchanged".to_string()
                    };
                    let mut flags = Vec::new();
                    if s.orphaned {
                        flags.push("orphaned".to_string());
                    }
                    if s.failed {
                        flags.push("failed".to_string());
                    }
                    if !s.running_on.is_empty() {
                        flags.push(format!("on {}", s.running_on.join(",")));
                    }
                    println!(
                        "{:<16} {:<32} {:<10} {state} {}",
                        s.key,
                        s.crm_id,
                        s.kind,
                        flags.join(" ")
                    );
                }
            }
        }
        Command::Refs { resource, live } => {
            let pool = open_session(&sys_config, live.clone(), journal).await?;
            let registry = pool.session().registry();
            let key = registry
                .resolve_key(resource)
                .ok_or_else(|| HamcError::UnknownResource {
                    name: resource.clone(),
                })?;
            let refs = RefsJson {
                meta: registry.selectable_references(&key, RefFamily::Meta)?,
                operations: registry.selectable_references(&key, RefFamily::Operations)?,
                resource: key,
            };
            if cli.output == OutputFormat::Json {
                println!("{}", to_json(&refs)?);
            } else {
                println!("meta attributes: {}", list_or_none(&refs.meta));
                println!("operations: {}", list_or_none(&refs.operations));
            }
        }
    }

    Ok(())
}

/// Build the session from the config, then merge live state if a snapshot
/// is given on the command line or in the config.
async fn open_session(
    sys_config: &SessionConfig,
    live: Option<PathBuf>,
    journal: Option<logging::IntentJournal>,
) -> Result<WorkerPool, HamcError> {
    let snapshot = live.or_else(|| sys_config.snapshot_path());
    let source: Arc<dyn ClusterStateSource> = match &snapshot {
        Some(path) => Arc::new(FileStateSource::new(path)),
        None => Arc::new(StaticStateSource::default()),
    };
    let executor = Arc::new(RecordingExecutor::new());
    let mut session = Session::from_config(sys_config, executor, source)?;
    if let Some(journal) = journal {
        session = session.with_journal(journal);
    }

    let pool = WorkerPool::new(Arc::new(session));
    if let Some(path) = &snapshot {
        tracing::debug!(path = %path.display(), "merging live state");
        pool.refresh().await?;
    }
    Ok(pool)
}

async fn run_plan(pool: &WorkerPool, output: &OutputFormat) -> Result<(), HamcError> {
    let results = pool.apply_all(true).await;
    let edges = pool.session().reconcile_graph(true)?;

    let mut failed = 0;
    let mut entries = Vec::new();
    let mut tooltips = Vec::new();
    for (key, result) in &results {
        match result {
            Ok(report) if report.outcome == ApplyOutcome::Unchanged => {}
            Ok(report) => {
                tooltips.push(report.tooltip());
                entries.push(PlanEntry {
                    resource: key.clone(),
                    outcome: format!("{:?}", report.outcome).to_lowercase(),
                    intents: report.intents().map(|i| i.to_string()).collect(),
                    error: None,
                });
            }
            Err(e) => {
                failed += 1;
                tooltips.push(format!("{key}: {e}"));
                entries.push(PlanEntry {
                    resource: key.clone(),
                    outcome: "error".into(),
                    intents: Vec::new(),
                    error: Some(e.to_string()),
                });
            }
        }
    }
    let plan = PlanJson {
        resources: entries,
        edges: edges.iter().map(|s| s.intent.to_string()).collect(),
    };

    if *output == OutputFormat::Json {
        println!("{}", to_json(&plan)?);
    } else if plan.resources.is_empty() && plan.edges.is_empty() {
        println!("nothing to do");
    } else {
        for tooltip in &tooltips {
            println!("{tooltip}");
        }
        if !plan.edges.is_empty() {
            println!("edges would submit:");
            for e in &plan.edges {
                println!("  {e}");
            }
        }
    }

    if failed > 0 {
        return Err(HamcError::Validation {
            message: format!("{failed} resource(s) cannot be applied"),
        });
    }
    Ok(())
}

fn to_json<'a, T: facet::Facet<'a>>(value: &T) -> Result<String, HamcError> {
    facet_json::to_string(value).map_err(|e| HamcError::Output {
        message: format!("{e:?}"),
    })
}

fn list_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "(none)".to_string()
    } else {
        items.join(", ")
    }
}

// ── JSON output structs ─────────────────────────────────────────────

#[derive(facet::Facet)]
struct CheckJson {
    config: String,
    hosts: usize,
    dc_host: String,
    resources: usize,
    edges: usize,
}

#[derive(facet::Facet)]
struct PlanEntry {
    resource: String,
    outcome: String,
    intents: Vec<String>,
    error: Option<String>,
}

#[derive(facet::Facet)]
struct PlanJson {
    resources: Vec<PlanEntry>,
    edges: Vec<String>,
}

#[derive(facet::Facet)]
struct RefsJson {
    resource: String,
    meta: Vec<String>,
    operations: Vec<String>,
}
