use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use chrono::{Datelike, Local};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{error, info};

use farm_books::commands;
use farm_books::db;
use farm_books::error::AppError;
use farm_books::export::csv;
use farm_books::models::{
  Category, Enterprise, EnterprisePatch, SyncEvent, Transaction, TransactionFilter, TransactionPatch, TxKind,
};
use farm_books::reports;
use farm_books::settings;
use farm_books::sync::{DrainOutcome, HttpRemote, RemoteEndpoint};
use farm_books::AppState;

#[derive(Parser)]
#[command(name = "farm-books", about = "Offline-first farm bookkeeping")]
struct Cli {
  /// Data directory (defaults to FARM_BOOKS_DATA_DIR or the platform data dir)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Book a transaction
  Add {
    #[arg(long)]
    date: Option<String>,
    #[arg(long = "type")]
    kind: TxKind,
    #[arg(long)]
    amount: f64,
    #[arg(long)]
    enterprise: String,
    #[arg(long)]
    category: Option<String>,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    payment_method: Option<String>,
    #[arg(long)]
    notes: Option<String>,
  },
  /// Change fields of a transaction
  Edit {
    id: i64,
    #[arg(long)]
    date: Option<String>,
    #[arg(long = "type")]
    kind: Option<TxKind>,
    #[arg(long)]
    amount: Option<f64>,
    #[arg(long)]
    enterprise: Option<String>,
    #[arg(long)]
    category: Option<String>,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    payment_method: Option<String>,
    #[arg(long)]
    notes: Option<String>,
  },
  /// Delete a transaction
  Delete { id: i64 },
  /// List transactions, newest first
  List {
    #[arg(long)]
    enterprise: Option<String>,
    #[arg(long = "type")]
    kind: Option<TxKind>,
    #[arg(long)]
    category: Option<String>,
    #[arg(long)]
    from: Option<String>,
    #[arg(long)]
    to: Option<String>,
    #[arg(long)]
    search: Option<String>,
    #[arg(long)]
    limit: Option<usize>,
  },
  /// Manage enterprises
  Enterprise {
    #[command(subcommand)]
    command: EnterpriseCommand,
  },
  /// Manage categories
  Category {
    #[command(subcommand)]
    command: CategoryCommand,
  },
  /// Read or write a setting
  Setting {
    #[command(subcommand)]
    command: SettingCommand,
  },
  /// Year dashboard: KPIs, splits, monthly series and sync state
  Report {
    #[arg(long)]
    year: Option<i32>,
  },
  /// Export transactions of a year to CSV
  ExportCsv {
    path: PathBuf,
    #[arg(long)]
    year: Option<i32>,
  },
  /// Show queued mutations
  Queue,
  /// Show sync status
  Status,
  /// Push queued mutations now
  Sync,
  /// Keep syncing in the background until interrupted
  Daemon,
}

#[derive(Subcommand)]
enum EnterpriseCommand {
  Add {
    name: String,
    #[arg(long)]
    kind: Option<String>,
    #[arg(long)]
    description: Option<String>,
  },
  List,
  Deactivate { id: i64 },
  Delete { id: i64 },
}

#[derive(Subcommand)]
enum CategoryCommand {
  Add {
    name: String,
    #[arg(long = "type")]
    kind: TxKind,
    #[arg(long)]
    description: Option<String>,
  },
  List {
    #[arg(long = "type")]
    kind: Option<TxKind>,
  },
  Delete { id: i64 },
}

#[derive(Subcommand)]
enum SettingCommand {
  Get { key: String },
  Set { key: String, value: String },
}

#[tokio::main]
async fn main() -> ExitCode {
  tracing_subscriber::fmt::init();
  let cli = Cli::parse();

  match run(cli).await {
    Ok(()) => ExitCode::SUCCESS,
    Err(err) => {
      error!("{err}");
      eprintln!("{}", serde_json::to_string(&err).unwrap_or_else(|_| err.to_string()));
      ExitCode::FAILURE
    }
  }
}

async fn run(cli: Cli) -> Result<(), AppError> {
  let app_dir = match cli.data_dir {
    Some(dir) => dir,
    None => db::resolve_app_dir()?,
  };
  let config = settings::load_config();
  let db = db::init_db(&app_dir)?;
  let remote = Arc::new(HttpRemote::new(&config.endpoint_url, config.remote_timeout)?);
  // One-shot commands only queue; `sync` and `daemon` decide reachability themselves.
  let state = AppState::new(db, remote.clone(), config, false)?;
  let this_year = Local::now().year();

  match cli.command {
    Commands::Add {
      date,
      kind,
      amount,
      enterprise,
      category,
      description,
      payment_method,
      notes,
    } => {
      let input = Transaction {
        date: date.unwrap_or_else(|| Local::now().format("%Y-%m-%d").to_string()),
        kind,
        amount,
        enterprise,
        category,
        description,
        payment_method,
        notes,
      };
      print_json(&commands::create_transaction(&state, input)?)
    }
    Commands::Edit {
      id,
      date,
      kind,
      amount,
      enterprise,
      category,
      description,
      payment_method,
      notes,
    } => {
      let patch = TransactionPatch {
        date,
        kind,
        amount,
        enterprise,
        category,
        description,
        payment_method,
        notes,
      };
      print_json(&commands::update_transaction(&state, id, patch)?)
    }
    Commands::Delete { id } => {
      commands::delete_transaction(&state, id)?;
      println!("deleted transaction #{id}");
      Ok(())
    }
    Commands::List {
      enterprise,
      kind,
      category,
      from,
      to,
      search,
      limit,
    } => {
      let filter = TransactionFilter {
        enterprise,
        kind,
        category,
        date_from: from,
        date_to: to,
        search,
        limit,
      };
      print_json(&commands::list_transactions(&state, &filter)?)
    }
    Commands::Enterprise { command } => match command {
      EnterpriseCommand::Add {
        name,
        kind,
        description,
      } => {
        let input = Enterprise {
          name,
          kind,
          description,
          active: true,
        };
        print_json(&commands::create_enterprise(&state, input)?)
      }
      EnterpriseCommand::List => print_json(&commands::list_enterprises(&state)?),
      EnterpriseCommand::Deactivate { id } => {
        let patch = EnterprisePatch {
          active: Some(false),
          ..EnterprisePatch::default()
        };
        print_json(&commands::update_enterprise(&state, id, patch)?)
      }
      EnterpriseCommand::Delete { id } => {
        commands::delete_enterprise(&state, id)?;
        println!("deleted enterprise #{id}");
        Ok(())
      }
    },
    Commands::Category { command } => match command {
      CategoryCommand::Add {
        name,
        kind,
        description,
      } => print_json(&commands::create_category(
        &state,
        Category {
          name,
          kind,
          description,
        },
      )?),
      CategoryCommand::List { kind } => print_json(&commands::list_categories(&state, kind)?),
      CategoryCommand::Delete { id } => {
        commands::delete_category(&state, id)?;
        println!("deleted category #{id}");
        Ok(())
      }
    },
    Commands::Setting { command } => match command {
      SettingCommand::Get { key } => print_json(&commands::get_setting(&state, &key)?),
      SettingCommand::Set { key, value } => print_json(&commands::set_setting(&state, &key, &value)?),
    },
    Commands::Report { year } => print_json(&reports::dashboard(&state, year.unwrap_or(this_year))?),
    Commands::ExportCsv { path, year } => {
      let (from, to) = reports::year_bounds(year.unwrap_or(this_year));
      let written = db::with_conn(state.store.db(), |conn| csv::export_transactions_csv(conn, &from, &to, &path))?;
      println!("wrote {written} transactions to {}", path.display());
      Ok(())
    }
    Commands::Queue => print_json(&commands::list_pending(&state)?),
    Commands::Status => print_json(&commands::get_sync_status(&state)?),
    Commands::Sync => {
      if !remote.probe().await {
        println!("remote {} unreachable, changes stay queued", state.config.endpoint_url);
        return print_json(&commands::get_sync_status(&state)?);
      }
      match state.monitor.set_online(true).await? {
        Some(DrainOutcome::Completed(report)) => println!(
          "applied {}, failed {}, deferred {}, remaining {}",
          report.applied, report.failed, report.deferred, report.remaining
        ),
        Some(DrainOutcome::Skipped(reason)) => println!("drain skipped: {reason:?}"),
        None => {}
      }
      Ok(())
    }
    Commands::Daemon => run_daemon(state).await,
  }
}

async fn run_daemon(state: AppState) -> Result<(), AppError> {
  state.engine.subscribe(|event| match event {
    SyncEvent::Error { pending } => info!(pending, "sync finished with pending entries"),
    other => info!("sync status: {other:?}"),
  })?;

  let mut handles = state.start();
  handles.push(state.monitor.spawn_reachability_probe(state.config.probe_interval));
  info!(
    "syncing to {} every {:?}, probing every {:?}",
    state.config.endpoint_url, state.config.sync_interval, state.config.probe_interval
  );

  tokio::signal::ctrl_c().await?;
  info!("shutting down");
  for handle in handles {
    handle.abort();
  }
  Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<(), AppError> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}
