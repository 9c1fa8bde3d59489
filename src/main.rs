use std::collections::HashSet;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use sagaflow_bus::{
  BusMessage, CompensationCompleted, CompensationFailed, CompensationRequest, EventBus,
  InMemoryBus, SagaEvent, StepCompleted, StepFailed, StepRequest, topics,
};
use sagaflow_config::CatalogDef;
use sagaflow_orchestrator::{EngineConfig, SagaEngine, SagaError, SagaHandle, StartOptions};
use sagaflow_store::{MemoryLog, SagaLog, SqliteLog};
use sagaflow_workflow::Catalog;

/// Sagaflow - An orchestrator for long-running distributed transactions
#[derive(Parser)]
#[command(name = "sagaflow")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the data directory (default: ~/.sagaflow)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Check that every saga in a catalog file would register
  Validate {
    /// Path to the catalog file (JSON)
    catalog_file: PathBuf,
  },

  /// Run one saga against simulated step handlers
  Run {
    /// Path to the catalog file (JSON)
    catalog_file: PathBuf,

    /// Name of the saga to start
    #[arg(long)]
    saga: String,

    /// Step action whose handler always fails
    #[arg(long = "fail-action")]
    fail_actions: Vec<String>,

    /// Compensation action whose handler always fails
    #[arg(long = "fail-compensation")]
    fail_compensations: Vec<String>,

    /// Where saga transitions are recorded
    #[arg(long, value_enum, default_value_t = LogKind::Sqlite)]
    log: LogKind,
  },
}

#[derive(Clone, Copy, ValueEnum)]
enum LogKind {
  /// `sagaflow.db` in the data directory
  Sqlite,
  /// In-process only; lost on exit
  Memory,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(io::stderr)
    .init();

  let cli = Cli::parse();

  let data_dir = match cli.data_dir {
    Some(dir) => dir,
    None => dirs::home_dir()
      .context("could not determine home directory")?
      .join(".sagaflow"),
  };

  match cli.command {
    Some(Commands::Validate { catalog_file }) => {
      validate(&catalog_file)?;
    }
    Some(Commands::Run {
      catalog_file,
      saga,
      fail_actions,
      fail_compensations,
      log,
    }) => {
      let handlers = SimulatedHandlers {
        fail_actions: fail_actions.into_iter().collect(),
        fail_compensations: fail_compensations.into_iter().collect(),
      };
      let rt = tokio::runtime::Runtime::new()?;
      rt.block_on(run_saga(catalog_file, saga, handlers, log, data_dir))?;
    }
    None => {
      println!("sagaflow - use --help to see available commands");
    }
  }

  Ok(())
}

fn load_catalog(catalog_file: &Path) -> Result<Catalog> {
  let content = std::fs::read_to_string(catalog_file)
    .with_context(|| format!("failed to read catalog file: {}", catalog_file.display()))?;

  let def = CatalogDef::from_json(&content)
    .with_context(|| format!("failed to parse catalog file: {}", catalog_file.display()))?;

  Catalog::from_def(def)
    .with_context(|| format!("invalid catalog: {}", catalog_file.display()))
}

fn validate(catalog_file: &Path) -> Result<()> {
  let catalog = load_catalog(catalog_file)?;

  for name in catalog.names() {
    let definition = catalog.get(&name)?;
    let compensated = definition
      .compensations()
      .iter()
      .filter(|c| c.is_some())
      .count();
    println!(
      "{}: {} steps, {} compensations, timeout {}ms, {} retries",
      name,
      definition.steps().len(),
      compensated,
      definition.timeout().as_millis(),
      definition.retry_policy().max_retries()
    );
  }

  eprintln!("Catalog OK: {} sagas", catalog.len());
  Ok(())
}

async fn run_saga(
  catalog_file: PathBuf,
  saga: String,
  handlers: SimulatedHandlers,
  log_kind: LogKind,
  data_dir: PathBuf,
) -> Result<()> {
  let catalog = Arc::new(load_catalog(&catalog_file)?);
  eprintln!("Loaded catalog: {} sagas", catalog.len());

  let initial_data = read_payload_from_stdin()?;

  let log: Arc<dyn SagaLog> = match log_kind {
    LogKind::Sqlite => {
      tokio::fs::create_dir_all(&data_dir)
        .await
        .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
      let path = data_dir.join("sagaflow.db");
      let url = format!("sqlite://{}", path.display());
      Arc::new(
        SqliteLog::connect(&url)
          .await
          .with_context(|| format!("failed to open saga log: {}", path.display()))?,
      )
    }
    LogKind::Memory => Arc::new(MemoryLog::new()),
  };

  let pruned = log
    .prune_finished()
    .await
    .context("failed to prune saga log")?;
  debug!(pruned, "pruned finished sagas from log");

  let mut session = launch(catalog, log, handlers).await?;
  if session.recovered > 0 {
    eprintln!("Recovered {} unfinished sagas", session.recovered);
  }

  let started = session
    .handle
    .start_saga(&saga, initial_data, StartOptions::default())
    .await;
  let saga_id = match started {
    Ok(saga_id) => saga_id,
    Err(e) => {
      session.shutdown().await?;
      return Err(e).with_context(|| format!("failed to start saga '{}'", saga));
    }
  };
  eprintln!("Started saga: {}", saga_id);

  let outcome = wait_for_terminal(&mut session.announcements, &saga_id).await;
  session.shutdown().await?;

  let message = outcome?;
  println!("{}", serde_json::to_string_pretty(&message.payload)?);

  if message.topic == topics::SAGA_FAILED {
    eprintln!("Saga failed");
  } else {
    eprintln!("Saga completed");
  }

  Ok(())
}

/// A running engine wired to the simulated handlers over one in-memory bus.
struct Session {
  handle: SagaHandle,
  announcements: broadcast::Receiver<BusMessage>,
  recovered: usize,
  cancel: CancellationToken,
  listener: JoinHandle<()>,
  simulator: JoinHandle<()>,
  engine: JoinHandle<Result<(), SagaError>>,
}

async fn launch(
  catalog: Arc<Catalog>,
  log: Arc<dyn SagaLog>,
  handlers: SimulatedHandlers,
) -> Result<Session> {
  let bus = Arc::new(InMemoryBus::new());
  // The simulated handlers always echo stepIndex.
  let config = EngineConfig {
    require_step_index: true,
    ..EngineConfig::default()
  };
  let mut engine = SagaEngine::with_config(catalog, bus.clone(), config).with_log(log);
  let handle = engine.handle();
  let cancel = CancellationToken::new();

  // Recovery re-publishes outstanding requests, so subscribe first.
  let announcements = bus.subscribe();
  let listener = handle.listen(bus.subscribe(), cancel.clone());
  let simulator = tokio::spawn(handlers.serve(bus.clone(), bus.subscribe(), cancel.clone()));

  let recovered = match engine.recover().await {
    Ok(recovered) => recovered,
    Err(e) => {
      cancel.cancel();
      return Err(e).context("failed to recover sagas from log");
    }
  };
  let engine = tokio::spawn(engine.start(cancel.clone()));

  Ok(Session {
    handle,
    announcements,
    recovered,
    cancel,
    listener,
    simulator,
    engine,
  })
}

impl Session {
  async fn shutdown(self) -> Result<()> {
    self.cancel.cancel();
    let _ = self.listener.await;
    let _ = self.simulator.await;
    self.engine.await?.context("saga engine failed")?;
    Ok(())
  }
}

/// The `saga:completed` or `saga:failed` announcement for `saga_id`.
async fn wait_for_terminal(
  announcements: &mut broadcast::Receiver<BusMessage>,
  saga_id: &str,
) -> Result<BusMessage> {
  loop {
    let message = match announcements.recv().await {
      Ok(message) => message,
      Err(broadcast::error::RecvError::Lagged(skipped)) => {
        warn!(skipped, "announcement subscriber lagged");
        continue;
      }
      Err(broadcast::error::RecvError::Closed) => bail!("bus closed before saga finished"),
    };

    if message.topic != topics::SAGA_COMPLETED && message.topic != topics::SAGA_FAILED {
      continue;
    }
    if message.payload.get("sagaId").and_then(|v| v.as_str()) == Some(saga_id) {
      return Ok(message);
    }
  }
}

/// Stand-in step and compensation handlers.
///
/// Every action succeeds unless it is listed as failing.
struct SimulatedHandlers {
  fail_actions: HashSet<String>,
  fail_compensations: HashSet<String>,
}

impl SimulatedHandlers {
  async fn serve(
    self,
    bus: Arc<InMemoryBus>,
    mut requests: broadcast::Receiver<BusMessage>,
    cancel: CancellationToken,
  ) {
    loop {
      let message = tokio::select! {
        _ = cancel.cancelled() => break,
        message = requests.recv() => message,
      };
      let message = match message {
        Ok(message) => message,
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
          warn!(skipped, "simulated handlers lagged");
          continue;
        }
        Err(broadcast::error::RecvError::Closed) => break,
      };

      let reply = match self.answer(&message) {
        Ok(Some(reply)) => reply,
        Ok(None) => continue,
        Err(e) => {
          warn!(topic = %message.topic, error = %e, "simulated handler could not answer");
          continue;
        }
      };

      match reply.to_message() {
        Ok(reply) => {
          if let Err(e) = bus.publish(reply).await {
            warn!(error = %e, "simulated handler could not publish");
          }
        }
        Err(e) => warn!(error = %e, "simulated handler could not encode reply"),
      }
    }
  }

  fn answer(&self, message: &BusMessage) -> Result<Option<SagaEvent>> {
    if let Some(action) = topics::step_action(&message.topic) {
      let request: StepRequest = message.decode()?;
      debug!(action, step_index = request.step_index, "simulating step");

      let event = if self.fail_actions.contains(action) {
        SagaEvent::StepFailed(StepFailed {
          saga_id: request.saga_id,
          error: format!("{} failed (simulated)", action),
          retry_count: Some(request.retry_count),
          step_index: Some(request.step_index),
        })
      } else {
        let mut result = serde_json::Map::new();
        result.insert(
          action.to_string(),
          serde_json::json!({ "ok": true, "attempt": request.retry_count + 1 }),
        );
        SagaEvent::StepCompleted(StepCompleted {
          saga_id: request.saga_id,
          result: serde_json::Value::Object(result),
          step_index: Some(request.step_index),
        })
      };
      return Ok(Some(event));
    }

    if let Some(action) = topics::compensation_action(&message.topic) {
      let request: CompensationRequest = message.decode()?;
      debug!(action, step_index = request.step_index, "simulating compensation");

      let event = if self.fail_compensations.contains(action) {
        SagaEvent::CompensationFailed(CompensationFailed {
          saga_id: request.saga_id,
          step_index: request.step_index,
          error: format!("{} failed (simulated)", action),
        })
      } else {
        SagaEvent::CompensationCompleted(CompensationCompleted {
          saga_id: request.saga_id,
          step_index: request.step_index,
          result: serde_json::json!({ "undone": action }),
        })
      };
      return Ok(Some(event));
    }

    Ok(None)
  }
}

fn read_payload_from_stdin() -> Result<serde_json::Map<String, serde_json::Value>> {
  use std::io::IsTerminal;

  if io::stdin().is_terminal() {
    // No stdin pipe, start with empty data
    return Ok(serde_json::Map::new());
  }

  let mut input = String::new();
  io::stdin()
    .read_to_string(&mut input)
    .context("failed to read initial data from stdin")?;

  if input.trim().is_empty() {
    return Ok(serde_json::Map::new());
  }

  let data: serde_json::Value =
    serde_json::from_str(&input).context("failed to parse initial data JSON from stdin")?;
  match data {
    serde_json::Value::Object(map) => Ok(map),
    other => bail!("initial data must be a JSON object, got: {}", other),
  }
}
