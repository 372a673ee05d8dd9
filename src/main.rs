use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use futures::future::join_all;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::time::{sleep, Duration, Instant};
use tracing::info;
use tracing_subscriber::EnvFilter;

use chat_throttler::config::{LoggingConfig, ThrottlerConfig};
use chat_throttler::{ApiDispatcher, EventContext, OutboundCall, Throttler};

#[derive(Parser)]
#[command(name = "chat-throttler", version, about = "Traffic shaping for chat bot API traffic")]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the effective configuration
    Config,

    /// Send a burst of outbound calls to one chat through a simulated API
    Simulate {
        /// Number of calls to send at once
        #[arg(long, default_value_t = 40)]
        calls: usize,

        /// Destination chat (negative for groups)
        #[arg(long, default_value_t = 1, allow_hyphen_values = true)]
        chat_id: i64,

        /// API method to call
        #[arg(long, default_value = "sendMessage")]
        method: String,
    },

    /// Deliver a burst of events from one user through the inbound limiter
    Inbound {
        /// Number of events
        #[arg(long, default_value_t = 10)]
        events: i64,

        /// Originating user
        #[arg(long, default_value_t = 1)]
        user_id: i64,

        /// Maximum random delay between arrivals, in milliseconds
        #[arg(long, default_value_t = 0)]
        jitter_ms: u64,

        /// Time each handler takes, in milliseconds
        #[arg(long, default_value_t = 100)]
        handler_ms: u64,
    },
}

/// Stand-in for the platform API that records when each call arrives.
struct SimulatedApi {
    started: Instant,
    log: Mutex<Vec<CallRecord>>,
}

#[derive(Debug, Clone, Serialize)]
struct CallRecord {
    method: String,
    chat_id: Option<Value>,
    offset_ms: u128,
}

#[async_trait]
impl ApiDispatcher for SimulatedApi {
    type Error = Infallible;

    async fn call_api(&self, call: OutboundCall) -> Result<Value, Infallible> {
        let offset_ms = self.started.elapsed().as_millis();
        self.log.lock().push(CallRecord {
            method: call.method.clone(),
            chat_id: call.payload.get("chat_id").cloned(),
            offset_ms,
        });
        Ok(json!({ "ok": true }))
    }
}

#[derive(Debug, Serialize)]
struct Report<T: Serialize> {
    generated_at: String,
    elapsed_ms: u128,
    #[serde(flatten)]
    body: T,
}

impl<T: Serialize> Report<T> {
    fn print(started: Instant, body: T) -> anyhow::Result<()> {
        let report = Report {
            generated_at: chrono::Utc::now().to_rfc3339(),
            elapsed_ms: started.elapsed().as_millis(),
            body,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = ThrottlerConfig::load(cli.config.as_deref())?;
    init_tracing(&config.logging)?;

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Config => {
            print!("{}", serde_yaml::to_string(&config)?);
        }
        Command::Simulate {
            calls,
            chat_id,
            method,
        } => simulate(config, calls, chat_id, method).await?,
        Command::Inbound {
            events,
            user_id,
            jitter_ms,
            handler_ms,
        } => inbound(config, events, user_id, jitter_ms, handler_ms).await?,
    }

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.filter))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

async fn simulate(
    config: ThrottlerConfig,
    calls: usize,
    chat_id: i64,
    method: String,
) -> anyhow::Result<()> {
    let started = Instant::now();
    let api = Arc::new(SimulatedApi {
        started,
        log: Mutex::new(Vec::new()),
    });
    let throttler = Throttler::new(config, Arc::clone(&api))?;
    let client = throttler.api();

    info!(calls, chat_id, method = %method, "Starting outbound simulation");

    let results = join_all((0..calls).map(|_| {
        client.call_api(OutboundCall::new(method.as_str()).with("chat_id", chat_id))
    }))
    .await;
    let failed = results.iter().filter(|r| r.is_err()).count();

    let executed = api.log.lock().clone();
    Report::print(
        started,
        json!({
            "calls": calls,
            "failed": failed,
            "executed": executed,
        }),
    )
}

async fn inbound(
    config: ThrottlerConfig,
    events: i64,
    user_id: i64,
    jitter_ms: u64,
    handler_ms: u64,
) -> anyhow::Result<()> {
    let started = Instant::now();
    let api = Arc::new(SimulatedApi {
        started,
        log: Mutex::new(Vec::new()),
    });
    let throttler = Throttler::new(config, api)?;

    // Arrival offsets are drawn up front so the burst itself is not delayed.
    let mut arrival = 0;
    let arrivals: Vec<u64> = (0..events)
        .map(|_| {
            let at = arrival;
            if jitter_ms > 0 {
                arrival += rand::thread_rng().gen_range(0..=jitter_ms);
            }
            at
        })
        .collect();

    info!(events, user_id, "Starting inbound simulation");

    let outcomes = join_all(arrivals.into_iter().zip(1..).map(|(delay, update_id)| {
        let throttler = throttler.clone();
        async move {
            sleep(Duration::from_millis(delay)).await;
            let ctx = EventContext::new()
                .with_update_id(update_id)
                .with_user(user_id)
                .with_chat(user_id);
            throttler
                .handle(ctx, |_| async move {
                    let offset_ms = started.elapsed().as_millis();
                    sleep(Duration::from_millis(handler_ms)).await;
                    json!({ "update_id": update_id, "started_ms": offset_ms })
                })
                .await
        }
    }))
    .await;

    let handled: Vec<Value> = outcomes.iter().flatten().cloned().collect();
    Report::print(
        started,
        json!({
            "events": events,
            "handled": handled,
            "rejected": outcomes.len() - handled.len(),
        }),
    )
}
