//! `callite` command-line tool: run a demo service, call methods, or run a
//! load-style health check against a running service.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use callite::config::timeout_from_secs;
use callite::{CallArgs, RpcClient, RpcConfig, RpcServer, Value, WireFormat};
use callite_core::{DEFAULT_CONSUMER_GROUP, DEFAULT_QUEUE_PREFIX};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// RPC over a shared message broker.
#[derive(Parser, Debug)]
#[command(name = "callite")]
#[command(about = "RPC over Redis streams and pub/sub", version)]
struct Cli {
    /// Broker URL.
    #[arg(long, global = true, default_value = "redis://127.0.0.1:6379/0", env = "CALLITE_BROKER_URL")]
    broker_url: String,

    /// Logical service name.
    #[arg(long, global = true, default_value = "service", env = "CALLITE_SERVICE")]
    service: String,

    /// Namespace prefix for stream and channel names.
    #[arg(long, global = true, default_value = DEFAULT_QUEUE_PREFIX, env = "CALLITE_QUEUE_PREFIX")]
    queue_prefix: String,

    /// Consumer group on the request stream.
    #[arg(long, global = true, default_value = DEFAULT_CONSUMER_GROUP, env = "CALLITE_GROUP")]
    group: String,

    /// Envelope format for outgoing messages (msgpack or json).
    #[arg(long, global = true, default_value = "msgpack", env = "CALLITE_WIRE_FORMAT")]
    wire_format: WireFormat,

    /// Seconds a call waits for its reply.
    #[arg(long, global = true, default_value_t = 30.0, env = "EXECUTION_TIMEOUT")]
    execution_timeout: f64,

    /// Log filter used when `RUST_LOG` is unset.
    #[arg(long, global = true, default_value = "info", env = "LOG_LEVEL")]
    log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long, global = true, env = "CALLITE_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the demo methods: healthcheck, add, echo, and log (no reply).
    Serve {
        /// Ceiling on concurrently running handlers.
        #[arg(long)]
        max_workers: Option<usize>,
    },
    /// Call a method and print its result as JSON.
    Call {
        method: String,
        /// Positional arguments, each a JSON value.
        args: Vec<String>,
        /// Keyword argument as name=JSON; repeatable.
        #[arg(long = "kwarg", value_parser = parse_kwarg)]
        kwargs: Vec<(String, serde_json::Value)>,
        /// Overrides the execution timeout, in seconds.
        #[arg(long)]
        timeout: Option<f64>,
        /// Publish without waiting for a reply.
        #[arg(long)]
        no_reply: bool,
    },
    /// Fire concurrent add calls and log publications, then call healthcheck.
    Healthcheck {
        #[arg(long, default_value_t = 100)]
        concurrency: u32,
    },
}

fn parse_kwarg(raw: &str) -> Result<(String, serde_json::Value), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=JSON, got '{raw}'"))?;
    Ok((name.to_string(), parse_json_arg(value)))
}

/// Parses a JSON argument, treating anything that is not valid JSON as a
/// plain string so `callite call echo hello` works unquoted.
fn parse_json_arg(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

fn init_tracing(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|err| anyhow::anyhow!(err))
}

impl Cli {
    fn config(&self) -> Result<RpcConfig> {
        let Some(execution_timeout) = timeout_from_secs(self.execution_timeout) else {
            bail!("execution timeout must be a positive number of seconds");
        };
        let mut config = RpcConfig::new(self.broker_url.clone(), self.service.clone());
        config.queue_prefix.clone_from(&self.queue_prefix);
        config.group_name.clone_from(&self.group);
        config.wire_format = self.wire_format;
        config.execution_timeout = execution_timeout;
        config.log_level.clone_from(&self.log_level);
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_json)?;
    let config = cli.config()?;

    match cli.command {
        Command::Serve { max_workers } => serve(RpcConfig {
            max_concurrent_workers: max_workers,
            ..config
        })
        .await,
        Command::Call {
            method,
            args,
            kwargs,
            timeout,
            no_reply,
        } => call(config, &method, &args, kwargs, timeout, no_reply).await,
        Command::Healthcheck { concurrency } => healthcheck(config, concurrency).await,
    }
}

// ---------------------------------------------------------------------------
// serve
// ---------------------------------------------------------------------------

async fn healthcheck_method(_args: CallArgs) -> Result<Value> {
    Ok(Value::from("OK"))
}

async fn add_method(args: CallArgs) -> Result<Value> {
    if let (Ok(a), Ok(b)) = (args.get::<i64>(0), args.get::<i64>(1)) {
        let sum = a.checked_add(b).context("integer overflow")?;
        return Ok(Value::from(sum));
    }
    let a: f64 = args.get(0)?;
    let b: f64 = args.get(1)?;
    Ok(Value::from(a + b))
}

async fn echo_method(args: CallArgs) -> Result<Value> {
    Ok(Value::Array(args.args))
}

async fn log_method(args: CallArgs) -> Result<Value> {
    let message: String = args.get(0)?;
    info!(%message, "log");
    Ok(Value::Nil)
}

async fn serve(config: RpcConfig) -> Result<()> {
    let server = RpcServer::connect(config)
        .await
        .context("failed to start rpc server")?;
    server
        .register("healthcheck", healthcheck_method)
        .register("add", add_method)
        .register("echo", echo_method)
        .subscribe("log", log_method);

    info!(
        service = %server.service(),
        methods = ?server.registered_methods(),
        "serving; press Ctrl-C to stop"
    );

    tokio::select! {
        () = server.run_forever() => {}
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl-C")?;
            info!("interrupt received, shutting down");
        }
    }
    server.close().await;
    Ok(())
}

// ---------------------------------------------------------------------------
// call
// ---------------------------------------------------------------------------

async fn call(
    config: RpcConfig,
    method: &str,
    raw_args: &[String],
    kwargs: Vec<(String, serde_json::Value)>,
    timeout: Option<f64>,
    no_reply: bool,
) -> Result<()> {
    let mut call_args = CallArgs::new();
    for raw in raw_args {
        call_args = call_args.try_with_arg(parse_json_arg(raw))?;
    }
    for (name, value) in kwargs {
        let value = rmpv::ext::to_value(value).with_context(|| format!("invalid keyword argument '{name}'"))?;
        call_args = call_args.with_kwarg(name, value);
    }

    let client = RpcClient::connect(config.clone())
        .await
        .context("failed to connect")?;

    let outcome = if no_reply {
        client.publish(method, call_args).await.map(|()| None)
    } else {
        let timeout = match timeout {
            Some(secs) => match timeout_from_secs(secs) {
                Some(timeout) => timeout,
                None => bail!("--timeout must be a positive number of seconds"),
            },
            None => config.execution_timeout,
        };
        client
            .execute_with_timeout(method, call_args, timeout)
            .await
            .map(Some)
    };
    client.close().await;

    match outcome? {
        Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        None => println!("published"),
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// healthcheck
// ---------------------------------------------------------------------------

async fn healthcheck(config: RpcConfig, concurrency: u32) -> Result<()> {
    let client = Arc::new(
        RpcClient::connect(config)
            .await
            .context("failed to connect")?,
    );

    let started = Instant::now();
    let mut calls = Vec::with_capacity(concurrency as usize);
    for i in 0..concurrency {
        let client = Arc::clone(&client);
        calls.push(tokio::spawn(async move {
            let i = i64::from(i);
            client
                .publish("log", callite::args![format!("Logging {i} + 0")])
                .await?;
            let sum: i64 = client.call("add", callite::args![i, 0]).await?;
            if sum != i {
                anyhow::bail!("add({i}, 0) returned {sum}");
            }
            Ok(())
        }));
    }

    let mut failures = 0_u32;
    for call in calls {
        match call.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                failures += 1;
                warn!(error = %err, "call failed");
            }
            Err(err) => {
                failures += 1;
                warn!(error = %err, "call task panicked");
            }
        }
    }
    info!(
        concurrency,
        failures,
        elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        "concurrent calls finished"
    );

    let check_started = Instant::now();
    let status = client.execute("healthcheck", CallArgs::new()).await;
    info!("Healthcheck took {:.4} seconds", check_started.elapsed().as_secs_f64());
    client.close().await;

    let status = status.context("healthcheck failed")?;
    println!("{}", serde_json::to_string(&status)?);
    if failures > 0 {
        bail!("{failures} of {concurrency} calls failed");
    }
    Ok(())
}
