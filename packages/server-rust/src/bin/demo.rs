//! Demo binary: a few `echo` instances and a monitor on an in-memory broker.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use clap::Parser;
use microbus_core::{Headers, Transport};
use microbus_server::{
    handler_fn, DiscoverOptions, MemoryBroker, MethodConfig, Microservice, MicroserviceConfig,
    Monitor, MonitorEvent, Request, ServiceError,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "microbus-demo", about = "Run echo microservices on an in-memory bus")]
struct Args {
    /// Number of echo instances to start.
    #[arg(long, env = "MICROBUS_INSTANCES", default_value_t = 3)]
    instances: usize,

    /// Balanced calls to issue after discovery.
    #[arg(long, env = "MICROBUS_CALLS", default_value_t = 6)]
    calls: usize,

    /// Discovery window in milliseconds.
    #[arg(long, env = "MICROBUS_DISCOVER_MS", default_value_t = 300)]
    discover_ms: u64,

    /// Emit logs as JSON lines.
    #[arg(long, env = "MICROBUS_LOG_JSON")]
    json: bool,
}

fn echo_service() -> anyhow::Result<MicroserviceConfig> {
    let config = MicroserviceConfig::builder("echo")
        .version("1.0.0")
        .description("echoes payloads back")
        .method(
            "say",
            MethodConfig::new(handler_fn(|req: Request| async move { Ok(req.payload) })),
        )
        .method(
            "whoami",
            MethodConfig::new(handler_fn(|req: Request| async move { Ok(req.instance_id) }))
                .unbalanced(),
        )
        .method(
            "fail",
            MethodConfig::new(handler_fn(|_req: Request| async move {
                Err::<(), anyhow::Error>(ServiceError::new("418", "no coffee here").into())
            })),
        )
        .build()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(args.json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!args.json).then(tracing_subscriber::fmt::layer))
        .init();

    let broker = MemoryBroker::new();
    let mut services = Vec::with_capacity(args.instances);
    for _ in 0..args.instances {
        let service = Microservice::new(broker.connect(), echo_service()?)?;
        service.start().await?;
        services.push(service);
    }

    let monitor = Monitor::new(broker.connect())
        .await?
        .with_system_transport(broker.connect_system())
        .await?;
    let mut events = monitor.subscribe();
    let event_log = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                MonitorEvent::Added(record) => {
                    info!(service = %record.name, instance = %record.id, "added");
                }
                MonitorEvent::Removed(record) => {
                    info!(service = %record.name, instance = %record.id, "removed");
                }
                MonitorEvent::Change(records) => info!(count = records.len(), "registry changed"),
            }
        }
    });

    let window = Duration::from_millis(args.discover_ms);
    let records = monitor.discover(window, DiscoverOptions::default()).await?;
    info!(instances = records.len(), "discovery finished");

    let client: Arc<dyn Transport> = broker.connect();
    for n in 0..args.calls {
        let reply = client
            .request(
                "echo.say",
                Headers::new(),
                Bytes::from(format!("hello {n}")),
                Duration::from_secs(1),
            )
            .await?;
        info!(reply = %String::from_utf8_lossy(&reply.payload), "echo.say");
    }

    let reply = client
        .request("echo.fail", Headers::new(), Bytes::new(), Duration::from_secs(1))
        .await?;
    if let Some((code, message)) = reply.service_error() {
        warn!(code, message, "echo.fail answered with an error");
    }

    for service in &services {
        let stats = service.stats();
        for endpoint in &stats.endpoints {
            info!(
                instance = %service.id(),
                method = %endpoint.name,
                requests = endpoint.num_requests,
                errors = endpoint.num_errors,
                "endpoint stats"
            );
        }
    }

    for service in &services {
        service.stop().await;
    }
    monitor.close().await;
    let _ = event_log.await;
    info!("demo finished");
    Ok(())
}
