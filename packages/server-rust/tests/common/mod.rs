//! Shared fixtures for the end-to-end tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use microbus_core::{Message, Transport};
use microbus_server::{
    handler_fn, MemoryBroker, MemoryConnection, MethodConfig, Microservice, MicroserviceConfig,
    Request, RuntimeConfig,
};

pub const CALL_TIMEOUT: Duration = Duration::from_secs(2);

/// `echo` with a balanced `say`, an unbalanced `ping` and a local `whoami`.
pub fn echo_config() -> MicroserviceConfig {
    MicroserviceConfig::builder("echo")
        .version("1.0.0")
        .method(
            "say",
            MethodConfig::new(handler_fn(|req: Request| async move { Ok(req.payload) })),
        )
        .method(
            "ping",
            MethodConfig::new(handler_fn(|req: Request| async move { Ok(req.instance_id) }))
                .unbalanced(),
        )
        .method(
            "whoami",
            MethodConfig::new(handler_fn(|req: Request| async move { Ok(req.instance_id) }))
                .local(),
        )
        .build()
        .unwrap()
}

/// A started instance together with the connection it owns.
pub struct Running {
    pub service: Microservice,
    pub connection: Arc<MemoryConnection>,
}

pub async fn start_with(broker: &MemoryBroker, config: MicroserviceConfig) -> Running {
    start_with_runtime(broker, config, RuntimeConfig::default()).await
}

pub async fn start_with_runtime(
    broker: &MemoryBroker,
    config: MicroserviceConfig,
    runtime: RuntimeConfig,
) -> Running {
    let connection = broker.connect();
    let service = Microservice::with_config(connection.clone(), config, runtime).unwrap();
    service.start().await.unwrap();
    Running {
        service,
        connection,
    }
}

pub async fn start_echoes(broker: &MemoryBroker, count: usize) -> Vec<Running> {
    let mut running = Vec::with_capacity(count);
    for _ in 0..count {
        running.push(start_with(broker, echo_config()).await);
    }
    running
}

/// Publishes one request and gathers every reply that arrives within `window`.
pub async fn collect_replies(
    client: &dyn Transport,
    subject: &str,
    window: Duration,
) -> Vec<Message> {
    let inbox = client.new_inbox();
    let mut replies = client.subscribe(&inbox, None).await.unwrap();
    client
        .publish(Message::new(subject, "").with_reply(inbox))
        .await
        .unwrap();

    let mut collected = Vec::new();
    let deadline = tokio::time::sleep(window);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            () = &mut deadline => break,
            reply = replies.next() => match reply {
                Some(message) => collected.push(message),
                None => break,
            },
        }
    }
    client.unsubscribe(replies.id).await.unwrap();
    collected
}
