//! Demo workloads: a delayed echo procedure and a periodic time publisher.

use crate::context::AppContext;
use crate::error::StartupError;
use chrono::{SecondsFormat, Utc};
use futures_util::FutureExt;
use junction_protocol::{Dict, Id};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tenvis_junction_core::{Client, ClientError, Invocation, InvocationHandler, InvokeResult};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const ECHO_PROCEDURE: &str = "dev.echo";
pub const TIME_TOPIC: &str = "dev.time";

/// Handler that answers with its own arguments after `delay`.
#[must_use]
pub fn delayed_echo(delay: Duration) -> InvocationHandler {
    Arc::new(move |invocation: Invocation| {
        async move {
            tokio::time::sleep(delay).await;
            info!(
                request = invocation.request,
                details = ?invocation.details,
                "{} answered",
                ECHO_PROCEDURE
            );
            InvokeResult::new(invocation.arguments, invocation.arguments_kw)
        }
        .boxed()
    })
}

/// Register the delayed echo procedure on the local session.
///
/// # Errors
///
/// Returns [`StartupError::Registration`] if the router refuses.
pub async fn register_echo(client: &Client, delay: Duration) -> Result<Id, StartupError> {
    let registration = client
        .register(ECHO_PROCEDURE, delayed_echo(delay))
        .await
        .map_err(|source| StartupError::Registration {
            procedure: ECHO_PROCEDURE.to_string(),
            source,
        })?;

    info!(registration, delay_ms = delay.as_millis() as u64, "Registered {}", ECHO_PROCEDURE);
    Ok(registration)
}

/// Register the demo workloads enabled in the settings. Returns the time
/// publisher when one was started.
///
/// # Errors
///
/// Returns [`StartupError::Registration`] if the echo procedure is refused.
pub async fn register_workloads(ctx: &AppContext) -> Result<Option<PeriodicPublisher>, StartupError> {
    let demo = &ctx.settings.demo;
    if demo.echo {
        register_echo(&ctx.client, demo.echo_delay).await?;
    }
    if !demo.time {
        return Ok(None);
    }

    info!(
        interval_ms = demo.time_interval.as_millis() as u64,
        "Publishing time on {}", TIME_TOPIC
    );
    Ok(Some(PeriodicPublisher::start(
        Arc::clone(&ctx.client),
        TIME_TOPIC,
        demo.time_interval,
    )))
}

/// Current UTC time as RFC 3339.
#[must_use]
pub fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Publishes the current time on a topic at a fixed interval until stopped.
pub struct PeriodicPublisher {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl PeriodicPublisher {
    /// Start publishing. The first event is published one `period` from now.
    #[must_use]
    pub fn start(client: Arc<Client>, topic: impl Into<String>, period: Duration) -> Self {
        let token = CancellationToken::new();
        let task = tokio::spawn(publish_loop(client, topic.into(), period, token.clone()));
        Self { token, task }
    }

    /// Stop publishing and wait for the task to finish.
    ///
    /// # Errors
    ///
    /// Returns an error if the publishing task panicked.
    pub async fn stop(self) -> Result<(), JoinError> {
        self.token.cancel();
        self.task.await
    }
}

async fn publish_loop(client: Arc<Client>, topic: String, period: Duration, token: CancellationToken) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let now = timestamp();
                match client.publish(&topic, Dict::new(), vec![json!(now)], Dict::new()) {
                    Ok(()) => debug!(topic = %topic, timestamp = %now, "Published time"),
                    Err(ClientError::Closed) => {
                        warn!(topic = %topic, "Local session closed; stopping publisher");
                        break;
                    }
                    Err(e) => warn!(topic = %topic, error = %e, "Failed to publish time"),
                }
            }
        }
    }

    debug!(topic = %topic, "Time publisher stopped");
}
