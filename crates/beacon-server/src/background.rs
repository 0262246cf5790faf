//! Queue consumers and scheduled jobs started with the server.

use crate::config::{Config, QueueConfig};
use crate::jobs::FuncJob;
use beacon_notify::{
    responder_consumer_config, send_consumer_config, trigger_consumer_config, HttpTransport,
    NotificationEngine, ResponderClient, ResponderProcessor, RuleStore,
};
use beacon_queue::{ConsumerConfig, EventConsumer, EventQueue};
use beacon_upstream::{push_consumer_config, sync_from_upstream, UpstreamClient, UpstreamPushProcessor};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

fn tuned(config: ConsumerConfig, queue: &QueueConfig) -> ConsumerConfig {
    config
        .with_lease(queue.lease())
        .with_idle_timeout(queue.idle_timeout())
        .with_retry(queue.retry())
}

/// Starts every consumer and job the configuration enables.
///
/// `responders` talks to outside ticketing systems; without one, responder
/// and comment events only go through the notification fan-out. All tasks
/// stop when `shutdown` is cancelled.
pub fn start_background_tasks(
    config: &Config,
    queue: EventQueue,
    responders: Option<Arc<dyn ResponderClient>>,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    if config.notifications.enabled {
        let transport = Arc::new(HttpTransport::new(config.notifications.relay_url.clone()));
        let engine = Arc::new(NotificationEngine::new(
            queue.clone(),
            RuleStore::new(Duration::from_secs(config.notifications.cache_ttl_secs)),
            transport,
        ));

        let triggers = tuned(trigger_consumer_config(), &config.queue);
        handles.extend(EventConsumer::new(triggers, queue.clone(), engine.clone()).spawn(shutdown.clone()));

        let responder = Arc::new(ResponderProcessor::new(engine.clone(), responders));
        let responder_events = tuned(responder_consumer_config(), &config.queue);
        handles.extend(
            EventConsumer::new(responder_events, queue.clone(), responder).spawn(shutdown.clone()),
        );

        let sends = tuned(send_consumer_config(config.notifications.send_consumers), &config.queue);
        handles.extend(EventConsumer::new(sends, queue.clone(), engine).spawn(shutdown.clone()));
    } else {
        tracing::info!("notifications disabled");
    }

    if let Some(upstream) = config.upstream.enabled() {
        let client = UpstreamClient::new(upstream);
        tracing::info!(
            host = %client.config().host,
            agent = %client.config().agent_name,
            "pushing changes upstream"
        );

        let pusher = Arc::new(UpstreamPushProcessor::new(queue.pool().clone(), client.clone()));
        let push = tuned(push_consumer_config(config.upstream.batch_size), &config.queue);
        handles.extend(EventConsumer::new(push, queue.clone(), pusher).spawn(shutdown.clone()));

        if config.upstream.pull_interval_secs > 0 {
            let pool = queue.pool().clone();
            let client = Arc::new(client);
            let job = FuncJob::new(
                "upstream-pull",
                Duration::from_secs(config.upstream.pull_interval_secs),
                move || {
                    let pool = pool.clone();
                    let client = Arc::clone(&client);
                    async move { sync_from_upstream(&pool, &client).await.map(|_| ()) }
                },
            )
            .with_timeout(Duration::from_secs(config.upstream.pull_timeout_secs))
            .run_now(true);
            handles.push(job.spawn(shutdown));
        }
    }

    handles
}
