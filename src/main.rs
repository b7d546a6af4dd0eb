use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mention_relay::config::{CacheBackend, QueueBackend, Settings};
use mention_relay::consumer::{Consumer, ConsumerConfig};
use mention_relay::generator::{ChatCompletionsGenerator, GeneratorConfig};
use mention_relay::http::{consumer_router, producer_router};
use mention_relay::marker::{GuardConfig, ReplyGuard};
use mention_relay::model::Backoff;
use mention_relay::platform::{SocialPlatform, TwitterClient, TwitterConfig};
use mention_relay::producer::{Producer, ProducerConfig};
use mention_relay::queue::{MemoryQueue, MemoryQueueConfig, Queue};
use mention_relay::ratelimit::{FetchGate, RateLimiter};
use mention_relay::{CacheStore, CursorStore, DynamoDbStore, MemoryStore};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

/// mention-relay - mention ingestion and reply dispatch
#[derive(Parser)]
#[command(name = "mention-relay")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Clone, Copy, PartialEq, Eq)]
enum Commands {
    /// Poll the platform for mentions and publish them to the queue
    Producer,
    /// Consume queued mentions and post replies
    Consumer,
    /// Run producer and consumer in one process, sharing queue and cache
    All,
}

impl Commands {
    fn runs_producer(self) -> bool {
        matches!(self, Commands::Producer | Commands::All)
    }

    fn runs_consumer(self) -> bool {
        matches!(self, Commands::Consumer | Commands::All)
    }
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("mention_relay=info,tower_http=info"))?;

    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
    Ok(())
}

async fn build_store(settings: &Settings) -> Arc<dyn CacheStore> {
    match settings.cache_backend {
        CacheBackend::Memory => Arc::new(MemoryStore::new()),
        CacheBackend::DynamoDb => {
            let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
            if let Some(endpoint) = &settings.dynamodb_endpoint {
                loader = loader.endpoint_url(endpoint);
            }
            let config = loader.load().await;
            info!(table = %settings.dynamodb_table, "Using DynamoDB cache store");
            Arc::new(DynamoDbStore::new(
                aws_sdk_dynamodb::Client::new(&config),
                settings.dynamodb_table.clone(),
            ))
        }
    }
}

fn redelivery_backoff(settings: &Settings) -> Backoff {
    Backoff::exponential(Duration::from_secs(1), 2.0, settings.visibility_timeout)
}

async fn build_queue(settings: &Settings) -> Result<Arc<dyn Queue>> {
    match settings.queue_backend {
        QueueBackend::Memory => Ok(Arc::new(MemoryQueue::new(MemoryQueueConfig {
            visibility_timeout: settings.visibility_timeout,
            redelivery: redelivery_backoff(settings),
            ..MemoryQueueConfig::default()
        }))),
        #[cfg(feature = "kafka")]
        QueueBackend::Kafka => {
            let queue = mention_relay::kafka::KafkaQueue::connect(mention_relay::kafka::KafkaConfig {
                brokers: settings.kafka_brokers.clone(),
                send_timeout: settings.call_timeout,
                redelivery: redelivery_backoff(settings),
            })
            .await?;
            Ok(Arc::new(queue))
        }
        #[cfg(not(feature = "kafka"))]
        QueueBackend::Kafka => {
            anyhow::bail!("QUEUE_BACKEND=kafka requires building with the `kafka` feature")
        }
    }
}

async fn serve(addr: SocketAddr, router: axum::Router, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Control surface listening on {addr}");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing()?;

    let settings = Settings::from_env()?;
    let mode = cli.command;

    if mode != Commands::All
        && (settings.queue_backend == QueueBackend::Memory
            || settings.cache_backend == CacheBackend::Memory)
    {
        warn!("Memory backends are process-local; producer and consumer only share them in `all` mode");
    }

    let store = build_store(&settings).await;
    let queue = build_queue(&settings)
        .await
        .context("cannot reach the queue broker")?;
    let limiter = RateLimiter::new(
        Arc::clone(&store),
        settings.rate_limit_max_requests,
        settings.rate_limit_window,
    );

    let platform: Arc<dyn SocialPlatform> = Arc::new(TwitterClient::new(TwitterConfig {
        api_base: settings.twitter_api_base.clone(),
        bearer_token: settings.twitter_bearer_token.clone(),
        access_token: settings.twitter_access_token.clone(),
        timeout: settings.call_timeout,
    })?);

    let producer = if mode.runs_producer() {
        let account_id = platform
            .resolve_account(settings.monitored_account.as_deref())
            .await
            .context("failed to resolve the monitored account")?;

        Some(Arc::new(Producer::new(
            Arc::clone(&platform),
            Arc::clone(&queue),
            CursorStore::new(Arc::clone(&store)),
            limiter.clone(),
            FetchGate::new(Arc::clone(&store), settings.fetch_min_gap),
            ProducerConfig {
                account_id,
                topic: settings.queue_topic.clone(),
                poll_interval: settings.poll_interval,
                min_poll_interval: settings.min_poll_interval,
                call_timeout: settings.call_timeout,
            },
        )))
    } else {
        None
    };

    let consumer = if mode.runs_consumer() {
        let generator = ChatCompletionsGenerator::new(GeneratorConfig {
            base_url: settings.ai_base_url.clone(),
            api_key: settings.require_ai_api_key()?.to_string(),
            model: settings.ai_model.clone(),
            timeout: settings.call_timeout,
        })?;
        let guard = ReplyGuard::new(
            Arc::clone(&store),
            GuardConfig::new(
                Uuid::new_v4(),
                settings.max_processing_time,
                settings.marker_ttl,
                Backoff::exponential(
                    Duration::from_millis(200),
                    2.0,
                    settings.max_processing_time,
                ),
            ),
        );

        let consumer = Consumer::connect(
            queue.as_ref(),
            guard,
            Arc::new(generator),
            Arc::clone(&platform),
            limiter.clone(),
            ConsumerConfig {
                topic: settings.queue_topic.clone(),
                group: settings.consumer_group.clone(),
                style: settings.reply_style.clone(),
                max_reply_chars: settings.max_reply_chars,
                max_retries: settings.max_retries,
                call_timeout: settings.call_timeout,
            },
        )
        .await
        .context("cannot subscribe to the mention queue")?;
        Some(Arc::new(consumer))
    } else {
        None
    };

    if settings.autostart {
        if let Some(producer) = &producer {
            producer.start().await;
        }
        if let Some(consumer) = &consumer {
            consumer.start().await;
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut servers = Vec::new();
    if let Some(producer) = &producer {
        servers.push(tokio::spawn(serve(
            settings.producer_addr,
            producer_router(Arc::clone(producer)),
            shutdown_rx.clone(),
        )));
    }
    if let Some(consumer) = &consumer {
        servers.push(tokio::spawn(serve(
            settings.consumer_addr,
            consumer_router(Arc::clone(consumer)),
            shutdown_rx.clone(),
        )));
    }

    let early_exit = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl-C")?;
            info!("Shutdown requested - draining services");
            None
        }
        (finished, _, _) = futures::future::select_all(servers.iter_mut()) => {
            warn!("Control surface exited - draining services");
            Some(finished)
        }
    };

    if let Some(producer) = &producer {
        producer.stop().await;
    }
    if let Some(consumer) = &consumer {
        consumer.stop().await;
    }
    let _ = shutdown_tx.send(true);

    if let Some(finished) = early_exit {
        finished??;
        anyhow::bail!("control surface exited unexpectedly");
    }
    for server in servers {
        server.await??;
    }

    info!("Shutdown complete");
    Ok(())
}
