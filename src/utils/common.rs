// src/utils/common.rs

use lapin::{
    options::{BasicConsumeOptions, BasicQosOptions, QueueDeclareOptions},
    types::FieldTable,
    Channel, Connection, ConnectionProperties, Consumer, Result as LapinResult,
};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info};

use crate::error::{PipelineError, Result};

const CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(5);

// Helper function to connect to RabbitMQ with retry
pub async fn connect_rabbitmq(addr: &str) -> LapinResult<Connection> {
    let options = ConnectionProperties::default()
        .with_executor(tokio_executor_trait::Tokio::current())
        .with_reactor(tokio_reactor_trait::Tokio);

    let mut attempts = 0;
    loop {
        match Connection::connect(addr, options.clone()).await {
            Ok(conn) => {
                info!("Successfully connected to RabbitMQ at {}", addr);
                return Ok(conn);
            }
            Err(e) => {
                attempts += 1;
                error!(
                    attempt = attempts,
                    error = %e,
                    "Failed to connect to RabbitMQ. Retrying in 5 seconds..."
                );
                if attempts >= CONNECT_ATTEMPTS {
                    return Err(e);
                }
                sleep(CONNECT_RETRY_DELAY).await;
            }
        }
    }
}

async fn declare_durable(channel: &Channel, queue: &str, role: &str) -> Result<()> {
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| {
            PipelineError::QueueError(format!("{} failed to declare queue '{}': {}", role, queue, e))
        })?;
    Ok(())
}

/// Opens a publish channel for `publish_queue` and a consumer on `consume_queue`.
///
/// Both queues are declared durable. The consumer channel gets `prefetch_count`
/// as its QoS so one worker never buffers more submissions than it can run.
pub async fn setup_channels_and_queues(
    conn: &Connection,
    publish_queue: &str,
    consume_queue: &str,
    prefetch_count: u16,
    role: &str,
) -> Result<(Channel, Consumer)> {
    let consume_channel = conn.create_channel().await.map_err(|e| {
        PipelineError::QueueError(format!("{} failed to create consume channel: {}", role, e))
    })?;
    let publish_channel = conn.create_channel().await.map_err(|e| {
        PipelineError::QueueError(format!("{} failed to create publish channel: {}", role, e))
    })?;

    declare_durable(&publish_channel, publish_queue, role).await?;
    declare_durable(&consume_channel, consume_queue, role).await?;

    consume_channel
        .basic_qos(prefetch_count, BasicQosOptions::default())
        .await
        .map_err(|e| PipelineError::QueueError(format!("Failed to set QoS: {}", e)))?;

    let consumer_tag = format!(
        "{}-{}-{}",
        role,
        std::process::id(),
        chrono::Utc::now().timestamp()
    );
    let consumer = consume_channel
        .basic_consume(
            consume_queue,
            &consumer_tag,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await?;

    Ok((publish_channel, consumer))
}
