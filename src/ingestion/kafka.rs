use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message;

use super::{MessageQueue, QueueError, QueueMessage};

/// Kafka topic consumer in a consumer group, starting from the earliest
/// offset when the group has none committed.
pub struct KafkaQueue {
    consumer: StreamConsumer,
    topic: String,
}

fn client_config(brokers: &[String], group_id: &str) -> ClientConfig {
    let mut config = ClientConfig::new();
    config
        .set("bootstrap.servers", brokers.join(","))
        .set("group.id", group_id)
        .set("auto.offset.reset", "earliest")
        .set("enable.auto.commit", "true")
        .set("fetch.min.bytes", "10000")
        .set("fetch.wait.max.ms", "1000");
    config
}

impl KafkaQueue {
    pub fn connect(brokers: &[String], group_id: &str, topic: &str) -> Result<Self, QueueError> {
        let consumer: StreamConsumer = client_config(brokers, group_id)
            .create()
            .inspect_err(|e| log::error!("Failed to create Kafka consumer: {}", e))?;
        consumer
            .subscribe(&[topic])
            .inspect_err(|e| log::error!("Failed to subscribe to topic {}: {}", topic, e))?;

        log::info!(
            "Subscribed to Kafka topic {} as group {} on {}",
            topic,
            group_id,
            brokers.join(",")
        );
        Ok(Self {
            consumer,
            topic: topic.to_string(),
        })
    }
}

#[async_trait]
impl MessageQueue for KafkaQueue {
    async fn read_next(&self) -> Result<QueueMessage, QueueError> {
        let message = self.consumer.recv().await?;
        let payload = message.payload().ok_or(QueueError::EmptyPayload)?.to_vec();
        Ok(QueueMessage {
            key: message.key().map(<[u8]>::to_vec),
            payload,
        })
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.consumer.unsubscribe();
        log::info!("Unsubscribed from Kafka topic {}", self.topic);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config() {
        let brokers = vec!["kafka-1:9092".to_string(), "kafka-2:9092".to_string()];
        let config = client_config(&brokers, "container_group_id");
        assert_eq!(config.get("bootstrap.servers"), Some("kafka-1:9092,kafka-2:9092"));
        assert_eq!(config.get("group.id"), Some("container_group_id"));
        assert_eq!(config.get("auto.offset.reset"), Some("earliest"));
    }
}
