//! AMQP adapter: consume every message on the configured exchange in
//! record mode, publish recorded messages back in replay mode.
//!
//! The reserved routing key `CaptureMock` with body `terminate` stops the
//! adapter. A plain TCP control listener runs alongside the broker
//! connection so the process driver can terminate and address-probe the
//! server the same way as for the socket protocols.

use std::sync::Arc;

use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Connection, ConnectionProperties, ExchangeKind};
use log::{debug, warn};
use tokio::net::TcpListener;

use crate::dispatcher::{Forward, NoForward};
use crate::error::{Error, Result};
use crate::server::ServerState;
use crate::traffic::{TrafficItem, TrafficTag};

pub const AMQP_SECTION: &str = "amqp";
pub const CONTROL_ROUTING_KEY: &str = "CaptureMock";
pub const TERMINATE_BODY: &str = "terminate";

pub fn is_terminate_delivery(routing_key: &str, body: &[u8]) -> bool {
    routing_key == CONTROL_ROUTING_KEY && body == TERMINATE_BODY.as_bytes()
}

pub async fn run(state: Arc<ServerState>, listener: TcpListener) {
    let control_state = state.clone();
    tokio::select! {
        () = super::line_tcp::run(control_state, listener) => {}
        () = broker_loop(state) => {}
    }
}

async fn broker_loop(state: Arc<ServerState>) {
    if let Err(e) = consume(&state).await {
        warn!("AMQP adapter stopped: {e}");
        state.trigger_shutdown();
    }
}

async fn consume(state: &Arc<ServerState>) -> Result<()> {
    let Some(url) = state.config.get_with_address("url", &[AMQP_SECTION]) else {
        return Err(Error::Broker {
            url: String::new(),
            reason: "no [amqp] url configured".to_string(),
        });
    };
    let broker_error = |reason: String| Error::Broker {
        url: url.clone(),
        reason,
    };
    let connection = Connection::connect(&url, ConnectionProperties::default())
        .await
        .map_err(|e| broker_error(e.to_string()))?;
    let channel = connection
        .create_channel()
        .await
        .map_err(|e| broker_error(e.to_string()))?;

    let config = &state.config;
    let exchange = config.get_or(AMQP_SECTION, "exchange", "capturemock").to_string();
    let kind = exchange_kind(config.get_or(AMQP_SECTION, "exchange_type", "topic"));
    let options = ExchangeDeclareOptions {
        durable: config.get_bool(AMQP_SECTION, "durable", false),
        auto_delete: config.get_bool(AMQP_SECTION, "auto_delete", true),
        ..ExchangeDeclareOptions::default()
    };
    channel
        .exchange_declare(&exchange, kind, options, FieldTable::default())
        .await
        .map_err(|e| broker_error(e.to_string()))?;

    let queue = channel
        .queue_declare(
            "",
            QueueDeclareOptions {
                exclusive: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| broker_error(e.to_string()))?;
    channel
        .queue_bind(
            queue.name().as_str(),
            &exchange,
            "#",
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| broker_error(e.to_string()))?;
    let mut consumer = channel
        .basic_consume(
            queue.name().as_str(),
            "capturemock",
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| broker_error(e.to_string()))?;
    debug!("Consuming on exchange {exchange}");

    let forward_exchange = config.get(AMQP_SECTION, "exchange_forward").map(str::to_string);
    while let Some(delivery) = consumer.next().await {
        let delivery = match delivery {
            Ok(delivery) => delivery,
            Err(e) => {
                warn!("Broker delivery failed: {e}");
                break;
            }
        };
        if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
            warn!("Could not ack delivery: {e}");
        }
        let routing_key = delivery.routing_key.as_str().to_string();
        if is_terminate_delivery(&routing_key, &delivery.data) {
            state.trigger_shutdown();
            return Ok(());
        }

        let mut text = routing_key.clone();
        let body = String::from_utf8_lossy(&delivery.data);
        if !body.is_empty() {
            text.push('\n');
            text.push_str(&body);
        }
        let mut item = TrafficItem::incoming(TrafficTag::Rmq, text);
        item.headers = header_annotations(&delivery.properties);

        let request = state.dispatcher.next_request_number();
        let outcome = match &forward_exchange {
            Some(forward_exchange) => {
                let forward = PublishForward {
                    channel: channel.clone(),
                    exchange: forward_exchange.clone(),
                };
                state.dispatcher.process(item, request, &forward).await
            }
            None => state.dispatcher.process(item, request, &NoForward).await,
        };
        match outcome {
            Ok(responses) => {
                for response in responses.iter().filter(|r| r.tag == TrafficTag::Rmq) {
                    if let Err(e) = publish_item(&channel, &exchange, response).await {
                        warn!("Could not publish replayed message: {e}");
                    }
                }
            }
            Err(Error::ReplayMismatch(message)) => {
                warn!("Replay mismatch on AMQP delivery: {message}");
            }
            Err(e) => warn!("AMQP dispatch failed: {e}"),
        }
    }
    Ok(())
}

fn exchange_kind(name: &str) -> ExchangeKind {
    match name {
        "direct" => ExchangeKind::Direct,
        "fanout" => ExchangeKind::Fanout,
        "headers" => ExchangeKind::Headers,
        "topic" => ExchangeKind::Topic,
        other => ExchangeKind::Custom(other.to_string()),
    }
}

/// Flatten delivery properties into `--HEA:` annotations. Timestamps ride
/// in the headers table, not the top-level property.
fn header_annotations(properties: &BasicProperties) -> Vec<(String, String)> {
    let mut annotations = Vec::new();
    if let Some(table) = properties.headers() {
        for (key, value) in table.inner() {
            annotations.push((key.to_string(), amqp_value_text(value)));
        }
    }
    annotations
}

fn amqp_value_text(value: &AMQPValue) -> String {
    match value {
        AMQPValue::LongString(text) => text.to_string(),
        AMQPValue::Boolean(flag) => flag.to_string(),
        AMQPValue::LongInt(number) => number.to_string(),
        AMQPValue::LongLongInt(number) => number.to_string(),
        AMQPValue::Double(number) => number.to_string(),
        AMQPValue::Timestamp(stamp) => stamp.to_string(),
        other => format!("{other:?}"),
    }
}

/// Publish one outgoing item: first text line is the routing key, the rest
/// is the body, `--HEA:` annotations become the headers table.
async fn publish_item(
    channel: &lapin::Channel,
    exchange: &str,
    item: &TrafficItem,
) -> Result<()> {
    let (routing_key, body) = item.text.split_once('\n').unwrap_or((item.text.as_str(), ""));
    let mut table = FieldTable::default();
    for (key, value) in &item.headers {
        table.insert(
            key.to_string().into(),
            AMQPValue::LongString(value.to_string().into()),
        );
    }
    channel
        .basic_publish(
            exchange,
            routing_key,
            BasicPublishOptions::default(),
            body.as_bytes(),
            BasicProperties::default().with_headers(table),
        )
        .await
        .map_err(|e| Error::Broker {
            url: exchange.to_string(),
            reason: e.to_string(),
        })?;
    Ok(())
}

/// Client path in record mode: republish the consumed message onto the
/// forward exchange and expect no reply.
struct PublishForward {
    channel: lapin::Channel,
    exchange: String,
}

#[async_trait::async_trait]
impl Forward for PublishForward {
    async fn forward(&self, item: &TrafficItem) -> std::io::Result<Vec<TrafficItem>> {
        publish_item(&self.channel, &self.exchange, item)
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::ConnectionRefused, e.to_string()))?;
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminate_deliveries_are_recognised() {
        assert!(is_terminate_delivery("CaptureMock", b"terminate"));
        assert!(!is_terminate_delivery("CaptureMock", b"hello"));
        assert!(!is_terminate_delivery("orders.created", b"terminate"));
    }

    #[test]
    fn exchange_kinds_parse_with_custom_fallback() {
        assert!(matches!(exchange_kind("topic"), ExchangeKind::Topic));
        assert!(matches!(exchange_kind("fanout"), ExchangeKind::Fanout));
        assert!(matches!(exchange_kind("x-delayed"), ExchangeKind::Custom(_)));
    }
}
