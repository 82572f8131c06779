use prometheus::{Counter, Gauge, Registry};
use std::sync::Arc;

pub struct ConsumptionMetrics {
    pub messages_polled: Counter,
    pub messages_committed: Counter,
    pub delivery_errors: Counter,
    pub messages_in_flight: Gauge,
    pub error_threshold: Gauge,
    pub registry: Registry,
}

impl ConsumptionMetrics {
    pub fn new() -> Arc<Self> {
        let registry = Registry::new();

        let messages_polled = Counter::new(
            "messages_polled_total",
            "Total messages handed to the processing loop",
        )
        .expect("Failed to create messages_polled counter");

        let messages_committed = Counter::new(
            "messages_committed_total",
            "Total offsets committed after consumption",
        )
        .expect("Failed to create messages_committed counter");

        let delivery_errors = Counter::new(
            "delivery_errors_total",
            "Total failed delivery outcomes reported",
        )
        .expect("Failed to create delivery_errors counter");

        let messages_in_flight = Gauge::new(
            "messages_in_flight",
            "Messages fetched but not yet freed by the processing loop",
        )
        .expect("Failed to create messages_in_flight gauge");

        let error_threshold = Gauge::new(
            "error_rate_threshold",
            "Current sliding-window error-rate threshold",
        )
        .expect("Failed to create error_threshold gauge");

        registry
            .register(Box::new(messages_polled.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_committed.clone()))
            .unwrap();
        registry
            .register(Box::new(delivery_errors.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_in_flight.clone()))
            .unwrap();
        registry
            .register(Box::new(error_threshold.clone()))
            .unwrap();

        Arc::new(Self {
            messages_polled,
            messages_committed,
            delivery_errors,
            messages_in_flight,
            error_threshold,
            registry,
        })
    }
}
