//! Outbound observability: Prometheus self-metrics and the optional
//! InfluxDB rate sink.

pub mod health;
pub mod influx;
