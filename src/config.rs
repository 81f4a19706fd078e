use std::{
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

use typed_builder::TypedBuilder;

use crate::net::BROKER_PORT;

#[derive(Debug, Clone, TypedBuilder)]
pub struct BrokerConfig {
    /// Address the broker accepts clients and workers on.
    #[builder(default = SocketAddr::from((Ipv4Addr::UNSPECIFIED, BROKER_PORT)))]
    pub listen: SocketAddr,
    /// How long a single `Step` call may take before its worker is marked
    /// dead.
    #[builder(default = Duration::from_secs(10))]
    pub dispatch_timeout: Duration,
    /// How many times a failed turn is retried against the remaining
    /// workers before the run is given up.
    #[builder(default = 1)]
    pub turn_retries: u32,
    /// How long in-flight calls get to finish when the broker shuts down.
    #[builder(default = Duration::from_secs(5))]
    pub shutdown_grace: Duration,
    /// How long the broker waits for each worker to acknowledge a shutdown.
    #[builder(default = Duration::from_secs(1))]
    pub worker_shutdown_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Clone, TypedBuilder)]
pub struct WorkerConfig {
    #[builder(default = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))]
    pub listen: SocketAddr,
    /// Address the broker should dial. Defaults to the bound address, which
    /// only works when the worker listens on a concrete interface.
    #[builder(default, setter(strip_option))]
    pub advertise: Option<String>,
    /// Broker to register with once listening.
    #[builder(default, setter(strip_option))]
    pub broker: Option<SocketAddr>,
    #[builder(default = Duration::from_secs(2))]
    pub shutdown_grace: Duration,
}

#[derive(Debug, Clone, TypedBuilder)]
pub struct ControllerConfig {
    pub broker: SocketAddr,
    pub width: u32,
    pub height: u32,
    pub turns: u32,
    /// Interval between alive-cell reports.
    #[builder(default = Duration::from_secs(2))]
    pub tick: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_defaults() {
        let config = BrokerConfig::default();
        assert_eq!(config.listen.port(), BROKER_PORT);
        assert_eq!(config.turn_retries, 1);
        assert_eq!(config.dispatch_timeout, Duration::from_secs(10));
    }

    #[test]
    fn worker_overrides() {
        let broker: SocketAddr = "127.0.0.1:8030".parse().unwrap();
        let config = WorkerConfig::builder()
            .broker(broker)
            .advertise("10.0.0.7:9000".to_string())
            .build();
        assert_eq!(config.broker, Some(broker));
        assert_eq!(config.advertise.as_deref(), Some("10.0.0.7:9000"));
        assert_eq!(config.listen.port(), 0);
    }
}
