//! Server configuration.

use std::time::Duration;

use crate::config::{ConnectType, EndpointConfig};
use crate::protocol::{CapabilityDescriptor, NegotiationPolicy};

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind endpoint; its timeout is also the idle session timeout
    pub endpoint: EndpointConfig,
    /// Capability of the bound pipeline segment
    pub capability: CapabilityDescriptor,
    /// Matching rules for offers
    pub policy: NegotiationPolicy,
    /// How often idle sessions are swept
    pub sweep_interval: Duration,
    /// Frames buffered between the receive tasks and `ServerSource`
    pub inbound_capacity: usize,
    /// Frames buffered per session between `ServerSink` and its writer
    pub outbound_capacity: usize,
}

impl ServerConfig {
    /// Default settings serving `capability`.
    pub fn new(capability: CapabilityDescriptor) -> Self {
        Self {
            endpoint: EndpointConfig::default(),
            capability,
            policy: NegotiationPolicy::default(),
            sweep_interval: Duration::from_secs(1),
            inbound_capacity: 256,
            outbound_capacity: 64,
        }
    }

    /// Set the whole endpoint
    pub fn with_endpoint(mut self, endpoint: EndpointConfig) -> Self {
        self.endpoint = endpoint;
        self
    }

    /// Set bind host
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.endpoint.host = host.into();
        self
    }

    /// Set bind port
    pub fn with_port(mut self, port: u16) -> Self {
        self.endpoint.port = port;
        self
    }

    /// Set transport
    pub fn with_connect_type(mut self, connect_type: ConnectType) -> Self {
        self.endpoint.connect_type = connect_type;
        self
    }

    /// Set timeout in seconds
    pub fn with_timeout(mut self, timeout_secs: u32) -> Self {
        self.endpoint.timeout_secs = timeout_secs;
        self
    }

    /// Set matching policy
    pub fn with_policy(mut self, policy: NegotiationPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set sweep period
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set queue capacities
    pub fn with_queue_capacity(mut self, inbound: usize, outbound: usize) -> Self {
        self.inbound_capacity = inbound.max(1);
        self.outbound_capacity = outbound.max(1);
        self
    }
}
