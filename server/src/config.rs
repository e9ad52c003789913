//! Runtime configuration for a relay instance

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Which wire binding a server instance speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Length-prefixed frames over TCP
    Stream,
    /// One envelope per UDP datagram
    Datagram,
}

impl Transport {
    /// Prefix for generated session ids.
    pub fn session_prefix(self) -> &'static str {
        match self {
            Transport::Stream => "player",
            Transport::Datagram => "udp_player",
        }
    }

    pub fn protocol_name(self) -> &'static str {
        match self {
            Transport::Stream => "TCP",
            Transport::Datagram => "UDP",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Stream => f.write_str("stream"),
            Transport::Datagram => f.write_str("datagram"),
        }
    }
}

impl FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stream" | "tcp" => Ok(Transport::Stream),
            "datagram" | "udp" => Ok(Transport::Datagram),
            other => Err(format!("unknown transport '{other}', expected stream or datagram")),
        }
    }
}

/// Server settings. Start from [`RelayConfig::stream`] or
/// [`RelayConfig::datagram`] and override fields as needed.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub transport: Transport,
    pub host: String,
    pub port: u16,
    /// How often the liveness sweep runs
    pub heartbeat_interval: Duration,
    /// Silence after which a session is evicted
    pub liveness_timeout: Duration,
    /// How often empty rooms are garbage-collected
    pub cleanup_interval: Duration,
    pub ingress_queue_capacity: usize,
    pub processor_workers: usize,
    pub recv_buffer_size: usize,
    /// Upper bound on in-flight datagram sends per broadcast
    pub fanout_concurrency: usize,
    pub write_timeout: Duration,
    /// Whether `list_rooms` is answered
    pub allow_room_listing: bool,
}

impl RelayConfig {
    pub fn stream() -> Self {
        Self {
            transport: Transport::Stream,
            host: "127.0.0.1".to_string(),
            port: 12345,
            heartbeat_interval: Duration::from_secs(30),
            liveness_timeout: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(300),
            ingress_queue_capacity: 0,
            processor_workers: 0,
            recv_buffer_size: 0,
            fanout_concurrency: 1,
            write_timeout: Duration::from_secs(5),
            allow_room_listing: false,
        }
    }

    pub fn datagram() -> Self {
        Self {
            transport: Transport::Datagram,
            host: "127.0.0.1".to_string(),
            port: 12346,
            heartbeat_interval: Duration::from_secs(30),
            liveness_timeout: Duration::from_secs(90),
            cleanup_interval: Duration::from_secs(300),
            ingress_queue_capacity: 1000,
            processor_workers: 2,
            recv_buffer_size: 4096,
            fanout_concurrency: 64,
            write_timeout: Duration::from_secs(5),
            allow_room_listing: true,
        }
    }

    pub fn for_transport(transport: Transport) -> Self {
        match transport {
            Transport::Stream => Self::stream(),
            Transport::Datagram => Self::datagram(),
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Clamps values that would stall a binding to their smallest usable
    /// setting.
    pub fn normalized(mut self) -> Self {
        if self.transport == Transport::Datagram {
            self.ingress_queue_capacity = self.ingress_queue_capacity.max(1);
            self.processor_workers = self.processor_workers.max(1);
            self.recv_buffer_size = self.recv_buffer_size.max(512);
        }
        self.fanout_concurrency = self.fanout_concurrency.max(1);
        self
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::stream()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_defaults() {
        let stream = RelayConfig::stream();
        let datagram = RelayConfig::datagram();

        assert_eq!(stream.liveness_timeout, Duration::from_secs(60));
        assert_eq!(datagram.liveness_timeout, Duration::from_secs(90));
        assert_eq!(stream.heartbeat_interval, datagram.heartbeat_interval);
        assert_eq!(datagram.ingress_queue_capacity, 1000);
        assert!(datagram.allow_room_listing);
        assert!(!stream.allow_room_listing);
        assert_eq!(stream.bind_address(), "127.0.0.1:12345");
    }

    #[test]
    fn test_transport_parsing() {
        assert_eq!("stream".parse::<Transport>(), Ok(Transport::Stream));
        assert_eq!("UDP".parse::<Transport>(), Ok(Transport::Datagram));
        assert!("carrier-pigeon".parse::<Transport>().is_err());
        assert_eq!(Transport::Datagram.session_prefix(), "udp_player");
    }

    #[test]
    fn test_normalized_clamps_zeroes() {
        let mut config = RelayConfig::datagram();
        config.ingress_queue_capacity = 0;
        config.processor_workers = 0;
        config.fanout_concurrency = 0;

        let config = config.normalized();
        assert_eq!(config.ingress_queue_capacity, 1);
        assert_eq!(config.processor_workers, 1);
        assert_eq!(config.fanout_concurrency, 1);
    }
}
