//! Protocol adapters: one per wire protocol.
//!
//! Each adapter owns its listening socket, parses incoming bytes into
//! traffic items, hands them to the dispatcher, renders replayed responses
//! back to the transport-native byte form, and forwards outgoing client
//! traffic to the real backend in record mode.

pub mod amqp;
pub mod framed_tcp;
pub mod ftp;
pub mod http;
pub mod line_tcp;
pub mod xmlrpc;

use std::net::SocketAddr;

use crate::error::Result;
use crate::traffic::{Direction, TrafficTag};

/// The wire protocols an instance of the server can speak, selected by the
/// `server_protocol` configuration key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerProtocol {
    ClassicTcp,
    ClassicUdp,
    TcpHeader,
    Http,
    XmlRpc,
    Ftp,
    Amqp,
}

impl ServerProtocol {
    /// Defaults to `classic_tcp` on a missing or unknown value.
    pub fn from_config_value(value: &str) -> Self {
        match value {
            "classic_udp" => ServerProtocol::ClassicUdp,
            "tcp_header" => ServerProtocol::TcpHeader,
            "http" => ServerProtocol::Http,
            "xmlrpc" => ServerProtocol::XmlRpc,
            "ftp" => ServerProtocol::Ftp,
            "amqp" => ServerProtocol::Amqp,
            _ => ServerProtocol::ClassicTcp,
        }
    }

    /// The traffic classes the protocol's adapter understands, per
    /// direction.
    pub fn traffic_classes(self, direction: Direction) -> Vec<TrafficTag> {
        match (self, direction) {
            (ServerProtocol::ClassicTcp | ServerProtocol::ClassicUdp, Direction::Incoming) => {
                vec![TrafficTag::Cli, TrafficTag::Cmd, TrafficTag::Pyt, TrafficTag::Srv]
            }
            (ServerProtocol::ClassicTcp | ServerProtocol::ClassicUdp, Direction::Outgoing) => {
                vec![
                    TrafficTag::Srv,
                    TrafficTag::Out,
                    TrafficTag::Err,
                    TrafficTag::Exc,
                    TrafficTag::Ret,
                ]
            }
            (ServerProtocol::TcpHeader, Direction::Incoming) => {
                vec![TrafficTag::Cli, TrafficTag::Srv]
            }
            (ServerProtocol::TcpHeader, Direction::Outgoing) => {
                vec![TrafficTag::Srv, TrafficTag::Cli]
            }
            (ServerProtocol::Http | ServerProtocol::XmlRpc, Direction::Incoming) => {
                vec![TrafficTag::Cli]
            }
            (ServerProtocol::Http | ServerProtocol::XmlRpc, Direction::Outgoing) => {
                vec![TrafficTag::Srv]
            }
            (ServerProtocol::Ftp, Direction::Incoming) => vec![TrafficTag::Cli],
            (ServerProtocol::Ftp, Direction::Outgoing) => {
                vec![TrafficTag::Srv, TrafficTag::Fil, TrafficTag::Lst]
            }
            (ServerProtocol::Amqp, Direction::Incoming) => vec![TrafficTag::Rmq],
            (ServerProtocol::Amqp, Direction::Outgoing) => vec![TrafficTag::Rmq],
        }
    }

    /// Produce the shutdown signal appropriate to the transport.
    pub async fn send_terminate(self, address: &SocketAddr) -> Result<()> {
        match self {
            ServerProtocol::ClassicTcp
            | ServerProtocol::TcpHeader
            | ServerProtocol::Ftp => line_tcp::send_terminate_tcp(address).await,
            ServerProtocol::ClassicUdp => line_tcp::send_terminate_udp(address).await,
            ServerProtocol::Http | ServerProtocol::XmlRpc => http::send_terminate(address).await,
            // The AMQP adapter consumes from the broker, but its control
            // listener still takes the line-oriented terminate message.
            ServerProtocol::Amqp => line_tcp::send_terminate_tcp(address).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_protocol_values_default_to_classic_tcp() {
        assert_eq!(
            ServerProtocol::from_config_value("surprise"),
            ServerProtocol::ClassicTcp
        );
        assert_eq!(ServerProtocol::from_config_value("ftp"), ServerProtocol::Ftp);
    }

    #[test]
    fn command_traffic_belongs_to_the_line_adapters_only() {
        assert!(ServerProtocol::ClassicTcp
            .traffic_classes(Direction::Incoming)
            .contains(&TrafficTag::Cmd));
        assert!(!ServerProtocol::Http
            .traffic_classes(Direction::Incoming)
            .contains(&TrafficTag::Cmd));
        assert_eq!(
            ServerProtocol::Amqp.traffic_classes(Direction::Outgoing),
            vec![TrafficTag::Rmq]
        );
    }
}
