//! UDP telemetry outlet
//!
//! Each connection starts with a MessagePack map describing the stream,
//! followed by one MessagePack array `[sequence, trigger_time, trigger_kind_code]`
//! per datagram. A connected UDP socket reports refused delivery on a later
//! send, which the broadcaster treats as a dropped connection.

use serde::Serialize;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use tracing::debug;

use super::{SinkConnector, SinkError, TelemetrySample, TelemetrySink};

/// Stream description announced on every (re)connection
#[derive(Debug, Clone, Serialize)]
pub struct StreamInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub stream_type: String,
    pub channel_count: u32,
    /// 0 means irregular rate
    pub nominal_rate_hz: f64,
    pub source_id: String,
}

pub struct UdpConnector {
    target: String,
    info: StreamInfo,
}

impl UdpConnector {
    pub fn new(target: impl Into<String>, info: StreamInfo) -> Self {
        Self {
            target: target.into(),
            info,
        }
    }

    fn resolve(&self) -> Result<SocketAddr, SinkError> {
        self.target
            .to_socket_addrs()
            .map_err(|e| SinkError::Connect(format!("cannot resolve {}: {}", self.target, e)))?
            .next()
            .ok_or_else(|| SinkError::Connect(format!("no address for {}", self.target)))
    }
}

impl SinkConnector for UdpConnector {
    fn connect(&self) -> Result<Box<dyn TelemetrySink>, SinkError> {
        let addr = self.resolve()?;
        let bind: SocketAddr = if addr.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };

        let socket = UdpSocket::bind(bind)?;
        socket.connect(addr)?;
        socket.set_nonblocking(true)?;

        let header = rmp_serde::to_vec_named(&self.info)?;
        socket.send(&header)?;
        debug!("Announced telemetry stream '{}' to {}", self.info.name, addr);

        Ok(Box::new(UdpSink { socket }))
    }

    fn describe(&self) -> String {
        format!("udp://{} ({})", self.target, self.info.name)
    }
}

struct UdpSink {
    socket: UdpSocket,
}

impl TelemetrySink for UdpSink {
    fn push(&mut self, sample: &TelemetrySample) -> Result<(), SinkError> {
        let packet = rmp_serde::to_vec(sample)?;
        let sent = self
            .socket
            .send(&packet)
            .map_err(|e| SinkError::Push(e.to_string()))?;
        if sent != packet.len() {
            return Err(SinkError::Push(format!(
                "short datagram ({} of {} bytes)",
                sent,
                packet.len()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> StreamInfo {
        StreamInfo {
            name: "camera_markers".to_string(),
            stream_type: "Markers".to_string(),
            channel_count: 3,
            nominal_rate_hz: 0.0,
            source_id: "cam0".to_string(),
        }
    }

    #[test]
    fn test_header_then_samples() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(std::time::Duration::from_secs(2)))
            .unwrap();
        let target = receiver.local_addr().unwrap().to_string();

        let connector = UdpConnector::new(target, info());
        let mut sink = connector.connect().unwrap();
        sink.push(&TelemetrySample {
            sequence: 9,
            trigger_time: 12.5,
            trigger_kind_code: 2,
        })
        .unwrap();

        let mut buf = [0u8; 512];
        let n = receiver.recv(&mut buf).unwrap();
        let header: serde_json::Value = rmp_serde::from_slice(&buf[..n]).unwrap();
        assert_eq!(header["name"], "camera_markers");
        assert_eq!(header["type"], "Markers");
        assert_eq!(header["channel_count"], 3);

        let n = receiver.recv(&mut buf).unwrap();
        let (sequence, trigger_time, code): (u64, f64, i32) =
            rmp_serde::from_slice(&buf[..n]).unwrap();
        assert_eq!((sequence, trigger_time, code), (9, 12.5, 2));
    }

    #[test]
    fn test_unresolvable_target_fails_to_connect() {
        let connector = UdpConnector::new("not a host", info());
        assert!(matches!(connector.connect(), Err(SinkError::Connect(_))));
    }
}
