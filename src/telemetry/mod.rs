//! Telemetry broadcasting
//!
//! Every ingested marker becomes one sample pushed to an external telemetry
//! outlet, tagged with the trigger that was current when ingest read it. The
//! stream runs whether or not anything is recording; kind `None` is a normal
//! state, not a gap.

mod broadcaster;
mod udp;

pub use broadcaster::{TelemetryBroadcaster, TelemetryStats, TelemetryStatsHandle};
pub use udp::{StreamInfo, UdpConnector};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::markers::FrameMarkerEvent;
use crate::trigger::TriggerEvent;

/// One outgoing `(sequence, trigger_time, trigger_kind_code)` sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub sequence: u64,
    pub trigger_time: f64,
    pub trigger_kind_code: i32,
}

impl TelemetrySample {
    pub fn tagged(marker: &FrameMarkerEvent, trigger: &TriggerEvent) -> Self {
        Self {
            sequence: marker.sequence,
            trigger_time: trigger.time,
            trigger_kind_code: trigger.kind.code(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to connect telemetry outlet: {0}")]
    Connect(String),
    #[error("failed to push telemetry sample: {0}")]
    Push(String),
    #[error("failed to encode telemetry packet: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// An open connection to the telemetry consumer
pub trait TelemetrySink: Send {
    fn push(&mut self, sample: &TelemetrySample) -> Result<(), SinkError>;
}

/// Opens fresh sink connections; called again after every failure
pub trait SinkConnector: Send + Sync {
    /// May block on name resolution, so it runs on the blocking pool
    fn connect(&self) -> Result<Box<dyn TelemetrySink>, SinkError>;

    /// Human-readable destination for logs
    fn describe(&self) -> String;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Records every sample; optionally refuses connections
    #[derive(Clone, Default)]
    pub(crate) struct RecordingConnector {
        pub samples: Arc<Mutex<Vec<TelemetrySample>>>,
        pub refuse: bool,
    }

    struct RecordingSink {
        samples: Arc<Mutex<Vec<TelemetrySample>>>,
    }

    impl TelemetrySink for RecordingSink {
        fn push(&mut self, sample: &TelemetrySample) -> Result<(), SinkError> {
            self.samples.lock().unwrap().push(*sample);
            Ok(())
        }
    }

    impl SinkConnector for RecordingConnector {
        fn connect(&self) -> Result<Box<dyn TelemetrySink>, SinkError> {
            if self.refuse {
                return Err(SinkError::Connect("refused".to_string()));
            }
            Ok(Box::new(RecordingSink {
                samples: self.samples.clone(),
            }))
        }

        fn describe(&self) -> String {
            "test outlet".to_string()
        }
    }

    /// Connects fine but fails every push
    pub(crate) struct FailingConnector;

    struct FailingSink;

    impl TelemetrySink for FailingSink {
        fn push(&mut self, _sample: &TelemetrySample) -> Result<(), SinkError> {
            Err(SinkError::Push("outlet gone".to_string()))
        }
    }

    impl SinkConnector for FailingConnector {
        fn connect(&self) -> Result<Box<dyn TelemetrySink>, SinkError> {
            Ok(Box::new(FailingSink))
        }

        fn describe(&self) -> String {
            "failing outlet".to_string()
        }
    }
}
