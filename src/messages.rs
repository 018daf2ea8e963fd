//! Message shapes exchanged at the edges of the store components.
//!
//! Only the fields the store reads or routes on are modelled; everything
//! else travels as opaque payload bytes.

use crate::ids::{DevAddr, EndDeviceIdentifiers};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An uplink as seen by uplink matching.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UplinkMessage {
    pub dev_addr: DevAddr,
    /// Frame counter as received; only the low 16 bits are transmitted.
    pub f_cnt: u32,
    /// The ACK bit of the frame header.
    pub ack: bool,
    #[serde(default)]
    pub raw_payload: Vec<u8>,
    #[serde(default)]
    pub correlation_ids: Vec<String>,
}

impl UplinkMessage {
    /// The 16 frame counter bits transmitted on air.
    pub fn f_cnt_lsb(&self) -> u16 {
        (self.f_cnt & 0xFFFF) as u16
    }
}

/// A downlink scheduled for transmission by a gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownlinkMessage {
    #[serde(default)]
    pub raw_payload: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_device_ids: Option<EndDeviceIdentifiers>,
    #[serde(default)]
    pub correlation_ids: Vec<String>,
}

/// Outcome of a downlink transmission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxResult {
    #[default]
    Success,
    UnknownError,
    TooLate,
    TooEarly,
    CollisionPacket,
    CollisionBeacon,
    TxFreq,
    TxPower,
    GpsUnlocked,
}

/// Acknowledgment of a downlink transmission by a gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxAcknowledgment {
    #[serde(default)]
    pub correlation_ids: Vec<String>,
    #[serde(default)]
    pub result: TxResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downlink_message: Option<DownlinkMessage>,
}

/// An application-layer uplink message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplicationUplink {
    pub session_key_id: Vec<u8>,
    pub f_port: u32,
    pub f_cnt: u32,
    pub frm_payload: Vec<u8>,
    #[serde(default)]
    pub confirmed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplicationUplinkNormalized {
    pub session_key_id: Vec<u8>,
    pub f_port: u32,
    pub f_cnt: u32,
    pub normalized_payload: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplicationJoinAccept {
    pub session_key_id: Vec<u8>,
    #[serde(default)]
    pub pending_session: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplicationDownlink {
    pub session_key_id: Vec<u8>,
    pub f_port: u32,
    pub f_cnt: u32,
    pub frm_payload: Vec<u8>,
    #[serde(default)]
    pub confirmed: bool,
    #[serde(default)]
    pub correlation_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplicationDownlinkFailed {
    pub downlink: ApplicationDownlink,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplicationInvalidatedDownlinks {
    pub downlinks: Vec<ApplicationDownlink>,
    pub last_f_cnt_down: u32,
    pub session_key_id: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplicationLocation {
    pub service: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub altitude: i32,
    #[serde(default)]
    pub accuracy: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplicationServiceData {
    pub service: String,
    pub data: BTreeMap<String, String>,
}

/// The event carried by an [`ApplicationUp`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Up {
    UplinkMessage(ApplicationUplink),
    UplinkNormalized(ApplicationUplinkNormalized),
    JoinAccept(ApplicationJoinAccept),
    DownlinkAck(ApplicationDownlink),
    DownlinkNack(ApplicationDownlink),
    DownlinkSent(ApplicationDownlink),
    DownlinkFailed(ApplicationDownlinkFailed),
    DownlinkQueued(ApplicationDownlink),
    DownlinkQueueInvalidated(ApplicationInvalidatedDownlinks),
    LocationSolved(ApplicationLocation),
    ServiceData(ApplicationServiceData),
}

/// Sub-stream of the application uplink queue a message is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpStream {
    JoinAccept,
    Invalidation,
    Generic,
}

impl UpStream {
    /// All sub-streams in drain priority order.
    pub const PRIORITY: [UpStream; 3] = [
        UpStream::JoinAccept,
        UpStream::Invalidation,
        UpStream::Generic,
    ];

    /// Key suffix below `uplinks`; `None` for the generic stream.
    pub fn suffix(self) -> Option<&'static str> {
        match self {
            UpStream::JoinAccept => Some("join-accept"),
            UpStream::Invalidation => Some("invalidation"),
            UpStream::Generic => None,
        }
    }
}

/// An event sent from the Application Server to integrations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationUp {
    pub end_device_ids: EndDeviceIdentifiers,
    #[serde(default)]
    pub correlation_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_at: Option<DateTime<Utc>>,
    pub up: Up,
}

impl ApplicationUp {
    pub fn new(end_device_ids: EndDeviceIdentifiers, up: Up) -> Self {
        Self {
            end_device_ids,
            correlation_ids: Vec::new(),
            received_at: None,
            up,
        }
    }

    pub fn stream(&self) -> UpStream {
        match self.up {
            Up::JoinAccept(_) => UpStream::JoinAccept,
            Up::DownlinkQueueInvalidated(_) => UpStream::Invalidation,
            _ => UpStream::Generic,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_routing() {
        let ids = EndDeviceIdentifiers::new("app", "dev");
        let join = ApplicationUp::new(ids.clone(), Up::JoinAccept(Default::default()));
        let inval = ApplicationUp::new(
            ids.clone(),
            Up::DownlinkQueueInvalidated(Default::default()),
        );
        let up = ApplicationUp::new(ids, Up::UplinkMessage(Default::default()));
        assert_eq!(join.stream(), UpStream::JoinAccept);
        assert_eq!(inval.stream(), UpStream::Invalidation);
        assert_eq!(up.stream(), UpStream::Generic);
    }

    #[test]
    fn test_f_cnt_lsb() {
        let up = UplinkMessage {
            f_cnt: 0x1_0041,
            ..Default::default()
        };
        assert_eq!(up.f_cnt_lsb(), 0x0041);
    }
}
