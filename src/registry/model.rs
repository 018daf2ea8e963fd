//! End device records.
//!
//! Every struct defaults missing fields, so a record projected on a field
//! mask decodes back into the same types.

use crate::ids::{device_uid, DevAddr, EndDeviceIdentifiers};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// LoRaWAN MAC version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MacVersion {
    #[default]
    Unknown,
    V1_0,
    V1_0_1,
    V1_0_2,
    V1_0_3,
    V1_0_4,
    V1_1,
}

impl MacVersion {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Unknown,
            1 => Self::V1_0,
            2 => Self::V1_0_1,
            3 => Self::V1_0_2,
            4 => Self::V1_0_3,
            5 => Self::V1_0_4,
            6 => Self::V1_1,
            _ => return None,
        })
    }
}

/// A session key, either in the clear or wrapped by a KEK.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyEnvelope {
    pub key: Option<Vec<u8>>,
    pub kek_label: String,
    pub encrypted_key: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionKeys {
    pub session_key_id: Vec<u8>,
    pub f_nwk_s_int_key: Option<KeyEnvelope>,
    pub s_nwk_s_int_key: Option<KeyEnvelope>,
    pub nwk_s_enc_key: Option<KeyEnvelope>,
}

/// An active or pending network session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Session {
    pub dev_addr: DevAddr,
    pub keys: SessionKeys,
    pub last_f_cnt_up: u32,
    pub last_n_f_cnt_down: u32,
    pub started_at: Option<DateTime<Utc>>,
}

/// A device served by a relay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServedDevice {
    pub device_id: String,
}

/// Relay configuration of a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayParameters {
    /// This device relays traffic of the listed devices.
    Serving { served: Vec<ServedDevice> },
    /// This device is relayed by `serving_device_id`.
    Served { serving_device_id: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MacSettings {
    pub resets_f_cnt: Option<bool>,
    pub supports_32_bit_f_cnt: Option<bool>,
    pub relay: Option<RelayParameters>,
    pub desired_relay: Option<RelayParameters>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MacState {
    pub lorawan_version: MacVersion,
    pub current_relay: Option<RelayParameters>,
    pub desired_relay: Option<RelayParameters>,
}

/// An end device as stored by the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndDevice {
    pub ids: EndDeviceIdentifiers,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub name: String,
    pub description: String,
    pub attributes: BTreeMap<String, String>,
    pub frequency_plan_id: String,
    pub lorawan_version: MacVersion,
    pub mac_settings: Option<MacSettings>,
    pub mac_state: Option<MacState>,
    pub pending_mac_state: Option<MacState>,
    pub session: Option<Session>,
    pub pending_session: Option<Session>,
}

impl EndDevice {
    pub fn new(ids: EndDeviceIdentifiers) -> Self {
        Self {
            ids,
            ..Default::default()
        }
    }

    pub fn resets_f_cnt(&self) -> Option<bool> {
        self.mac_settings.as_ref().and_then(|s| s.resets_f_cnt)
    }

    pub fn supports_32_bit_f_cnt(&self) -> Option<bool> {
        self.mac_settings
            .as_ref()
            .and_then(|s| s.supports_32_bit_f_cnt)
    }

    /// UIDs of the devices this device serves as a relay, across its
    /// settings and current/desired MAC state.
    pub fn served_device_uids(&self) -> BTreeSet<String> {
        let app = &self.ids.application_ids.application_id;
        let settings = self
            .mac_settings
            .iter()
            .flat_map(|s| [s.relay.as_ref(), s.desired_relay.as_ref()]);
        let states = [self.mac_state.as_ref(), self.pending_mac_state.as_ref()]
            .into_iter()
            .flatten()
            .flat_map(|s| [s.current_relay.as_ref(), s.desired_relay.as_ref()]);
        settings
            .chain(states)
            .flatten()
            .filter_map(|relay| match relay {
                RelayParameters::Serving { served } => Some(served),
                RelayParameters::Served { .. } => None,
            })
            .flatten()
            .map(|d| device_uid(app, &d.device_id))
            .collect()
    }
}
