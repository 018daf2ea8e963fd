//! LoRaWAN identifiers.
//!
//! Application and device IDs are lowercase slugs; a device is uniquely
//! identified by the UID `<application-id>.<device-id>`. EUIs and device
//! addresses render as uppercase hex, which is also their key form.

use crate::core::error::{StoreError, StoreResult};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Maximum length of an application or device ID.
pub const MAX_ID_LENGTH: usize = 36;

static ID_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9](?:-?[a-z0-9]){2,}$").expect("static regex compiles")
});

/// Validate an application or device ID.
pub fn validate_id(kind: &str, id: &str) -> StoreResult<()> {
    if id.len() > MAX_ID_LENGTH || !ID_REGEX.is_match(id) {
        return Err(StoreError::invalid_identifiers(format!(
            "invalid {kind} `{id}`"
        )));
    }
    Ok(())
}

fn parse_hex<const N: usize>(s: &str) -> Result<[u8; N], String> {
    if s.len() != N * 2 || !s.is_ascii() {
        return Err(format!("expected {} hex digits, got `{s}`", N * 2));
    }
    let mut out = [0u8; N];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
            .map_err(|_| format!("invalid hex `{s}`"))?;
    }
    Ok(out)
}

macro_rules! hex_id {
    ($name:ident, $len:expr, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            pub fn is_zero(&self) -> bool {
                self.0.iter().all(|b| *b == 0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                for b in self.0 {
                    write!(f, "{b:02X}")?;
                }
                Ok(())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                parse_hex::<$len>(s).map($name)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

hex_id!(Eui64, 8, "A 64-bit extended unique identifier.");
hex_id!(DevAddr, 4, "A 32-bit device address.");

impl DevAddr {
    pub fn from_u32(v: u32) -> Self {
        Self(v.to_be_bytes())
    }

    pub fn to_u32(self) -> u32 {
        u32::from_be_bytes(self.0)
    }
}

/// Identifies an application.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationIdentifiers {
    pub application_id: String,
}

impl ApplicationIdentifiers {
    pub fn new(application_id: impl Into<String>) -> Self {
        Self {
            application_id: application_id.into(),
        }
    }

    /// The application UID, which is its ID.
    pub fn unique_id(&self) -> &str {
        &self.application_id
    }

    pub fn validate(&self) -> StoreResult<()> {
        validate_id("application ID", &self.application_id)
    }
}

/// Identifies an end device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndDeviceIdentifiers {
    pub application_ids: ApplicationIdentifiers,
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_eui: Option<Eui64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev_eui: Option<Eui64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev_addr: Option<DevAddr>,
}

impl EndDeviceIdentifiers {
    pub fn new(application_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            application_ids: ApplicationIdentifiers::new(application_id),
            device_id: device_id.into(),
            ..Default::default()
        }
    }

    /// `<application-id>.<device-id>`
    pub fn unique_id(&self) -> String {
        device_uid(&self.application_ids.application_id, &self.device_id)
    }

    pub fn validate(&self) -> StoreResult<()> {
        self.application_ids.validate()?;
        validate_id("device ID", &self.device_id)
    }

    /// Both EUIs, if present.
    pub fn euis(&self) -> Option<(Eui64, Eui64)> {
        Some((self.join_eui?, self.dev_eui?))
    }
}

/// UID of a device.
pub fn device_uid(application_id: &str, device_id: &str) -> String {
    format!("{application_id}.{device_id}")
}

/// Split a device UID into validated application and device IDs.
pub fn parse_device_uid(uid: &str) -> StoreResult<EndDeviceIdentifiers> {
    let (app, dev) = uid
        .split_once('.')
        .ok_or_else(|| StoreError::invalid_identifiers(format!("invalid device UID `{uid}`")))?;
    let ids = EndDeviceIdentifiers::new(app, dev);
    ids.validate()?;
    Ok(ids)
}
