//! Compact session projections stored in the DevAddr `:fields` hashes.
//!
//! Projections are MessagePack maps keyed by small integer tags:
//!
//! | Tag | Field               | Encoding                                  |
//! |-----|---------------------|-------------------------------------------|
//! | 1   | FNwkSIntKey         | `[bin key \| nil, str kek_label, bin \| nil]` or nil |
//! | 2   | LoRaWAN version     | uint                                      |
//! | 3   | LastFCnt            | uint, omitted when zero                   |
//! | 4   | ResetsFCnt          | bool, omitted when unknown                |
//! | 5   | Supports32BitFCnt   | bool, omitted when unknown                |
//!
//! Pending projections carry tags 1 and 2 only. Values under tags a kind
//! does not know are skipped, so newer writers can add fields. A map with
//! more entries than its kind knows, or with a repeated tag, is corrupt.

use super::model::{EndDevice, KeyEnvelope, MacVersion};
use crate::core::error::{StoreError, StoreResult};
use crate::ids::DevAddr;
use rmp::Marker;

const TAG_KEY: u8 = 1;
const TAG_VERSION: u8 = 2;
const TAG_LAST_F_CNT: u8 = 3;
const TAG_RESETS_F_CNT: u8 = 4;
const TAG_SUPPORTS_32_BIT_F_CNT: u8 = 5;

/// Deepest nesting accepted inside a skipped value.
const MAX_SKIP_DEPTH: usize = 8;

/// Projection of an active session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CurrentProjection {
    pub f_nwk_s_int_key: Option<KeyEnvelope>,
    pub lorawan_version: MacVersion,
    pub last_f_cnt: u32,
    pub resets_f_cnt: Option<bool>,
    pub supports_32_bit_f_cnt: Option<bool>,
}

/// Projection of a pending session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingProjection {
    pub f_nwk_s_int_key: Option<KeyEnvelope>,
    pub lorawan_version: MacVersion,
}

impl CurrentProjection {
    /// The DevAddr and projection of the active session of `dev`.
    pub fn of(dev: &EndDevice) -> Option<(DevAddr, Self)> {
        let session = dev.session.as_ref()?;
        let version = dev
            .mac_state
            .as_ref()
            .map(|s| s.lorawan_version)
            .unwrap_or(dev.lorawan_version);
        Some((
            session.dev_addr,
            Self {
                f_nwk_s_int_key: session.keys.f_nwk_s_int_key.clone(),
                lorawan_version: version,
                last_f_cnt: session.last_f_cnt_up,
                resets_f_cnt: dev.resets_f_cnt(),
                supports_32_bit_f_cnt: dev.supports_32_bit_f_cnt(),
            },
        ))
    }

    pub fn encode(&self) -> StoreResult<Vec<u8>> {
        let mut len = 2;
        len += u32::from(self.last_f_cnt != 0);
        len += u32::from(self.resets_f_cnt.is_some());
        len += u32::from(self.supports_32_bit_f_cnt.is_some());

        let mut buf = Vec::with_capacity(64);
        rmp::encode::write_map_len(&mut buf, len).map_err(write_err)?;
        write_common(&mut buf, &self.f_nwk_s_int_key, self.lorawan_version)?;
        if self.last_f_cnt != 0 {
            write_tag(&mut buf, TAG_LAST_F_CNT)?;
            rmp::encode::write_uint(&mut buf, u64::from(self.last_f_cnt)).map_err(write_err)?;
        }
        if let Some(v) = self.resets_f_cnt {
            write_tag(&mut buf, TAG_RESETS_F_CNT)?;
            rmp::encode::write_bool(&mut buf, v).map_err(write_err)?;
        }
        if let Some(v) = self.supports_32_bit_f_cnt {
            write_tag(&mut buf, TAG_SUPPORTS_32_BIT_F_CNT)?;
            rmp::encode::write_bool(&mut buf, v).map_err(write_err)?;
        }
        Ok(buf)
    }

    pub fn decode(mut data: &[u8]) -> StoreResult<Self> {
        let rd = &mut data;
        let len = read_map_len(rd, 5)?;
        let mut out = Self::default();
        let mut seen = Vec::with_capacity(len as usize);
        for _ in 0..len {
            match read_tag(rd, &mut seen)? {
                Some(TAG_KEY) => out.f_nwk_s_int_key = read_key(rd)?,
                Some(TAG_VERSION) => out.lorawan_version = read_version(rd)?,
                Some(TAG_LAST_F_CNT) => out.last_f_cnt = read_u32(rd)?,
                Some(TAG_RESETS_F_CNT) => out.resets_f_cnt = Some(read_bool(rd)?),
                Some(TAG_SUPPORTS_32_BIT_F_CNT) => {
                    out.supports_32_bit_f_cnt = Some(read_bool(rd)?)
                }
                _ => skip_value(rd, 0)?,
            }
        }
        Ok(out)
    }
}

impl PendingProjection {
    /// The DevAddr and projection of the pending session of `dev`.
    pub fn of(dev: &EndDevice) -> Option<(DevAddr, Self)> {
        let session = dev.pending_session.as_ref()?;
        let version = dev
            .pending_mac_state
            .as_ref()
            .map(|s| s.lorawan_version)
            .unwrap_or(dev.lorawan_version);
        Some((
            session.dev_addr,
            Self {
                f_nwk_s_int_key: session.keys.f_nwk_s_int_key.clone(),
                lorawan_version: version,
            },
        ))
    }

    pub fn encode(&self) -> StoreResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(48);
        rmp::encode::write_map_len(&mut buf, 2).map_err(write_err)?;
        write_common(&mut buf, &self.f_nwk_s_int_key, self.lorawan_version)?;
        Ok(buf)
    }

    pub fn decode(mut data: &[u8]) -> StoreResult<Self> {
        let rd = &mut data;
        let len = read_map_len(rd, 2)?;
        let mut out = Self::default();
        let mut seen = Vec::with_capacity(len as usize);
        for _ in 0..len {
            match read_tag(rd, &mut seen)? {
                Some(TAG_KEY) => out.f_nwk_s_int_key = read_key(rd)?,
                Some(TAG_VERSION) => out.lorawan_version = read_version(rd)?,
                _ => skip_value(rd, 0)?,
            }
        }
        Ok(out)
    }
}

fn corrupt(message: impl Into<String>) -> StoreError {
    StoreError::corruption(message)
}

fn write_err<E>(_: E) -> StoreError {
    corrupt("failed to encode session projection")
}

fn read_err<E>(_: E) -> StoreError {
    corrupt("malformed session projection")
}

fn write_tag(buf: &mut Vec<u8>, tag: u8) -> StoreResult<()> {
    rmp::encode::write_uint(buf, u64::from(tag)).map_err(write_err)?;
    Ok(())
}

fn write_common(
    buf: &mut Vec<u8>,
    key: &Option<KeyEnvelope>,
    version: MacVersion,
) -> StoreResult<()> {
    write_tag(buf, TAG_KEY)?;
    match key {
        None => rmp::encode::write_nil(buf).map_err(write_err)?,
        Some(env) => {
            rmp::encode::write_array_len(buf, 3).map_err(write_err)?;
            write_opt_bin(buf, env.key.as_deref())?;
            rmp::encode::write_str(buf, &env.kek_label).map_err(write_err)?;
            write_opt_bin(buf, env.encrypted_key.as_deref())?;
        }
    }
    write_tag(buf, TAG_VERSION)?;
    rmp::encode::write_uint(buf, u64::from(version.as_u8())).map_err(write_err)?;
    Ok(())
}

fn write_opt_bin(buf: &mut Vec<u8>, data: Option<&[u8]>) -> StoreResult<()> {
    match data {
        Some(data) => rmp::encode::write_bin(buf, data).map_err(write_err),
        None => rmp::encode::write_nil(buf).map_err(write_err),
    }
}

fn read_map_len(rd: &mut &[u8], max: u32) -> StoreResult<u32> {
    let len = rmp::decode::read_map_len(rd).map_err(read_err)?;
    if len > max {
        return Err(corrupt(format!(
            "session projection has {len} fields, at most {max} are known"
        )));
    }
    Ok(len)
}

/// Read a field tag. Tags that do not fit a `u8` are never known and
/// come back as `None`.
fn read_tag(rd: &mut &[u8], seen: &mut Vec<u64>) -> StoreResult<Option<u8>> {
    let tag: u64 = rmp::decode::read_int(rd).map_err(read_err)?;
    if seen.contains(&tag) {
        return Err(corrupt(format!("repeated session projection tag {tag}")));
    }
    seen.push(tag);
    Ok(u8::try_from(tag).ok())
}

/// Skip one MessagePack value.
fn skip_value(rd: &mut &[u8], depth: usize) -> StoreResult<()> {
    if depth > MAX_SKIP_DEPTH {
        return Err(corrupt("session projection nests too deeply"));
    }
    let (bytes, values) = match rmp::decode::read_marker(rd).map_err(read_err)? {
        Marker::FixPos(_) | Marker::FixNeg(_) | Marker::Null | Marker::True | Marker::False => {
            (0, 0)
        }
        Marker::U8 | Marker::I8 => (1, 0),
        Marker::U16 | Marker::I16 => (2, 0),
        Marker::U32 | Marker::I32 | Marker::F32 => (4, 0),
        Marker::U64 | Marker::I64 | Marker::F64 => (8, 0),
        Marker::FixStr(n) => (usize::from(n), 0),
        Marker::Str8 | Marker::Bin8 => (read_be_len(rd, 1)?, 0),
        Marker::Str16 | Marker::Bin16 => (read_be_len(rd, 2)?, 0),
        Marker::Str32 | Marker::Bin32 => (read_be_len(rd, 4)?, 0),
        Marker::FixArray(n) => (0, usize::from(n)),
        Marker::Array16 => (0, read_be_len(rd, 2)?),
        Marker::Array32 => (0, read_be_len(rd, 4)?),
        Marker::FixMap(n) => (0, usize::from(n) * 2),
        Marker::Map16 => (0, read_be_len(rd, 2)? * 2),
        Marker::Map32 => (0, read_be_len(rd, 4)? * 2),
        Marker::FixExt1 => (2, 0),
        Marker::FixExt2 => (3, 0),
        Marker::FixExt4 => (5, 0),
        Marker::FixExt8 => (9, 0),
        Marker::FixExt16 => (17, 0),
        Marker::Ext8 => (read_be_len(rd, 1)? + 1, 0),
        Marker::Ext16 => (read_be_len(rd, 2)? + 1, 0),
        Marker::Ext32 => (read_be_len(rd, 4)? + 1, 0),
        Marker::Reserved => return Err(corrupt("reserved marker in session projection")),
    };
    take(rd, bytes)?;
    for _ in 0..values {
        skip_value(rd, depth + 1)?;
    }
    Ok(())
}

fn read_u32(rd: &mut &[u8]) -> StoreResult<u32> {
    rmp::decode::read_int(rd).map_err(read_err)
}

fn read_bool(rd: &mut &[u8]) -> StoreResult<bool> {
    rmp::decode::read_bool(rd).map_err(read_err)
}

fn read_version(rd: &mut &[u8]) -> StoreResult<MacVersion> {
    let v: u8 = rmp::decode::read_int(rd).map_err(read_err)?;
    MacVersion::from_u8(v).ok_or_else(|| corrupt(format!("unknown LoRaWAN version {v}")))
}

fn take<'a>(rd: &mut &'a [u8], n: usize) -> StoreResult<&'a [u8]> {
    if rd.len() < n {
        return Err(corrupt("truncated session projection"));
    }
    let (head, tail) = rd.split_at(n);
    *rd = tail;
    Ok(head)
}

fn read_be_len(rd: &mut &[u8], width: usize) -> StoreResult<usize> {
    Ok(take(rd, width)?
        .iter()
        .fold(0usize, |acc, b| (acc << 8) | usize::from(*b)))
}

fn read_opt_bin(rd: &mut &[u8]) -> StoreResult<Option<Vec<u8>>> {
    let len = match rmp::decode::read_marker(rd).map_err(read_err)? {
        Marker::Null => return Ok(None),
        Marker::Bin8 => read_be_len(rd, 1)?,
        Marker::Bin16 => read_be_len(rd, 2)?,
        Marker::Bin32 => read_be_len(rd, 4)?,
        other => return Err(corrupt(format!("expected bytes, got {other:?}"))),
    };
    Ok(Some(take(rd, len)?.to_vec()))
}

fn read_key(rd: &mut &[u8]) -> StoreResult<Option<KeyEnvelope>> {
    if rd.first() == Some(&Marker::Null.to_u8()) {
        take(rd, 1)?;
        return Ok(None);
    }
    let len = rmp::decode::read_array_len(rd).map_err(read_err)?;
    if len != 3 {
        return Err(corrupt(format!("key envelope has {len} fields, expected 3")));
    }
    let key = read_opt_bin(rd)?;
    let label_len = rmp::decode::read_str_len(rd).map_err(read_err)? as usize;
    let kek_label = std::str::from_utf8(take(rd, label_len)?)
        .map_err(read_err)?
        .to_string();
    let encrypted_key = read_opt_bin(rd)?;
    Ok(Some(KeyEnvelope {
        key,
        kek_label,
        encrypted_key,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> KeyEnvelope {
        KeyEnvelope {
            key: Some(vec![0x42; 16]),
            kek_label: String::new(),
            encrypted_key: None,
        }
    }

    #[test]
    fn test_current_round_trip() {
        let full = CurrentProjection {
            f_nwk_s_int_key: Some(key()),
            lorawan_version: MacVersion::V1_1,
            last_f_cnt: 0x1_0042,
            resets_f_cnt: Some(false),
            supports_32_bit_f_cnt: Some(true),
        };
        assert_eq!(CurrentProjection::decode(&full.encode().unwrap()).unwrap(), full);

        let sparse = CurrentProjection {
            lorawan_version: MacVersion::V1_0_3,
            ..Default::default()
        };
        let bytes = sparse.encode().unwrap();
        // map of two: nil key and version.
        assert_eq!(bytes[0], 0x82);
        assert_eq!(CurrentProjection::decode(&bytes).unwrap(), sparse);
    }

    #[test]
    fn test_pending_round_trip() {
        let pending = PendingProjection {
            f_nwk_s_int_key: Some(KeyEnvelope {
                key: None,
                kek_label: "ns".into(),
                encrypted_key: Some(vec![1, 2, 3]),
            }),
            lorawan_version: MacVersion::V1_0_4,
        };
        assert_eq!(
            PendingProjection::decode(&pending.encode().unwrap()).unwrap(),
            pending
        );
    }

    #[test]
    fn test_rejects_unknown_shapes() {
        let current = CurrentProjection {
            last_f_cnt: 1,
            resets_f_cnt: Some(true),
            ..Default::default()
        };
        let bytes = current.encode().unwrap();
        assert!(PendingProjection::decode(&bytes).is_err());

        let mut buf = Vec::new();
        rmp::encode::write_map_len(&mut buf, 2).unwrap();
        rmp::encode::write_uint(&mut buf, 2).unwrap();
        rmp::encode::write_uint(&mut buf, 1).unwrap();
        rmp::encode::write_uint(&mut buf, 2).unwrap();
        rmp::encode::write_uint(&mut buf, 1).unwrap();
        assert!(CurrentProjection::decode(&buf).is_err());

        assert!(CurrentProjection::decode(&[0x81]).is_err());
    }

    #[test]
    fn test_skips_fields_of_newer_writers() {
        // Version, last FCnt and two fields this release does not know.
        let mut buf = Vec::new();
        rmp::encode::write_map_len(&mut buf, 4).unwrap();
        rmp::encode::write_uint(&mut buf, 9).unwrap();
        rmp::encode::write_map_len(&mut buf, 1).unwrap();
        rmp::encode::write_str(&mut buf, "nested").unwrap();
        rmp::encode::write_array_len(&mut buf, 2).unwrap();
        rmp::encode::write_bin(&mut buf, &[1, 2, 3]).unwrap();
        rmp::encode::write_f64(&mut buf, 0.5).unwrap();
        rmp::encode::write_uint(&mut buf, u64::from(TAG_VERSION)).unwrap();
        rmp::encode::write_uint(&mut buf, u64::from(MacVersion::V1_1.as_u8())).unwrap();
        rmp::encode::write_uint(&mut buf, 300).unwrap();
        rmp::encode::write_str(&mut buf, "later").unwrap();
        rmp::encode::write_uint(&mut buf, u64::from(TAG_LAST_F_CNT)).unwrap();
        rmp::encode::write_uint(&mut buf, 42).unwrap();

        let got = CurrentProjection::decode(&buf).unwrap();
        assert_eq!(
            got,
            CurrentProjection {
                lorawan_version: MacVersion::V1_1,
                last_f_cnt: 42,
                ..Default::default()
            }
        );

        // Pending projections skip current-only tags within their budget.
        let mut buf = Vec::new();
        rmp::encode::write_map_len(&mut buf, 2).unwrap();
        rmp::encode::write_uint(&mut buf, u64::from(TAG_LAST_F_CNT)).unwrap();
        rmp::encode::write_uint(&mut buf, 7).unwrap();
        rmp::encode::write_uint(&mut buf, u64::from(TAG_VERSION)).unwrap();
        rmp::encode::write_uint(&mut buf, u64::from(MacVersion::V1_0_4.as_u8())).unwrap();
        assert_eq!(
            PendingProjection::decode(&buf).unwrap().lorawan_version,
            MacVersion::V1_0_4
        );

        // A truncated unknown value is still corrupt.
        let mut buf = Vec::new();
        rmp::encode::write_map_len(&mut buf, 1).unwrap();
        rmp::encode::write_uint(&mut buf, 9).unwrap();
        rmp::encode::write_array_len(&mut buf, 2).unwrap();
        rmp::encode::write_uint(&mut buf, 1).unwrap();
        assert!(CurrentProjection::decode(&buf).is_err());
    }
}
