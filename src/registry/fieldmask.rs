//! Field masks over end device records.
//!
//! A mask is a list of dotted paths (`session.dev_addr`). Records are
//! projected and merged through their `serde_json` form, so any path in
//! [`END_DEVICE_FIELD_PATHS`] works on any serializable record shape that
//! defaults missing fields.

use crate::core::error::{StoreError, StoreResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

/// Every path an end device field mask may name.
pub const END_DEVICE_FIELD_PATHS: &[&str] = &[
    "ids",
    "ids.application_ids",
    "ids.application_ids.application_id",
    "ids.device_id",
    "ids.join_eui",
    "ids.dev_eui",
    "ids.dev_addr",
    "created_at",
    "updated_at",
    "name",
    "description",
    "attributes",
    "frequency_plan_id",
    "lorawan_version",
    "mac_settings",
    "mac_settings.resets_f_cnt",
    "mac_settings.supports_32_bit_f_cnt",
    "mac_settings.relay",
    "mac_settings.desired_relay",
    "mac_state",
    "mac_state.lorawan_version",
    "mac_state.current_relay",
    "mac_state.desired_relay",
    "pending_mac_state",
    "pending_mac_state.lorawan_version",
    "pending_mac_state.current_relay",
    "pending_mac_state.desired_relay",
    "session",
    "session.dev_addr",
    "session.keys",
    "session.keys.session_key_id",
    "session.keys.f_nwk_s_int_key",
    "session.keys.s_nwk_s_int_key",
    "session.keys.nwk_s_enc_key",
    "session.last_f_cnt_up",
    "session.last_n_f_cnt_down",
    "session.started_at",
    "pending_session",
    "pending_session.dev_addr",
    "pending_session.keys",
    "pending_session.keys.session_key_id",
    "pending_session.keys.f_nwk_s_int_key",
    "pending_session.keys.s_nwk_s_int_key",
    "pending_session.keys.nwk_s_enc_key",
    "pending_session.last_f_cnt_up",
    "pending_session.last_n_f_cnt_down",
    "pending_session.started_at",
];

/// Paths managed by the registry.
pub const READ_ONLY_PATHS: &[&str] = &["created_at", "updated_at"];

/// Paths that may only be set on create.
pub const IMMUTABLE_PATHS: &[&str] = &[
    "ids.application_ids",
    "ids.device_id",
    "ids.join_eui",
    "ids.dev_eui",
];

/// Whether `parent` equals `path` or is one of its ancestors.
pub fn covers(parent: &str, path: &str) -> bool {
    path == parent
        || (path.len() > parent.len()
            && path.starts_with(parent)
            && path.as_bytes()[parent.len()] == b'.')
}

fn overlaps(a: &str, b: &str) -> bool {
    covers(a, b) || covers(b, a)
}

/// Whether any of `paths` overlaps any of `candidates`.
pub fn has_any<S: AsRef<str>>(paths: &[S], candidates: &[&str]) -> bool {
    paths
        .iter()
        .any(|p| candidates.iter().any(|c| overlaps(p.as_ref(), c)))
}

/// Reject paths unknown to end devices.
pub fn validate_paths<S: AsRef<str>>(paths: &[S]) -> StoreResult<()> {
    for path in paths {
        let path = path.as_ref();
        if !END_DEVICE_FIELD_PATHS.contains(&path) {
            return Err(StoreError::InvalidFieldmask {
                path: path.to_string(),
            });
        }
    }
    Ok(())
}

/// Reject writes to registry-managed paths, and to immutable paths unless
/// the record is being created.
pub fn check_writable<S: AsRef<str>>(paths: &[S], create: bool) -> StoreResult<()> {
    for path in paths {
        let path = path.as_ref();
        let read_only = READ_ONLY_PATHS.iter().any(|ro| overlaps(path, ro))
            || (!create && IMMUTABLE_PATHS.iter().any(|ro| overlaps(path, ro)));
        if read_only {
            return Err(StoreError::ReadOnlyField {
                path: path.to_string(),
            });
        }
    }
    Ok(())
}

fn pointer(path: &str) -> String {
    path.split('.').fold(String::new(), |mut acc, seg| {
        acc.push('/');
        acc.push_str(seg);
        acc
    })
}

/// Set (`Some`) or clear (`None`) `path` in `root`, creating parents as
/// needed when setting.
fn put(root: &mut Value, path: &str, value: Option<Value>) {
    let segments: Vec<&str> = path.split('.').collect();
    let Some((last, parents)) = segments.split_last() else {
        return;
    };
    let mut at = String::new();
    for seg in parents {
        let parent = at.clone();
        at.push('/');
        at.push_str(seg);
        if root.pointer(&at).is_some_and(Value::is_object) {
            continue;
        }
        if value.is_none() {
            return;
        }
        if let Some(Value::Object(map)) = root.pointer_mut(&parent) {
            map.insert((*seg).to_string(), Value::Object(Map::new()));
        }
    }
    if let Some(Value::Object(map)) = root.pointer_mut(&at) {
        match value {
            Some(v) => {
                map.insert((*last).to_string(), v);
            }
            None => {
                map.remove(*last);
            }
        }
    }
}

fn to_value<T: Serialize>(record: &T) -> StoreResult<Value> {
    serde_json::to_value(record)
        .map_err(|e| StoreError::corruption(format!("failed to convert record: {e}")))
}

fn from_value<T: DeserializeOwned>(value: Value) -> StoreResult<T> {
    serde_json::from_value(value)
        .map_err(|e| StoreError::corruption(format!("failed to convert record: {e}")))
}

/// Copy of `record` with only `paths` set; everything else defaults.
pub fn project<T, S>(record: &T, paths: &[S]) -> StoreResult<T>
where
    T: Serialize + DeserializeOwned,
    S: AsRef<str>,
{
    let src = to_value(record)?;
    let mut out = Value::Object(Map::new());
    for path in paths {
        let path = path.as_ref();
        if let Some(v) = src.pointer(&pointer(path)) {
            put(&mut out, path, Some(v.clone()));
        }
    }
    from_value(out)
}

/// `dst` with the values at `paths` taken from `src`.
///
/// A path absent in `src` is cleared in the result.
pub fn set_fields<T, S>(dst: &T, src: &T, paths: &[S]) -> StoreResult<T>
where
    T: Serialize + DeserializeOwned,
    S: AsRef<str>,
{
    let mut out = to_value(dst)?;
    let src = to_value(src)?;
    for path in paths {
        let path = path.as_ref();
        put(&mut out, path, src.pointer(&pointer(path)).cloned());
    }
    from_value(out)
}
