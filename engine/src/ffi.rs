//! FFI layer for mobile clients.
//!
//! Lets a client that keeps its own storage run the merger and the queue
//! rules in-process. All data crosses the boundary as JSON strings.
//!
//! # Memory Management
//!
//! - Strings returned by `tally_*` functions are allocated by Rust
//! - Caller must free them with `tally_string_free`
//!
//! # Error Handling
//!
//! Functions return JSON with either:
//! - `{"ok": <result>}` on success
//! - `{"error": "<message>"}` on failure

use crate::{Merger, PaymentDraft, QueueSnapshot, QueuedOp, RemoteSnapshot, StoreDraft};
use serde::de::DeserializeOwned;
use std::ffi::{c_char, CStr, CString};
use std::ptr;

#[derive(serde::Serialize)]
#[serde(untagged)]
enum FfiResult<T: serde::Serialize> {
    Ok { ok: T },
    Err { error: String },
}

impl<T: serde::Serialize> FfiResult<T> {
    fn ok(value: T) -> Self {
        FfiResult::Ok { ok: value }
    }

    fn err(message: impl Into<String>) -> Self {
        FfiResult::Err {
            error: message.into(),
        }
    }

    fn into_c_string(self) -> *mut c_char {
        let json = serde_json::to_string(&self)
            .unwrap_or_else(|e| format!(r#"{{"error":"serialization failed: {}"}}"#, e));
        to_c_string(json)
    }
}

/// Caller must free with `tally_string_free`.
fn to_c_string(s: String) -> *mut c_char {
    // JSON output never legitimately contains NUL.
    let sanitized = if s.contains('\0') { s.replace('\0', "") } else { s };
    CString::new(sanitized).map_or(ptr::null_mut(), CString::into_raw)
}

unsafe fn from_c_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok().map(|s| s.to_string())
}

unsafe fn parse_arg<T: DeserializeOwned>(ptr: *const c_char, name: &str) -> Result<T, String> {
    let raw = from_c_string(ptr).ok_or_else(|| format!("invalid {name} string"))?;
    serde_json::from_str(&raw).map_err(|e| format!("{name} parse error: {e}"))
}

/// Merge a remote snapshot with a queue snapshot.
///
/// # Arguments
/// - `remote_json`: JSON of `RemoteSnapshot`, `null`, or a null pointer when
///   no snapshot has arrived yet
/// - `queue_json`: JSON of `QueueSnapshot`
///
/// # Returns
/// JSON string: `{"ok": MergedView}` or `{"error": "message"}`
///
/// # Safety
/// - Both arguments must be valid null-terminated C strings or null
/// - Caller must free the returned string with `tally_string_free`
#[no_mangle]
pub unsafe extern "C" fn tally_merge(
    remote_json: *const c_char,
    queue_json: *const c_char,
) -> *mut c_char {
    let remote: Option<RemoteSnapshot> = if remote_json.is_null() {
        None
    } else {
        match parse_arg(remote_json, "remote") {
            Ok(remote) => remote,
            Err(e) => return FfiResult::<()>::err(e).into_c_string(),
        }
    };

    let queue: QueueSnapshot = match parse_arg(queue_json, "queue") {
        Ok(queue) => queue,
        Err(e) => return FfiResult::<()>::err(e).into_c_string(),
    };

    let view = Merger::new(remote.as_ref(), &queue).merge();
    FfiResult::ok(view).into_c_string()
}

/// Append an operation to a queue snapshot, applying the cancellation rules.
///
/// # Returns
/// JSON string: `{"ok": QueueSnapshot}` or `{"error": "message"}`
///
/// # Safety
/// - Both arguments must be valid null-terminated C strings or null
/// - Caller must free the returned string with `tally_string_free`
#[no_mangle]
pub unsafe extern "C" fn tally_queue_enqueue(
    queue_json: *const c_char,
    op_json: *const c_char,
) -> *mut c_char {
    let mut queue: QueueSnapshot = match parse_arg(queue_json, "queue") {
        Ok(queue) => queue,
        Err(e) => return FfiResult::<()>::err(e).into_c_string(),
    };
    let op: QueuedOp = match parse_arg(op_json, "operation") {
        Ok(op) => op,
        Err(e) => return FfiResult::<()>::err(e).into_c_string(),
    };

    queue.enqueue(op);
    FfiResult::ok(queue).into_c_string()
}

/// Validate a store form.
///
/// # Returns
/// JSON string: `{"ok": true}` or `{"error": "message"}`
///
/// # Safety
/// - `draft_json` must be a valid null-terminated C string or null
/// - Caller must free the returned string with `tally_string_free`
#[no_mangle]
pub unsafe extern "C" fn tally_validate_store(draft_json: *const c_char) -> *mut c_char {
    match parse_arg::<StoreDraft>(draft_json, "store") {
        Ok(draft) => match draft.validate() {
            Ok(()) => FfiResult::ok(true).into_c_string(),
            Err(e) => FfiResult::<()>::err(e.to_string()).into_c_string(),
        },
        Err(e) => FfiResult::<()>::err(e).into_c_string(),
    }
}

/// Validate a payment form.
///
/// # Returns
/// JSON string: `{"ok": true}` or `{"error": "message"}`
///
/// # Safety
/// - `draft_json` must be a valid null-terminated C string or null
/// - Caller must free the returned string with `tally_string_free`
#[no_mangle]
pub unsafe extern "C" fn tally_validate_payment(draft_json: *const c_char) -> *mut c_char {
    match parse_arg::<PaymentDraft>(draft_json, "payment") {
        Ok(draft) => match draft.validate() {
            Ok(()) => FfiResult::ok(true).into_c_string(),
            Err(e) => FfiResult::<()>::err(e.to_string()).into_c_string(),
        },
        Err(e) => FfiResult::<()>::err(e).into_c_string(),
    }
}

/// Free a string allocated by the engine.
///
/// # Safety
/// - `s` must be a valid pointer from a `tally_*` function
/// - Must not be called twice on the same pointer
#[no_mangle]
pub unsafe extern "C" fn tally_string_free(s: *mut c_char) {
    if !s.is_null() {
        drop(CString::from_raw(s));
    }
}

/// Engine version. Static string, do not free.
#[no_mangle]
pub extern "C" fn tally_version() -> *const c_char {
    static VERSION: &[u8] = concat!(env!("CARGO_PKG_VERSION"), "\0").as_bytes();
    VERSION.as_ptr() as *const c_char
}
