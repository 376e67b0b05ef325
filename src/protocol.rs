//! Postgres Wire Protocol v3 — message codec, constants, and predicates.
//!
//! Two framings are in play: *untyped* (`StartupMessage`, `SSLRequest` — no
//! type byte, just `i32 length | payload`) and *typed* (everything else —
//! `u8 type | i32 length | payload`, where `length` covers itself but not
//! the type byte). `SSLResponse` is the one message with no length prefix
//! at all: a bare `'S'` or `'N'`.
//!
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;

// ─── Constants ──────────────────────────────────────────────────────────────

/// Postgres protocol version 3.0 (major 3, minor 0).
pub const PROTOCOL_VERSION_30: i32 = 196608;

/// SSLRequest magic number.
pub const SSL_REQUEST_CODE: i32 = 80877103;

/// CancelRequest magic number — not acted on by this proxy (see Non-goals).
pub const CANCEL_REQUEST_CODE: i32 = 80877102;

pub const SSL_ALLOWED: u8 = b'S';
pub const SSL_DENIED: u8 = b'N';

/// Message type bytes this proxy builds or recognizes.
pub mod msg_type {
    pub const AUTHENTICATION: u8 = b'R';
    pub const PASSWORD: u8 = b'p';
    pub const PARAMETER_STATUS: u8 = b'S';
    pub const BACKEND_KEY_DATA: u8 = b'K';
    pub const READY_FOR_QUERY: u8 = b'Z';
}

/// Authentication sub-codes carried in the first int32 of an `Authentication` message.
pub mod auth {
    pub const OK: i32 = 0;
    pub const KERBEROS_V5: i32 = 2;
    pub const CLEARTEXT: i32 = 3;
    pub const MD5: i32 = 5;
    pub const SCM: i32 = 6;
    pub const GSS: i32 = 7;
    pub const GSS_CONTINUE: i32 = 8;
    pub const SSPI: i32 = 9;
}

/// Transaction status byte carried by `ReadyForQuery`. This proxy only ever
/// emits `Idle` in its synthetic handshake burst.
pub const TRANSACTION_STATUS_IDLE: u8 = b'I';

// ─── Message Buffer ─────────────────────────────────────────────────────────

/// An in-memory, infallible byte builder for wire messages.
///
/// `finalize_length(offset)` rewrites the 4-byte big-endian length field
/// starting at `offset` to equal the number of bytes from `offset` to the
/// end of the buffer — used for both the typed (`offset = 1`, after the
/// type byte) and untyped (`offset = 0`) framings.
pub struct MessageBuffer {
    buf: BytesMut,
}

impl MessageBuffer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(64),
        }
    }

    pub fn write_byte(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn write_i32_be(&mut self, value: i32) {
        self.buf.put_i32(value);
    }

    /// Append a NUL-terminated C string.
    pub fn write_cstring(&mut self, value: &str) {
        self.buf.put_slice(value.as_bytes());
        self.buf.put_u8(0);
    }

    /// Rewrite the 4-byte length field at `offset` (0 or 1) to the number of
    /// bytes from `offset` to the current end of the buffer.
    pub fn finalize_length(mut self, offset: usize) -> Bytes {
        let len = (self.buf.len() - offset) as i32;
        self.buf[offset..offset + 4].copy_from_slice(&len.to_be_bytes());
        self.buf.freeze()
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}

impl Default for MessageBuffer {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Builders ───────────────────────────────────────────────────────────────

/// Build a `StartupMessage`: untyped, protocol version `196608`, then
/// `user`/`database` followed by any extra options, each as two
/// NUL-terminated strings, then a single terminating zero byte.
pub fn startup_message(user: &str, database: &str, opts: &[(&str, &str)]) -> Bytes {
    let mut m = MessageBuffer::new();
    m.write_i32_be(0); // length placeholder
    m.write_i32_be(PROTOCOL_VERSION_30);
    m.write_cstring("user");
    m.write_cstring(user);
    m.write_cstring("database");
    m.write_cstring(database);
    for (k, v) in opts {
        m.write_cstring(k);
        m.write_cstring(v);
    }
    m.write_byte(0);
    m.finalize_length(0)
}

/// Build an `SSLRequest`: untyped, magic `80877103`.
pub fn ssl_request() -> Bytes {
    let mut m = MessageBuffer::new();
    m.write_i32_be(8);
    m.write_i32_be(SSL_REQUEST_CODE);
    m.into_bytes()
}

/// Build a `PasswordMessage`: typed `'p'`, password as a NUL-terminated C string.
pub fn password_message(password: &str) -> Bytes {
    let mut m = MessageBuffer::new();
    m.write_byte(msg_type::PASSWORD);
    m.write_i32_be(0);
    m.write_cstring(password);
    m.finalize_length(1)
}

/// Build an `SSLResponse`: a single raw byte, no length prefix at all.
/// `'S'` is allowed; `'N'` is never sent by this proxy (it always offers TLS).
pub fn ssl_response(code: u8) -> Bytes {
    Bytes::from(vec![code])
}

/// Build `AuthenticationOk`: typed `'R'`, length 8, body `int32(0)`.
pub fn authentication_ok() -> Bytes {
    let mut m = MessageBuffer::new();
    m.write_byte(msg_type::AUTHENTICATION);
    m.write_i32_be(8);
    m.write_i32_be(auth::OK);
    m.into_bytes()
}

/// Build `AuthenticationCleartextPassword`: typed `'R'`, length 8, body `int32(3)`.
pub fn authentication_cleartext_password() -> Bytes {
    let mut m = MessageBuffer::new();
    m.write_byte(msg_type::AUTHENTICATION);
    m.write_i32_be(8);
    m.write_i32_be(auth::CLEARTEXT);
    m.into_bytes()
}

/// Build a `ParameterStatus`: typed `'S'`, two NUL-terminated C strings.
pub fn parameter_status(key: &str, value: &str) -> Bytes {
    let mut m = MessageBuffer::new();
    m.write_byte(msg_type::PARAMETER_STATUS);
    m.write_i32_be(0);
    m.write_cstring(key);
    m.write_cstring(value);
    m.finalize_length(1)
}

/// Build `BackendKeyData`: typed `'K'`, length 12, `int32(pid)`, `int32(key)`.
pub fn backend_key_data(pid: i32, key: i32) -> Bytes {
    let mut m = MessageBuffer::new();
    m.write_byte(msg_type::BACKEND_KEY_DATA);
    m.write_i32_be(12);
    m.write_i32_be(pid);
    m.write_i32_be(key);
    m.into_bytes()
}

/// Build `ReadyForQuery`: typed `'Z'`, length 5, body `'I'` (Idle).
pub fn ready_for_query() -> Bytes {
    let mut m = MessageBuffer::new();
    m.write_byte(msg_type::READY_FOR_QUERY);
    m.write_i32_be(5);
    m.write_byte(TRANSACTION_STATUS_IDLE);
    m.into_bytes()
}

// ─── Parser predicates ──────────────────────────────────────────────────────
//
// These operate directly on whatever a single `LegConnection::receive()`
// call returned — handshake messages are small enough that the peer's
// real-world behavior delivers one logical message per read, so there is
// no frame-accumulation loop here.

/// Read the big-endian i32 at offset 4 of an untyped message (its version /
/// magic-code field). Returns 0 if the message is too short to contain it.
pub fn version_of(msg: &[u8]) -> i32 {
    if msg.len() < 8 {
        return 0;
    }
    i32::from_be_bytes([msg[4], msg[5], msg[6], msg[7]])
}

/// Read the big-endian i32 at offset 5 of a typed `Authentication` message
/// (its auth sub-code). Returns `None` if too short or not type `'R'`.
pub fn auth_code_of(msg: &[u8]) -> Option<i32> {
    if msg.len() < 9 || msg[0] != msg_type::AUTHENTICATION {
        return None;
    }
    Some(i32::from_be_bytes([msg[5], msg[6], msg[7], msg[8]]))
}

/// True iff `msg` is a typed `Authentication` message, length 8, sub-code `OK`.
pub fn is_authentication_ok(msg: &[u8]) -> bool {
    if msg.len() < 9 || msg[0] != msg_type::AUTHENTICATION {
        return false;
    }
    let length = i32::from_be_bytes([msg[1], msg[2], msg[3], msg[4]]);
    length == 8 && auth_code_of(msg) == Some(auth::OK)
}

/// Parse a `StartupMessage`'s key/value attributes (skips the 8-byte
/// header, reads NUL-terminated string pairs until an empty key or the
/// buffer runs out).
pub fn startup_attributes(msg: &[u8]) -> HashMap<String, String> {
    let mut attrs = HashMap::new();
    if msg.len() < 8 {
        return attrs;
    }
    let mut offset = 8;
    loop {
        let Some(key_end) = msg[offset..].iter().position(|&b| b == 0) else {
            break;
        };
        let key_end = offset + key_end;
        let key = String::from_utf8_lossy(&msg[offset..key_end]).into_owned();
        if key.is_empty() {
            break;
        }
        offset = key_end + 1;

        let Some(val_end) = msg[offset..].iter().position(|&b| b == 0) else {
            break;
        };
        let val_end = offset + val_end;
        let value = String::from_utf8_lossy(&msg[offset..val_end]).into_owned();
        offset = val_end + 1;

        attrs.insert(key, value);
    }
    attrs
}

/// Extract the password carried by a `PasswordMessage` (typed `'p'`, body a
/// single NUL-terminated C string).
pub fn password_of(msg: &[u8]) -> Option<String> {
    if msg.is_empty() || msg[0] != msg_type::PASSWORD || msg.len() < 6 {
        return None;
    }
    let body = &msg[5..];
    let end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
    Some(String::from_utf8_lossy(&body[..end]).into_owned())
}

/// True iff the first message from a client is a `CancelRequest`. Out of
/// scope for routing (see Non-goals) — recognized only so the caller can
/// close the connection instead of misparsing it as a startup.
pub fn is_cancel_request(msg: &[u8]) -> bool {
    version_of(msg) == CANCEL_REQUEST_CODE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_builders_have_correct_length_field() {
        for msg in [
            authentication_ok(),
            authentication_cleartext_password(),
            parameter_status("client_encoding", "UTF8"),
            backend_key_data(42, 99),
            ready_for_query(),
        ] {
            let declared = i32::from_be_bytes([msg[1], msg[2], msg[3], msg[4]]) as usize;
            assert_eq!(declared, msg.len() - 1, "length field excludes only the type byte");
        }
    }

    #[test]
    fn untyped_builders_have_correct_length_field() {
        for msg in [startup_message("alice", "app", &[]), ssl_request()] {
            let declared = i32::from_be_bytes([msg[0], msg[1], msg[2], msg[3]]) as usize;
            assert_eq!(declared, msg.len());
        }
    }

    #[test]
    fn startup_attributes_round_trip() {
        let msg = startup_message("alice", "appdb", &[("application_name", "psql")]);
        let attrs = startup_attributes(&msg);
        assert_eq!(attrs.get("user").map(String::as_str), Some("alice"));
        assert_eq!(attrs.get("database").map(String::as_str), Some("appdb"));
        assert_eq!(attrs.get("application_name").map(String::as_str), Some("psql"));
    }

    #[test]
    fn is_authentication_ok_true_only_for_ok() {
        assert!(is_authentication_ok(&authentication_ok()));
        assert!(!is_authentication_ok(&authentication_cleartext_password()));

        let mut m = MessageBuffer::new();
        m.write_byte(msg_type::AUTHENTICATION);
        m.write_i32_be(8);
        m.write_i32_be(auth::MD5);
        assert!(!is_authentication_ok(&m.into_bytes()));
    }

    #[test]
    fn version_of_recognizes_ssl_and_startup() {
        assert_eq!(version_of(&ssl_request()), SSL_REQUEST_CODE);
        assert_eq!(version_of(&startup_message("u", "d", &[])), PROTOCOL_VERSION_30);
    }

    #[test]
    fn auth_code_of_reads_subtype() {
        assert_eq!(auth_code_of(&authentication_ok()), Some(auth::OK));
        assert_eq!(
            auth_code_of(&authentication_cleartext_password()),
            Some(auth::CLEARTEXT)
        );
        assert_eq!(auth_code_of(&ready_for_query()), None);
    }

    #[test]
    fn ssl_response_has_no_length_prefix() {
        assert_eq!(&ssl_response(SSL_ALLOWED)[..], &[b'S']);
        assert_eq!(ssl_response(SSL_ALLOWED).len(), 1);
    }

    #[test]
    fn password_of_reads_body() {
        assert_eq!(password_of(&password_message("hunter2")).as_deref(), Some("hunter2"));
    }

    #[test]
    fn is_cancel_request_detects_magic() {
        let mut m = MessageBuffer::new();
        m.write_i32_be(16);
        m.write_i32_be(CANCEL_REQUEST_CODE);
        m.write_i32_be(1234);
        m.write_i32_be(5678);
        assert!(is_cancel_request(&m.into_bytes()));
        assert!(!is_cancel_request(&ssl_request()));
    }
}
