//! Shared protocol constants for the ReQL wire protocol

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 28015;
pub const DEFAULT_USER: &str = "admin";

/// Default connect timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 20;

/// Handshake version magic sent as the first four bytes of a connection
/// (little-endian). Identifies protocol V1_0.
pub const VERSION_V1_0: u32 = 0x34c2_bdc3;

/// Protocol version negotiated inside the V1_0 handshake JSON.
pub const PROTOCOL_VERSION: u64 = 0;

/// Fixed response header size: 8-byte token + 4-byte payload length.
pub const HEADER_SIZE: usize = 12;

// Maximum response payload size (64MB) - prevents memory exhaustion on a
// desynchronized or hostile stream.
pub const MAX_RESPONSE_SIZE: usize = 64 * 1024 * 1024;

// Query type IDs (keep numeric stable - these are the wire values)
pub mod query_type {
    pub const START: u64 = 1;
    pub const CONTINUE: u64 = 2;
    pub const STOP: u64 = 3;
    pub const NOREPLY_WAIT: u64 = 4;
    pub const SERVER_INFO: u64 = 5;
}

// Response type IDs
pub mod response_type {
    pub const SUCCESS_ATOM: u64 = 1;
    pub const SUCCESS_SEQUENCE: u64 = 2;
    pub const SUCCESS_PARTIAL: u64 = 3;
    pub const WAIT_COMPLETE: u64 = 4;
    pub const SERVER_INFO: u64 = 5;
    pub const CLIENT_ERROR: u64 = 16;
    pub const COMPILE_ERROR: u64 = 17;
    pub const RUNTIME_ERROR: u64 = 18;
}

// Runtime error type IDs carried in the response "e" field
pub mod error_type {
    pub const INTERNAL: u64 = 1_000_000;
    pub const RESOURCE_LIMIT: u64 = 2_000_000;
    pub const QUERY_LOGIC: u64 = 3_000_000;
    pub const NON_EXISTENCE: u64 = 3_100_000;
    pub const OP_FAILED: u64 = 4_100_000;
    pub const OP_INDETERMINATE: u64 = 4_200_000;
    pub const USER: u64 = 5_000_000;
    pub const PERMISSION_ERROR: u64 = 6_000_000;
}

// Term type tags used by the driver itself. The query builder owns the
// full tag space; only the tags the connection layer injects live here.
pub mod term_type {
    pub const DATUM: u32 = 1;
    pub const MAKE_ARRAY: u32 = 2;
    pub const DB: u32 = 14;
    pub const ADD: u32 = 24;
}

// Handshake error codes in this window map to authentication failures,
// everything else is reported as a driver fault.
pub mod auth_error_code {
    pub const MIN: i64 = 10;
    pub const MAX: i64 = 20;
}
