//! Close and error codes surfaced by the gateway connection.
//!
//! 1000-1015 are standard WebSocket close codes, 4000-4014 are
//! gateway-protocol codes, and 6000-6666 are synthetic codes reported by
//! the client itself (zlib failures and the catch-all).

/// Synthetic code for a zlib stream error or missing dictionary.
pub const CODE_ZLIB_STREAM_ERROR: u16 = 6000;
/// Synthetic code for corrupt compressed data.
pub const CODE_ZLIB_DATA_ERROR: u16 = 6001;
/// Synthetic code for a zlib allocation failure.
pub const CODE_ZLIB_MEMORY_ERROR: u16 = 6002;
/// Catch-all for errors with no more specific code.
pub const CODE_UNSPECIFIED: u16 = 6666;

/// Canonical description for a close or error code.
pub fn close_code_description(code: u16) -> &'static str {
    match code {
        1000 => "Socket shutdown",
        1001 => "Client is leaving",
        1002 => "Endpoint received a malformed frame",
        1003 => "Endpoint received an unsupported frame",
        1004 => "Reserved code",
        1005 => "Expected close status, received none",
        1006 => "No close code frame has been received",
        1007 => "Endpoint received inconsistent message (e.g. malformed UTF-8)",
        1008 => "Generic error",
        1009 => "Endpoint won't process large frame",
        1010 => "Client wanted an extension which server did not negotiate",
        1011 => "Internal server error while operating",
        1012 => "Server/service is restarting",
        1013 => "Temporary server condition forced blocking client's request",
        1014 => "Server acting as gateway received an invalid response",
        1015 => "Transport Layer Security handshake failure",
        4000 => "Unknown error",
        4001 => "Unknown opcode",
        4002 => "Decode error",
        4003 => "Not authenticated",
        4004 => "Authentication failed",
        4005 => "Already authenticated",
        4007 => "Invalid seq",
        4008 => "Rate limited",
        4009 => "Session timed out",
        4010 => "Invalid shard",
        4011 => "Sharding required",
        4012 => "Invalid API version",
        4013 => "Invalid intent(s)",
        4014 => "Disallowed intent(s)",
        CODE_ZLIB_STREAM_ERROR => "ZLib stream error",
        CODE_ZLIB_DATA_ERROR => "ZLib data error",
        CODE_ZLIB_MEMORY_ERROR => "ZLib memory error",
        CODE_UNSPECIFIED => "Unspecified error",
        _ => "Unknown error",
    }
}

/// Close codes that cannot be recovered by reconnecting: a bad token or a
/// shard/intent misconfiguration will fail identically on every retry.
pub fn is_fatal_close_code(code: u16) -> bool {
    matches!(code, 4004 | 4010..=4014)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptions_cover_all_ranges() {
        assert_eq!(close_code_description(1006), "No close code frame has been received");
        assert_eq!(close_code_description(4008), "Rate limited");
        assert_eq!(close_code_description(6001), "ZLib data error");
        assert_eq!(close_code_description(9999), "Unknown error");
    }

    #[test]
    fn fatal_codes_are_auth_and_shard_misconfig() {
        assert!(is_fatal_close_code(4004));
        for code in 4010..=4014 {
            assert!(is_fatal_close_code(code));
        }
        assert!(!is_fatal_close_code(4000));
        assert!(!is_fatal_close_code(4009));
        assert!(!is_fatal_close_code(1006));
    }
}
