//! Environment-tunable gateway settings.

use std::sync::OnceLock;

const DEFAULT_GATEWAY_HOST: &str = "gateway.discord.gg";
const DEFAULT_GATEWAY_PORT: u16 = 443;
const DEFAULT_LARGE_THRESHOLD: u32 = 250;

const PATH_UNCOMPRESSED: &str = "/?v=8&encoding=json";
const PATH_COMPRESSED: &str = "/?v=8&encoding=json&compress=zlib-stream";

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub host: String,
    pub port: u16,
    /// Guilds above this member count are sent without offline members.
    pub large_threshold: u32,
}

static SETTINGS: OnceLock<GatewaySettings> = OnceLock::new();
static WIRE_TRACE: OnceLock<bool> = OnceLock::new();

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_u16(name: &str, default: u16) -> u16 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u16>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

pub fn settings() -> &'static GatewaySettings {
    SETTINGS.get_or_init(|| GatewaySettings {
        host: env_string("LANYARD_GATEWAY_HOST", DEFAULT_GATEWAY_HOST),
        port: env_u16("LANYARD_GATEWAY_PORT", DEFAULT_GATEWAY_PORT),
        large_threshold: env_u32("LANYARD_LARGE_THRESHOLD", DEFAULT_LARGE_THRESHOLD),
    })
}

/// The gateway WebSocket URL for this process, with the zlib-stream query
/// parameter when transport compression is on.
pub fn gateway_url(compressed: bool) -> String {
    let settings = settings();
    let path = if compressed { PATH_COMPRESSED } else { PATH_UNCOMPRESSED };
    format!("wss://{}:{}{}", settings.host, settings.port, path)
}

/// Whether raw inbound frames should be logged on the `wire` target.
/// Off by default; enabled with `LANYARD_WIRE_TRACE=1`.
pub fn wire_trace_enabled() -> bool {
    *WIRE_TRACE.get_or_init(|| {
        std::env::var("LANYARD_WIRE_TRACE")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    })
}

/// Truncated payload copy safe for log lines.
pub fn payload_preview(payload: &str) -> String {
    const MAX_PREVIEW_CHARS: usize = 256;
    payload.chars().take(MAX_PREVIEW_CHARS).collect()
}
