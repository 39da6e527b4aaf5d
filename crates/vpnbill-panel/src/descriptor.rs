//! Client connection descriptor

use vpnbill_store::Server;

/// VLESS + Reality URI a client imports to connect with `credential_id`
pub fn vless_uri(credential_id: &str, server: &Server, label: &str) -> String {
    format!(
        "vless://{}@{}:{}?type=tcp&security=reality&pbk={}&fp=chrome&sni={}&sid={}&spx=%2F&flow=xtls-rprx-vision#{}",
        credential_id,
        server.address,
        server.port,
        server.public_key,
        server.sni,
        server.short_id,
        label,
    )
}
