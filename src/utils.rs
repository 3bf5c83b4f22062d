use crate::peer::types::IceServer;
use rand::Rng;

pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

// Prefix a scheme onto bare ICE URLs. Servers that carry credentials are TURN.
pub fn add_ice_url_scheme(server: &IceServer, url: &str) -> String {
    if url.starts_with("turn:") || url.starts_with("turns:") || url.starts_with("stun:") {
        url.to_owned()
    } else {
        let scheme = if server.username.is_empty() {
            "stun:"
        } else {
            "turn:"
        };
        format!("{}{}", scheme, url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_ids_are_sixteen_hex_chars() {
        let id = random_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, random_id());
    }

    #[test]
    fn scheme_is_added_only_when_missing() {
        let turn = IceServer {
            urls: vec![],
            username: "user".into(),
            credential: "secret".into(),
            ttl: 0,
        };
        assert_eq!(add_ice_url_scheme(&turn, "10.0.0.1:3478"), "turn:10.0.0.1:3478");
        assert_eq!(add_ice_url_scheme(&turn, "turn:10.0.0.1:443"), "turn:10.0.0.1:443");
        let stun = IceServer::stun("stun.example.org:19302");
        assert_eq!(
            add_ice_url_scheme(&stun, "stun.example.org:19302"),
            "stun:stun.example.org:19302"
        );
    }
}
