//! `get_peers`/`announce_peer` write-access tokens: `HMAC_SHA1(token_key,
//! querier_ipv4_bytes)`. `token_key` is sampled once per process and never
//! rotated (rotation is allowed by spec §6 but not required).

use std::net::Ipv4Addr;

use hmac::{Hmac, Mac};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

pub fn token_for(token_key: &[u8; 20], ip: Ipv4Addr) -> Vec<u8> {
    let mut mac =
        HmacSha1::new_from_slice(token_key).expect("HMAC accepts a key of any length");
    mac.update(&ip.octets());
    mac.finalize().into_bytes().to_vec()
}

pub fn verify_token(token: &[u8], token_key: &[u8; 20], ip: Ipv4Addr) -> bool {
    token == token_for(token_key, ip).as_slice()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_reflexive_for_the_issuing_ip() {
        let key = [7u8; 20];
        let ip: Ipv4Addr = "203.0.113.9".parse().unwrap();
        let token = token_for(&key, ip);
        assert!(verify_token(&token, &key, ip));
    }

    #[test]
    fn token_rejects_a_different_ip() {
        let key = [7u8; 20];
        let ip_a: Ipv4Addr = "203.0.113.9".parse().unwrap();
        let ip_b: Ipv4Addr = "198.51.100.2".parse().unwrap();
        let token = token_for(&key, ip_a);
        assert!(!verify_token(&token, &key, ip_b));
    }

    #[test]
    fn different_keys_produce_different_tokens() {
        let ip: Ipv4Addr = "203.0.113.9".parse().unwrap();
        let token_a = token_for(&[1u8; 20], ip);
        let token_b = token_for(&[2u8; 20], ip);
        assert_ne!(token_a, token_b);
    }
}
