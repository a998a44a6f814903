//! First-bytes classification of a freshly accepted stream.

use std::fmt;

use crate::message::{MESSAGE_ID_LEN, MessageTable};

/// Upper bound on a WebSocket upgrade request before it is given up on.
pub const MAX_UPGRADE_REQUEST: usize = 4096;

const SSL2_MIN_LEN: usize = 27;
const SSL3_MIN_LEN: usize = 47;
const TLS_HANDSHAKE: u8 = 0x16;
const TLS_MAJOR: u8 = 0x03;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SslVersion {
    SslV2,
    SslV3,
    Tls10,
    Tls11,
    Tls12,
}

impl fmt::Display for SslVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SslVersion::SslV2 => "SSLv2",
            SslVersion::SslV3 => "SSLv3",
            SslVersion::Tls10 => "TLS1.0",
            SslVersion::Tls11 => "TLS1.1",
            SslVersion::Tls12 => "TLS1.2",
        })
    }
}

/// Matches an SSL/TLS client hello. `None` means not SSL.
pub fn detect_ssl(data: &[u8]) -> Option<SslVersion> {
    if data.len() >= SSL2_MIN_LEN
        && data[2] == 0x01
        && data[3] == TLS_MAJOR
        && data[4] <= 0x03
        && data.len().checked_sub(data[1] as usize) == Some(2)
    {
        return Some(SslVersion::SslV2);
    }

    if data.len() >= SSL3_MIN_LEN && data[0] == TLS_HANDSHAKE && data[1] == TLS_MAJOR {
        return match data[2] {
            0x00 => Some(SslVersion::SslV3),
            0x01 => Some(SslVersion::Tls10),
            0x02 => Some(SslVersion::Tls11),
            0x03 => Some(SslVersion::Tls12),
            _ => None,
        };
    }

    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sniffed {
    Tls(SslVersion),
    WebSocket,
    Native,
    /// Could still become a match once more bytes arrive.
    Incomplete,
    Unrecognized,
}

pub fn sniff(data: &[u8], table: &MessageTable, websocket_enabled: bool) -> Sniffed {
    if let Some(version) = detect_ssl(data) {
        return Sniffed::Tls(version);
    }
    if data.len() < SSL3_MIN_LEN
        && data.first() == Some(&TLS_HANDSHAKE)
        && data.get(1).is_none_or(|b| *b == TLS_MAJOR)
    {
        return Sniffed::Incomplete;
    }

    if looks_like_http(data) {
        if !websocket_enabled {
            return Sniffed::Unrecognized;
        }
        return match find_header_end(data) {
            Some(end) if is_upgrade_request(&data[..end]) => Sniffed::WebSocket,
            Some(_) => Sniffed::Unrecognized,
            None if data.len() >= MAX_UPGRADE_REQUEST => Sniffed::Unrecognized,
            None => Sniffed::Incomplete,
        };
    }

    if data.len() < MESSAGE_ID_LEN {
        return Sniffed::Incomplete;
    }
    let id = u16::from_le_bytes([data[0], data[1]]);
    if table.contains(id) {
        Sniffed::Native
    } else {
        Sniffed::Unrecognized
    }
}

fn looks_like_http(data: &[u8]) -> bool {
    const GET: &[u8] = b"GET ";
    let n = data.len().min(GET.len());
    n > 0 && data[..n] == GET[..n]
}

pub(crate) fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

fn is_upgrade_request(head: &[u8]) -> bool {
    let Ok(text) = std::str::from_utf8(head) else {
        return false;
    };
    text.lines().skip(1).any(|line| {
        line.split_once(':').is_some_and(|(name, value)| {
            name.trim().eq_ignore_ascii_case("upgrade")
                && value.trim().eq_ignore_ascii_case("websocket")
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageSpec;

    fn tls_hello(minor: u8) -> Vec<u8> {
        let mut data = vec![0u8; 64];
        data[0] = 0x16;
        data[1] = 0x03;
        data[2] = minor;
        data
    }

    fn ssl2_hello() -> Vec<u8> {
        let mut data = vec![0u8; 30];
        data[0] = 0x80;
        data[1] = 28;
        data[2] = 0x01;
        data[3] = 0x03;
        data[4] = 0x00;
        data
    }

    #[test]
    fn test_detects_each_ssl_version() {
        assert_eq!(detect_ssl(&ssl2_hello()), Some(SslVersion::SslV2));
        assert_eq!(detect_ssl(&tls_hello(0)), Some(SslVersion::SslV3));
        assert_eq!(detect_ssl(&tls_hello(1)), Some(SslVersion::Tls10));
        assert_eq!(detect_ssl(&tls_hello(2)), Some(SslVersion::Tls11));
        assert_eq!(detect_ssl(&tls_hello(3)), Some(SslVersion::Tls12));
    }

    #[test]
    fn test_non_ssl_bytes() {
        assert_eq!(detect_ssl(&tls_hello(4)), None);
        assert_eq!(detect_ssl(&[0u8; 100]), None);
        assert_eq!(detect_ssl(b"GET / HTTP/1.1\r\n"), None);
        assert_eq!(detect_ssl(&[]), None);

        // SSLv2 length rule off by one.
        let mut data = ssl2_hello();
        data[1] = 27;
        assert_eq!(detect_ssl(&data), None);
    }

    #[test]
    fn test_sniff_classification() {
        let table = MessageTable::with(&[MessageSpec::variable(1, "hello")]);

        assert_eq!(sniff(&tls_hello(3), &table, true), Sniffed::Tls(SslVersion::Tls12));
        assert_eq!(sniff(&[0x16, 0x03, 0x01], &table, true), Sniffed::Incomplete);
        assert_eq!(sniff(&[1, 0, 5, 0], &table, true), Sniffed::Native);
        assert_eq!(sniff(&[1], &table, true), Sniffed::Incomplete);
        assert_eq!(sniff(&[9, 9, 0, 0], &table, true), Sniffed::Unrecognized);

        let upgrade = b"GET /ws HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
        assert_eq!(sniff(upgrade, &table, true), Sniffed::WebSocket);
        assert_eq!(sniff(upgrade, &table, false), Sniffed::Unrecognized);
        assert_eq!(sniff(&upgrade[..20], &table, true), Sniffed::Incomplete);
        assert_eq!(
            sniff(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n", &table, true),
            Sniffed::Unrecognized
        );
    }
}
