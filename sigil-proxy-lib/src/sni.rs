//! Stateless TLS ClientHello parsing, just enough to pull out the
//! server_name extension (RFC 6066) from peeked bytes.

const RECORD_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXT_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST: u8 = 0;

/// True when the buffer starts with a TLS handshake record.
pub fn is_tls_handshake(buf: &[u8]) -> bool {
    buf.first() == Some(&RECORD_HANDSHAKE)
}

/// Extract the SNI hostname from a ClientHello record.
///
/// Pure function of the input; the returned slice borrows from `buf`.
/// Any bounds failure yields `None`.
pub fn extract_sni(buf: &[u8]) -> Option<&str> {
    if buf.len() < 5 || buf[0] != RECORD_HANDSHAKE {
        return None;
    }
    // 5-byte record header, then the handshake message
    let hs = &buf[5..];
    if hs.len() < 4 || hs[0] != HANDSHAKE_CLIENT_HELLO {
        return None;
    }
    // handshake header (type + 24-bit length), version, random
    let mut p = hs.get(4 + 2 + 32..)?;

    let session_id_len = *p.first()? as usize;
    p = p.get(1 + session_id_len..)?;

    let cipher_suites_len = u16::from_be_bytes([*p.first()?, *p.get(1)?]) as usize;
    p = p.get(2 + cipher_suites_len..)?;

    let compression_len = *p.first()? as usize;
    p = p.get(1 + compression_len..)?;

    let extensions_len = u16::from_be_bytes([*p.first()?, *p.get(1)?]) as usize;
    let mut exts = p.get(2..2 + extensions_len)?;

    while exts.len() >= 4 {
        let ext_type = u16::from_be_bytes([exts[0], exts[1]]);
        let ext_len = u16::from_be_bytes([exts[2], exts[3]]) as usize;
        let body = exts.get(4..4 + ext_len)?;
        if ext_type == EXT_SERVER_NAME {
            // server_name_list: u16 list length, then the first entry:
            // name_type (host_name = 0) + u16 length + bytes
            let list = body.get(2..)?;
            if *list.first()? != NAME_TYPE_HOST {
                return None;
            }
            let name_len = u16::from_be_bytes([*list.get(1)?, *list.get(2)?]) as usize;
            let name = list.get(3..3 + name_len)?;
            return std::str::from_utf8(name).ok();
        }
        exts = &exts[4 + ext_len..];
    }
    None
}
