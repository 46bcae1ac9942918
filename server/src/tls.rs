//! TLS support for the capture listeners.
//!
//! Loads a rustls server config from PEM files, and sniffs the SNI host
//! out of a raw ClientHello for listeners that never terminate TLS (the
//! raw-TCP capture uses it to attribute a stream to a subdomain).

use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::PrivateKeyDer;
use trapline_shared::{Error, Result};

/// Build a rustls server config from PEM cert chain + key files.
pub fn load_server_config(cert: &Path, key: &Path) -> Result<Arc<rustls::ServerConfig>> {
    let cert_file = std::fs::File::open(cert)
        .map_err(|e| Error::Config(format!("{}: {e}", cert.display())))?;
    let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(cert_file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Config(format!("{}: {e}", cert.display())))?;
    if certs.is_empty() {
        return Err(Error::Config(format!(
            "{}: no certificates found",
            cert.display()
        )));
    }

    let key_file = std::fs::File::open(key)
        .map_err(|e| Error::Config(format!("{}: {e}", key.display())))?;
    let key: PrivateKeyDer = rustls_pemfile::private_key(&mut std::io::BufReader::new(key_file))
        .map_err(|e| Error::Config(format!("{}: {e}", key.display())))?
        .ok_or_else(|| Error::Config(format!("{}: no private key found", key.display())))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Config(format!("TLS config: {e}")))?;
    Ok(Arc::new(config))
}

/// Pull the SNI hostname out of a raw TLS ClientHello, without
/// terminating the handshake.
pub fn extract_sni(data: &[u8]) -> Option<String> {
    let mut r = Reader { data, pos: 0 };

    // record header: handshake(0x16) + version + length
    if r.u8()? != 0x16 {
        return None;
    }
    r.skip(4)?;

    // handshake header: ClientHello(0x01) + length + version + random
    if r.u8()? != 0x01 {
        return None;
    }
    r.skip(3 + 2 + 32)?;

    let session_id_len = r.u8()? as usize;
    r.skip(session_id_len)?;
    let cipher_suites_len = r.u16()? as usize;
    r.skip(cipher_suites_len)?;
    let compression_len = r.u8()? as usize;
    r.skip(compression_len)?;

    let extensions_len = r.u16()? as usize;
    let end = r.pos.checked_add(extensions_len)?;

    while r.pos + 4 <= end.min(r.data.len()) {
        let ext_type = r.u16()?;
        let ext_len = r.u16()? as usize;
        if ext_type == 0x0000 {
            // server_name extension: list length + type + name length
            r.skip(2)?;
            if r.u8()? != 0 {
                return None;
            }
            let name_len = r.u16()? as usize;
            let name = r.take(name_len)?;
            return std::str::from_utf8(name).ok().map(String::from);
        }
        r.skip(ext_len)?;
    }
    None
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn u8(&mut self) -> Option<u8> {
        let b = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn u16(&mut self) -> Option<u16> {
        let hi = self.u8()? as u16;
        let lo = self.u8()? as u16;
        Some((hi << 8) | lo)
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        let next = self.pos.checked_add(n)?;
        (next <= self.data.len()).then(|| self.pos = next)
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let next = self.pos.checked_add(n)?;
        if next > self.data.len() {
            return None;
        }
        let slice = &self.data[self.pos..next];
        self.pos = next;
        Some(slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal ClientHello carrying one SNI entry.
    fn client_hello(host: &str) -> Vec<u8> {
        let name = host.as_bytes();
        let sni_entry_len = 3 + name.len(); // type + len + name
        let ext_data_len = 2 + sni_entry_len; // list length + entry
        let extensions_len = 4 + ext_data_len; // ext header + data

        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]); // version
        body.extend_from_slice(&[0u8; 32]); // random
        body.push(0); // session id
        body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]); // one cipher suite
        body.extend_from_slice(&[0x01, 0x00]); // null compression
        body.extend_from_slice(&(extensions_len as u16).to_be_bytes());
        body.extend_from_slice(&[0x00, 0x00]); // ext type: server_name
        body.extend_from_slice(&(ext_data_len as u16).to_be_bytes());
        body.extend_from_slice(&(sni_entry_len as u16).to_be_bytes());
        body.push(0); // name type: hostname
        body.extend_from_slice(&(name.len() as u16).to_be_bytes());
        body.extend_from_slice(name);

        let mut hs = vec![0x01];
        hs.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        hs.extend_from_slice(&body);

        let mut record = vec![0x16, 0x03, 0x01];
        record.extend_from_slice(&(hs.len() as u16).to_be_bytes());
        record.extend_from_slice(&hs);
        record
    }

    #[test]
    fn test_extract_sni() {
        let hello = client_hello("abc123.trapline.test");
        assert_eq!(extract_sni(&hello).as_deref(), Some("abc123.trapline.test"));
    }

    #[test]
    fn test_extract_sni_rejects_non_tls() {
        assert_eq!(extract_sni(b"GET / HTTP/1.1\r\n"), None);
        assert_eq!(extract_sni(&[]), None);
        assert_eq!(extract_sni(&[0x16, 0x03]), None);

        // truncated hello must not panic
        let mut hello = client_hello("abc123.trapline.test");
        hello.truncate(40);
        assert_eq!(extract_sni(&hello), None);
    }

    #[test]
    fn test_load_server_config_missing_files() {
        let err = load_server_config(
            Path::new("/nonexistent/cert.pem"),
            Path::new("/nonexistent/key.pem"),
        )
        .unwrap_err();
        assert_eq!(err.code(), "config_error");
    }
}
