use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::sync::Arc;

use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use pgwire::tokio::TlsAcceptor;

use crate::config::Config;

/// TLS acceptor from the configured PEM files, or `None` when TLS is off.
pub fn load_tls_acceptor(config: &Config) -> io::Result<Option<TlsAcceptor>> {
    let (cert_path, key_path) = match (config.tls_cert.as_deref(), config.tls_key.as_deref()) {
        (None, None) => return Ok(None),
        (Some(c), Some(k)) => (c, k),
        _ => {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "both FREQD_TLS_CERT and FREQD_TLS_KEY must be set, or neither",
            ));
        }
    };

    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
        .collect::<Result<_, _>>()?;
    if certs.is_empty() {
        return Err(io::Error::new(ErrorKind::InvalidInput, "no certificates found in cert file"));
    }

    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "no private key found in key file"))?;

    let mut server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;

    server_config.alpn_protocols = vec![b"postgresql".to_vec()];

    Ok(Some(TlsAcceptor::from(Arc::new(server_config))))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_tls(cert: Option<&str>, key: Option<&str>) -> Config {
        Config {
            tls_cert: cert.map(String::from),
            tls_key: key.map(String::from),
            ..Config::default()
        }
    }

    #[test]
    fn disabled_without_paths() {
        assert!(load_tls_acceptor(&with_tls(None, None)).unwrap().is_none());
    }

    #[test]
    fn half_configured_is_an_error() {
        let err = load_tls_acceptor(&with_tls(Some("cert.pem"), None)).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(load_tls_acceptor(&with_tls(None, Some("key.pem"))).is_err());
    }

    #[test]
    fn missing_files_are_reported() {
        let err = load_tls_acceptor(&with_tls(
            Some("/nonexistent/freqd/cert.pem"),
            Some("/nonexistent/freqd/key.pem"),
        ))
        .err()
        .unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn empty_cert_file_rejected() {
        let dir = std::env::temp_dir().join("freqd_test_tls");
        std::fs::create_dir_all(&dir).unwrap();
        let cert = dir.join("empty_cert.pem");
        let key = dir.join("empty_key.pem");
        std::fs::write(&cert, "").unwrap();
        std::fs::write(&key, "").unwrap();

        let config = with_tls(cert.to_str(), key.to_str());
        let err = load_tls_acceptor(&config).err().unwrap();
        assert!(err.to_string().contains("no certificates"));
    }
}
