use rustls::pki_types::{CertificateDer, PrivateKeyDer};

pub mod config;
pub mod conn;
pub mod http;
pub mod limit;
pub mod poller;
pub mod queue;
pub mod sock;
pub mod tls;
pub mod vhost;
pub mod worker;
pub mod ws;

pub fn load_certs<P: AsRef<std::path::Path>>(
    filename: P,
) -> std::io::Result<Vec<CertificateDer<'static>>> {
    // Open certificate file.
    let certfile = std::fs::File::open(filename)?;
    let mut reader = std::io::BufReader::new(certfile);
    rustls_pemfile::certs(&mut reader).collect()
}

pub fn load_private_key<P: AsRef<std::path::Path>>(
    filename: P,
) -> std::io::Result<PrivateKeyDer<'static>> {
    let keyfile = std::fs::File::open(filename)?;
    let mut reader = std::io::BufReader::new(keyfile);
    rustls_pemfile::private_key(&mut reader).map(|key| key.unwrap())
}
