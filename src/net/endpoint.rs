use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::{Duration, SystemTime},
};

use rustls::{
    client::{ServerCertVerified, ServerCertVerifier},
    Certificate, PrivateKey, ServerName,
};
use tracing::debug;

use super::{error::Error, link::Link};

/// Name every endpoint puts in its certificate and every client dials.
pub const SERVER_NAME: &str = "mitosis";

/// Creates an endpoint that accepts links on `socket_addr` and can also dial
/// out. Brokers need both: clients connect to them and they connect to
/// their workers.
pub fn server(socket_addr: SocketAddr) -> Result<quinn::Endpoint, Error> {
    let (server_config, client_config) = configs()?;
    let mut ep = quinn::Endpoint::server(server_config, socket_addr)?;
    ep.set_default_client_config(client_config);
    debug!(local = ?ep.local_addr(), "endpoint bound");
    Ok(ep)
}

/// Creates a dial-only endpoint on an ephemeral port.
pub fn client() -> Result<quinn::Endpoint, Error> {
    let (_, client_config) = configs()?;
    let mut ep =
        quinn::Endpoint::client(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))?;
    ep.set_default_client_config(client_config);
    Ok(ep)
}

/// Dials `remote` and completes the connection.
pub async fn connect(
    ep: &quinn::Endpoint,
    remote: SocketAddr,
) -> Result<Link, Error> {
    Link::new(ep.connect(remote, SERVER_NAME)?).await
}

/// Returns quinn configurations sharing one transport config.
///
/// Each process presents a freshly generated self-signed certificate and
/// clients accept any certificate: QUIC requires TLS, but peers aren't
/// authenticated.
fn configs() -> Result<(quinn::ServerConfig, quinn::ClientConfig), Error> {
    let cert = rcgen::generate_simple_self_signed(vec![SERVER_NAME.into()])?;
    let cert_der = Certificate(cert.serialize_der()?);
    let key = PrivateKey(cert.serialize_private_key_der());

    // shared transport configuration for the server and client sides
    // this is the default config with the BBR congestion controller enabled
    let mut transport_config = quinn::TransportConfig::default();
    let bbr_config = quinn::congestion::BbrConfig::default();
    transport_config.congestion_controller_factory(Arc::new(bbr_config));
    transport_config.keep_alive_interval(Some(Duration::from_millis(25)));
    let transport_config = Arc::new(transport_config);

    let server_tls = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key)?;
    let mut server_config =
        quinn::ServerConfig::with_crypto(Arc::new(server_tls));
    server_config.transport_config(transport_config.clone());

    let client_tls = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        .with_no_client_auth();
    let mut client_config = quinn::ClientConfig::new(Arc::new(client_tls));
    client_config.transport_config(transport_config);

    Ok((server_config, client_config))
}

struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}
