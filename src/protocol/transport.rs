use std::{
    io::{self, ErrorKind, Read, Write},
    net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs},
    sync::Arc,
};

use log::{debug, trace, warn};
use parking_lot::Mutex;
use rustls::{
    ClientConnection, RootCertStore,
    pki_types::{CertificateDer, ServerName, pem::PemObject},
};

use crate::{
    config::{ClientConfig, TlsConfig, TransportOptions},
    error::{ClientError, Result},
};

use super::endpoint::Endpoint;

const TLS_READ_BUFFER_SIZE: usize = 16 * 1024;

/// Byte stream to the server, split into halves that never wait on each other.
///
/// Both halves share one socket. The reader blocks in `read` without a timeout; shutting
/// the stream down through [`SocketWriter::shutdown`] or a handle from
/// [`SocketWriter::try_clone_stream`] wakes it with end-of-stream.
pub struct Socket {
    pub reader: SocketReader,
    pub writer: SocketWriter,
}

impl Socket {
    /// Opens a TCP connection to `endpoint`, wrapping it in TLS when configured.
    pub fn open(endpoint: &Endpoint, config: &ClientConfig) -> Result<Self> {
        let tcp = connect_tcp(endpoint, &config.transport)?;
        let tls = match &config.tls {
            None => None,
            Some(tls) => Some(Arc::new(Mutex::new(connect_tls(
                endpoint,
                tls,
                &config.transport,
                &tcp,
            )?))),
        };

        let reader = tcp.try_clone()?;
        Ok(match tls {
            None => Socket {
                reader: SocketReader::Plain(reader),
                writer: SocketWriter::Plain(tcp),
            },
            Some(conn) => Socket {
                reader: SocketReader::Tls {
                    tcp: reader,
                    conn: Arc::clone(&conn),
                    ciphertext: vec![0u8; TLS_READ_BUFFER_SIZE],
                    start: 0,
                    end: 0,
                },
                writer: SocketWriter::Tls { tcp, conn },
            },
        })
    }
}

/// Receive half. Owned by the reader thread.
pub enum SocketReader {
    Plain(TcpStream),
    Tls {
        tcp: TcpStream,
        conn: Arc<Mutex<ClientConnection>>,
        /// Ciphertext read from the socket but not yet handed to rustls.
        ciphertext: Vec<u8>,
        start: usize,
        end: usize,
    },
}

impl Read for SocketReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            SocketReader::Plain(tcp) => tcp.read(buf),
            SocketReader::Tls {
                tcp,
                conn,
                ciphertext,
                start,
                end,
            } => loop {
                {
                    let mut conn = conn.lock();
                    match conn.reader().read(buf) {
                        Ok(n) => return Ok(n),
                        Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                        Err(e) => return Err(e),
                    }

                    if *start < *end {
                        let mut pending = &ciphertext[*start..*end];
                        *start += conn.read_tls(&mut pending)?;
                        let processed = conn.process_new_packets();
                        // Alerts and post-handshake replies go out even when processing failed.
                        while conn.wants_write() {
                            conn.write_tls(tcp)?;
                        }
                        processed.map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?;
                        continue;
                    }
                }

                // Blocks with no lock held, so writers proceed while the link is idle.
                let n = tcp.read(ciphertext)?;
                if n == 0 {
                    return Ok(0);
                }
                trace!("read {n} bytes of ciphertext");
                *start = 0;
                *end = n;
            },
        }
    }
}

/// Send half. Callers serialize whole frames through it.
pub enum SocketWriter {
    Plain(TcpStream),
    Tls {
        tcp: TcpStream,
        conn: Arc<Mutex<ClientConnection>>,
    },
}

impl SocketWriter {
    /// Handle onto the same socket, for shutting it down without this half.
    pub fn try_clone_stream(&self) -> io::Result<TcpStream> {
        match self {
            SocketWriter::Plain(tcp) | SocketWriter::Tls { tcp, .. } => tcp.try_clone(),
        }
    }

    /// Sends close_notify for TLS, then closes both directions.
    pub fn shutdown(&mut self) -> io::Result<()> {
        if let SocketWriter::Tls { tcp, conn } = self {
            let mut conn = conn.lock();
            conn.send_close_notify();
            while conn.wants_write() {
                // The peer may already be gone.
                if conn.write_tls(tcp).is_err() {
                    break;
                }
            }
        }
        match self {
            SocketWriter::Plain(tcp) | SocketWriter::Tls { tcp, .. } => {
                tcp.shutdown(Shutdown::Both)
            }
        }
    }
}

impl Write for SocketWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            SocketWriter::Plain(tcp) => tcp.write(buf),
            SocketWriter::Tls { tcp, conn } => {
                let mut conn = conn.lock();
                let n = conn.writer().write(buf)?;
                while conn.wants_write() {
                    conn.write_tls(tcp)?;
                }
                Ok(n)
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            SocketWriter::Plain(tcp) => tcp.flush(),
            SocketWriter::Tls { tcp, conn } => {
                let mut conn = conn.lock();
                conn.writer().flush()?;
                while conn.wants_write() {
                    conn.write_tls(tcp)?;
                }
                tcp.flush()
            }
        }
    }
}

fn connect_tcp(endpoint: &Endpoint, options: &TransportOptions) -> Result<TcpStream> {
    let addresses = (endpoint.host.as_str(), endpoint.port)
        .to_socket_addrs()?
        .filter(|address| endpoint.family.matches(address))
        .collect::<Vec<SocketAddr>>();

    if addresses.is_empty() {
        return Err(ClientError::Io(format!(
            "no {:?} address found for {endpoint}",
            endpoint.family
        )));
    }

    let mut last_error = None;
    for address in addresses {
        debug!("connecting to {address}");
        match TcpStream::connect_timeout(&address, options.connect_timeout) {
            Ok(tcp) => {
                tcp.set_nodelay(options.tcp_nodelay)?;
                return Ok(tcp);
            }
            Err(e) => {
                warn!("failed to connect to {address}: {e}");
                last_error = Some(e);
            }
        }
    }

    Err(last_error
        .map(ClientError::from)
        .unwrap_or_else(|| ClientError::Io(format!("unable to connect to {endpoint}"))))
}

fn connect_tls(
    endpoint: &Endpoint,
    tls: &TlsConfig,
    options: &TransportOptions,
    tcp: &TcpStream,
) -> Result<ClientConnection> {
    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for error in &native.errors {
        warn!("skipping native certificate: {error}");
    }
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    debug!("loaded {added} native root certificates ({ignored} ignored)");

    if let Some(ca_file) = &tls.ca_file {
        let certs = CertificateDer::pem_file_iter(ca_file).map_err(|e| {
            ClientError::Tls(format!("failed to read {}: {e}", ca_file.display()))
        })?;
        for cert in certs {
            let cert = cert.map_err(|e| ClientError::Tls(e.to_string()))?;
            roots.add(cert)?;
        }
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();

    let name = tls
        .server_name
        .clone()
        .unwrap_or_else(|| endpoint.host.clone());
    let server_name = ServerName::try_from(name)
        .map_err(|e| ClientError::Tls(format!("invalid server name: {e}")))?;
    let mut conn = ClientConnection::new(Arc::new(config), server_name)?;

    // The handshake is bounded by the connect timeout; afterwards reads block freely.
    let mut stream = tcp;
    stream.set_read_timeout(Some(options.connect_timeout))?;
    while conn.is_handshaking() {
        conn.complete_io(&mut stream)?;
    }
    stream.set_read_timeout(None)?;

    debug!(
        "tls established with {endpoint} ({:?})",
        conn.protocol_version()
    );
    Ok(conn)
}
