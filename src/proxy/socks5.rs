//! Filtering SOCKS5 proxy for non-HTTP traffic.
//!
//! No-authentication method and the CONNECT command only. Filtering
//! happens on the textual host before dialing, so a domain request
//! (`ATYP=0x03`) is matched against domain rules while raw-IP requests
//! match only literal IP rules.

use anyhow::{Context, Result};
use std::io::{self, Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::filter::DomainFilter;

const SOCKS_VERSION: u8 = 0x05;

const AUTH_NONE: u8 = 0x00;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCESS: u8 = 0x00;
const REP_NOT_ALLOWED: u8 = 0x02;
const REP_HOST_UNREACHABLE: u8 = 0x04;
const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
const REP_ATYP_NOT_SUPPORTED: u8 = 0x08;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const ACCEPT_POLL: Duration = Duration::from_millis(10);

/// Filtering SOCKS5 proxy server on an ephemeral loopback port.
pub struct Socks5Proxy {
    filter: Arc<DomainFilter>,
    listener: Option<TcpListener>,
    addr: String,
    port: u16,
    running: Arc<AtomicBool>,
    in_flight: Arc<AtomicUsize>,
    handle: Option<JoinHandle<()>>,
}

impl Socks5Proxy {
    pub fn new(filter: Arc<DomainFilter>) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").context("failed to create listener")?;
        let addr = listener.local_addr().context("failed to read listener address")?;

        Ok(Self {
            filter,
            listener: Some(listener),
            addr: addr.to_string(),
            port: addr.port(),
            running: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            handle: None,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn start(&mut self) -> Result<()> {
        let listener = self.listener.take().context("proxy already started")?;
        listener.set_nonblocking(true).context("failed to configure listener")?;

        self.running.store(true, Ordering::SeqCst);
        let running = Arc::clone(&self.running);
        let in_flight = Arc::clone(&self.in_flight);
        let filter = Arc::clone(&self.filter);

        self.handle = Some(thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                match listener.accept() {
                    Ok((stream, _)) => {
                        // Undo any inherited nonblocking flag; handlers
                        // do blocking reads.
                        if stream.set_nonblocking(false).is_err() {
                            continue;
                        }
                        let filter = Arc::clone(&filter);
                        in_flight.fetch_add(1, Ordering::SeqCst);
                        let in_flight = Arc::clone(&in_flight);
                        thread::spawn(move || {
                            if let Err(e) = handle_connection(stream, &filter) {
                                tracing::debug!("socks5 client error: {e}");
                            }
                            in_flight.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        thread::sleep(ACCEPT_POLL);
                    }
                    Err(e) => {
                        tracing::warn!("socks5 accept error: {e}");
                        thread::sleep(ACCEPT_POLL);
                    }
                }
            }
        }));

        Ok(())
    }

    /// Stop accepting and wait briefly for in-flight handlers. Idempotent.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.handle.take() {
            let _ = handle.join();

            let deadline = Instant::now() + SHUTDOWN_GRACE;
            while self.in_flight.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(20));
            }
        }
    }
}

impl Drop for Socks5Proxy {
    fn drop(&mut self) {
        self.stop();
    }
}

fn handle_connection(mut client: TcpStream, filter: &DomainFilter) -> io::Result<()> {
    client.set_read_timeout(Some(Duration::from_secs(30)))?;

    // Greeting: VER NMETHODS METHODS...
    let mut header = [0u8; 2];
    client.read_exact(&mut header)?;
    if header[0] != SOCKS_VERSION {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "invalid SOCKS version"));
    }

    let mut methods = vec![0u8; header[1] as usize];
    client.read_exact(&mut methods)?;

    if !methods.contains(&AUTH_NONE) {
        client.write_all(&[SOCKS_VERSION, AUTH_NO_ACCEPTABLE])?;
        return Err(io::Error::new(io::ErrorKind::PermissionDenied, "no acceptable auth method"));
    }
    client.write_all(&[SOCKS_VERSION, AUTH_NONE])?;

    // Request: VER CMD RSV ATYP
    let mut request = [0u8; 4];
    client.read_exact(&mut request)?;
    if request[0] != SOCKS_VERSION {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "invalid SOCKS version"));
    }

    if request[1] != CMD_CONNECT {
        send_reply(&mut client, REP_CMD_NOT_SUPPORTED, None)?;
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "only CONNECT is supported"));
    }

    let (host, port) = match read_address(&mut client, request[3]) {
        Ok(addr) => addr,
        Err(e) => {
            send_reply(&mut client, REP_ATYP_NOT_SUPPORTED, None)?;
            return Err(e);
        }
    };

    if !filter.is_allowed(&host) {
        tracing::info!("blocked SOCKS5 connect to {host}:{port}");
        send_reply(&mut client, REP_NOT_ALLOWED, None)?;
        return Ok(());
    }

    let upstream = match dial(&host, port) {
        Ok(s) => s,
        Err(e) => {
            tracing::debug!("socks5 dial {host}:{port} failed: {e}");
            send_reply(&mut client, REP_HOST_UNREACHABLE, None)?;
            return Ok(());
        }
    };

    let bound = upstream.local_addr()?;
    send_reply(&mut client, REP_SUCCESS, Some(bound))?;

    client.set_read_timeout(None)?;
    tunnel(client, upstream)
}

fn dial(host: &str, port: u16) -> io::Result<TcpStream> {
    let addr = (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "could not resolve host"))?;
    TcpStream::connect_timeout(&addr, Duration::from_secs(10))
}

fn read_address(client: &mut TcpStream, atyp: u8) -> io::Result<(String, u16)> {
    let host = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            client.read_exact(&mut octets)?;
            IpAddr::from(octets).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            client.read_exact(&mut len)?;
            let mut domain = vec![0u8; len[0] as usize];
            client.read_exact(&mut domain)?;
            String::from_utf8_lossy(&domain).into_owned()
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            client.read_exact(&mut octets)?;
            IpAddr::from(octets).to_string()
        }
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported address type: {other}"),
            ));
        }
    };

    let mut port_bytes = [0u8; 2];
    client.read_exact(&mut port_bytes)?;
    Ok((host, u16::from_be_bytes(port_bytes)))
}

/// Reply: VER REP RSV ATYP BND.ADDR BND.PORT. The bound address uses the
/// address type of the local socket; failures carry a null IPv4 address.
fn send_reply(client: &mut TcpStream, rep: u8, bound: Option<SocketAddr>) -> io::Result<()> {
    let mut reply = vec![SOCKS_VERSION, rep, 0x00];

    match bound {
        Some(SocketAddr::V4(addr)) => {
            reply.push(ATYP_IPV4);
            reply.extend_from_slice(&addr.ip().octets());
            reply.extend_from_slice(&addr.port().to_be_bytes());
        }
        Some(SocketAddr::V6(addr)) => {
            reply.push(ATYP_IPV6);
            reply.extend_from_slice(&addr.ip().octets());
            reply.extend_from_slice(&addr.port().to_be_bytes());
        }
        None => {
            reply.push(ATYP_IPV4);
            reply.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
        }
    }

    client.write_all(&reply)?;
    client.flush()
}

fn tunnel(client: TcpStream, upstream: TcpStream) -> io::Result<()> {
    let mut client_read = client.try_clone()?;
    let mut client_write = client;
    let mut upstream_read = upstream.try_clone()?;
    let mut upstream_write = upstream;

    let up = thread::spawn(move || {
        let _ = io::copy(&mut client_read, &mut upstream_write);
        let _ = upstream_write.shutdown(Shutdown::Write);
    });

    let down = thread::spawn(move || {
        let _ = io::copy(&mut upstream_read, &mut client_write);
        let _ = client_write.shutdown(Shutdown::Write);
    });

    let _ = up.join();
    let _ = down.join();
    Ok(())
}
