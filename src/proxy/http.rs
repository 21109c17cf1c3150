//! Filtering forward HTTP proxy: plain requests and CONNECT tunnels.

use anyhow::{Context, Result};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream, ToSocketAddrs};
#[cfg(unix)]
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::filter::DomainFilter;

const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const UPSTREAM_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const CLIENT_HEADER_TIMEOUT: Duration = Duration::from_secs(30);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const ACCEPT_POLL: Duration = Duration::from_millis(10);

/// Client connection abstraction so TCP and Unix socket listeners share
/// one handler.
pub(crate) trait Conn: Read + Write + Send {
    fn try_clone_conn(&self) -> io::Result<Box<dyn Conn>>;
    fn shutdown_write(&self);
    fn set_read_timeout_conn(&self, timeout: Option<Duration>) -> io::Result<()>;
}

impl Conn for TcpStream {
    fn try_clone_conn(&self) -> io::Result<Box<dyn Conn>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn shutdown_write(&self) {
        let _ = self.shutdown(Shutdown::Write);
    }

    fn set_read_timeout_conn(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.set_read_timeout(timeout)
    }
}

#[cfg(unix)]
impl Conn for UnixStream {
    fn try_clone_conn(&self) -> io::Result<Box<dyn Conn>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn shutdown_write(&self) {
        let _ = self.shutdown(Shutdown::Write);
    }

    fn set_read_timeout_conn(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.set_read_timeout(timeout)
    }
}

enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

impl Listener {
    // Accepted sockets inherit the listener's nonblocking flag on some
    // platforms; the handlers do blocking reads, so restore it.
    fn accept(&self) -> io::Result<Box<dyn Conn>> {
        match self {
            Listener::Tcp(l) => {
                let (s, _) = l.accept()?;
                s.set_nonblocking(false)?;
                Ok(Box::new(s) as Box<dyn Conn>)
            }
            #[cfg(unix)]
            Listener::Unix(l) => {
                let (s, _) = l.accept()?;
                s.set_nonblocking(false)?;
                Ok(Box::new(s) as Box<dyn Conn>)
            }
        }
    }

    fn set_nonblocking(&self) -> io::Result<()> {
        match self {
            Listener::Tcp(l) => l.set_nonblocking(true),
            #[cfg(unix)]
            Listener::Unix(l) => l.set_nonblocking(true),
        }
    }
}

/// Filtering HTTP/HTTPS proxy server.
pub struct HttpProxy {
    filter: Arc<DomainFilter>,
    listener: Option<Listener>,
    addr: String,
    port: u16,
    socket_path: Option<PathBuf>,
    running: Arc<AtomicBool>,
    in_flight: Arc<AtomicUsize>,
    handle: Option<JoinHandle<()>>,
}

impl HttpProxy {
    /// Bind to an ephemeral loopback TCP port.
    pub fn new(filter: Arc<DomainFilter>) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").context("failed to create listener")?;
        let addr = listener.local_addr().context("failed to read listener address")?;

        Ok(Self {
            filter,
            listener: Some(Listener::Tcp(listener)),
            addr: addr.to_string(),
            port: addr.port(),
            socket_path: None,
            running: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            handle: None,
        })
    }

    /// Bind to a Unix socket with mode 0600 (for injection into jails).
    #[cfg(unix)]
    pub fn new_unix(filter: Arc<DomainFilter>, socket_path: &Path) -> Result<Self> {
        let _ = std::fs::remove_file(socket_path);

        let listener = UnixListener::bind(socket_path)
            .with_context(|| format!("failed to create Unix socket {}", socket_path.display()))?;

        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))
                .context("failed to set socket permissions")?;
        }

        Ok(Self {
            filter,
            listener: Some(Listener::Unix(listener)),
            addr: socket_path.to_string_lossy().into_owned(),
            port: 0,
            socket_path: Some(socket_path.to_path_buf()),
            running: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            handle: None,
        })
    }

    /// Proxy address: `host:port` for TCP, the socket path for Unix.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Start the accept loop in a background thread.
    pub fn start(&mut self) -> Result<()> {
        let listener = self
            .listener
            .take()
            .context("proxy already started")?;
        listener.set_nonblocking().context("failed to configure listener")?;

        self.running.store(true, Ordering::SeqCst);
        let running = Arc::clone(&self.running);
        let in_flight = Arc::clone(&self.in_flight);
        let filter = Arc::clone(&self.filter);

        self.handle = Some(thread::spawn(move || {
            accept_loop(listener, filter, running, in_flight);
        }));

        Ok(())
    }

    /// Stop accepting, wait up to five seconds for in-flight handlers,
    /// release the listener. Idempotent.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.handle.take() {
            let _ = handle.join();

            let deadline = Instant::now() + SHUTDOWN_GRACE;
            while self.in_flight.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(20));
            }
        }

        if let Some(path) = self.socket_path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl Drop for HttpProxy {
    fn drop(&mut self) {
        self.stop();
    }
}

struct InFlightGuard(Arc<AtomicUsize>);

impl InFlightGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn accept_loop(
    listener: Listener,
    filter: Arc<DomainFilter>,
    running: Arc<AtomicBool>,
    in_flight: Arc<AtomicUsize>,
) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok(client) => {
                let filter = Arc::clone(&filter);
                let guard = InFlightGuard::new(Arc::clone(&in_flight));
                thread::spawn(move || {
                    let _guard = guard;
                    if let Err(e) = handle_client(client, &filter) {
                        tracing::debug!("http proxy client error: {e}");
                    }
                });
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                tracing::warn!("http proxy accept error: {e}");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

fn handle_client(mut client: Box<dyn Conn>, filter: &DomainFilter) -> io::Result<()> {
    client.set_read_timeout_conn(Some(CLIENT_HEADER_TIMEOUT))?;

    let mut reader = BufReader::new(client.try_clone_conn()?);
    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;

    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() < 3 {
        return send_error(client.as_mut(), 400, "Bad Request");
    }

    let method = parts[0];
    let target = parts[1];

    if method == "CONNECT" {
        handle_connect(client, reader, target, filter)
    } else {
        handle_http(client, reader, method, target, filter)
    }
}

/// CONNECT tunneling for HTTPS: filter, dial, 200, then raw byte copy.
fn handle_connect(
    mut client: Box<dyn Conn>,
    mut reader: BufReader<Box<dyn Conn>>,
    target: &str,
    filter: &DomainFilter,
) -> io::Result<()> {
    if !filter.is_allowed(target) {
        tracing::info!("blocked CONNECT to {target}");
        return send_error(
            client.as_mut(),
            403,
            &format!("Access to {target} is not allowed by sandbox policy"),
        );
    }

    // Drain the remaining request headers.
    loop {
        let mut line = String::new();
        reader.read_line(&mut line)?;
        if line.trim().is_empty() {
            break;
        }
    }

    let authority = if target.contains(':') && !target.ends_with(']') {
        target.to_string()
    } else {
        format!("{target}:443")
    };

    let addr = authority
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "could not resolve host"))?;

    let upstream = match TcpStream::connect_timeout(&addr, UPSTREAM_CONNECT_TIMEOUT) {
        Ok(s) => s,
        Err(e) => {
            return send_error(client.as_mut(), 502, &format!("Bad Gateway - {e}"));
        }
    };

    client.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")?;
    client.flush()?;
    client.set_read_timeout_conn(None)?;

    // Bytes the reader buffered past the headers belong to the tunnel.
    let leftover = reader.buffer().to_vec();
    if !leftover.is_empty() {
        (&upstream).write_all(&leftover)?;
    }

    tunnel(client, upstream)
}

/// Copy bytes in both directions until either side closes, closing the
/// peer's write half so the other direction unblocks.
fn tunnel(client: Box<dyn Conn>, upstream: TcpStream) -> io::Result<()> {
    let mut client_read = client.try_clone_conn()?;
    let mut client_write = client;
    let mut upstream_read = upstream.try_clone()?;
    let mut upstream_write = upstream;

    let up = thread::spawn(move || {
        let _ = io::copy(&mut client_read, &mut upstream_write);
        let _ = upstream_write.shutdown(Shutdown::Write);
    });

    let down = thread::spawn(move || {
        let _ = io::copy(&mut upstream_read, &mut client_write);
        client_write.shutdown_write();
    });

    let _ = up.join();
    let _ = down.join();
    Ok(())
}

/// Forward a regular proxy request and copy the response back.
fn handle_http(
    mut client: Box<dyn Conn>,
    mut reader: BufReader<Box<dyn Conn>>,
    method: &str,
    target: &str,
    filter: &DomainFilter,
) -> io::Result<()> {
    let Some(host) = host_of_url(target) else {
        return send_error(client.as_mut(), 400, "Bad Request - Invalid URL");
    };

    if !filter.is_allowed(&host) {
        tracing::info!("blocked {method} to {host}");
        return send_error(
            client.as_mut(),
            403,
            &format!("Access to {host} is not allowed by sandbox policy"),
        );
    }

    // Collect headers, dropping the proxy hop-by-hop ones.
    let mut headers: Vec<(String, String)> = Vec::new();
    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        reader.read_line(&mut line)?;
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        let value = value.trim();

        if name.eq_ignore_ascii_case("Proxy-Connection")
            || name.eq_ignore_ascii_case("Proxy-Authenticate")
            || name.eq_ignore_ascii_case("Proxy-Authorization")
        {
            continue;
        }
        if name.eq_ignore_ascii_case("Content-Length") {
            content_length = value.parse().unwrap_or(0);
        }
        headers.push((name.to_string(), value.to_string()));
    }

    let mut body = vec![0u8; content_length];
    if content_length > 0 {
        reader.read_exact(&mut body)?;
    }

    // Redirects are disabled so the client observes them directly.
    let agent = ureq::AgentBuilder::new()
        .redirects(0)
        .timeout_connect(UPSTREAM_CONNECT_TIMEOUT)
        .timeout(UPSTREAM_REQUEST_TIMEOUT)
        .build();

    let mut request = agent.request(method, target);
    for (name, value) in &headers {
        if name.eq_ignore_ascii_case("Host")
            || name.eq_ignore_ascii_case("Content-Length")
            || name.eq_ignore_ascii_case("Connection")
        {
            continue;
        }
        request = request.set(name, value);
    }

    let result = if content_length > 0 {
        request.send_bytes(&body)
    } else {
        request.call()
    };

    let response = match result {
        Ok(r) => r,
        Err(ureq::Error::Status(_, r)) => r,
        Err(ureq::Error::Transport(t)) => {
            return send_error(client.as_mut(), 502, &format!("Bad Gateway - {t}"));
        }
    };

    write_response(client.as_mut(), response)
}

fn write_response(client: &mut dyn Conn, response: ureq::Response) -> io::Result<()> {
    let status = response.status();
    let status_text = response.status_text().to_string();

    let mut head = format!("HTTP/1.1 {status} {status_text}\r\n");
    for name in response.headers_names() {
        let lower = name.to_ascii_lowercase();
        if matches!(lower.as_str(), "transfer-encoding" | "content-length" | "connection") {
            continue;
        }
        for value in response.all(&name) {
            head.push_str(&format!("{name}: {value}\r\n"));
        }
    }
    // The body is delimited by connection close.
    head.push_str("Connection: close\r\n\r\n");

    client.write_all(head.as_bytes())?;

    let mut body = response.into_reader();
    io::copy(&mut body, client)?;
    Ok(())
}

fn send_error(client: &mut dyn Conn, code: u16, message: &str) -> io::Result<()> {
    let reason = match code {
        400 => "Bad Request",
        403 => "Forbidden",
        502 => "Bad Gateway",
        _ => "Error",
    };
    let response = format!(
        "HTTP/1.1 {code} {reason}\r\nContent-Type: text/plain\r\nConnection: close\r\n\r\n{message}\r\n"
    );
    client.write_all(response.as_bytes())?;
    client.flush()
}

/// Host (with any port) of an absolute `http://` proxy target.
fn host_of_url(url: &str) -> Option<String> {
    let rest = url.strip_prefix("http://")?;
    let host = rest.split('/').next().unwrap_or(rest);
    if host.is_empty() {
        return None;
    }
    Some(host.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    /// Minimal origin server: answers every request with `200 OK` and a
    /// two-byte body.
    fn spawn_origin() -> (u16, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            for stream in listener.incoming().take(1) {
                let mut stream = stream.unwrap();
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                loop {
                    let mut line = String::new();
                    reader.read_line(&mut line).unwrap();
                    if line.trim().is_empty() {
                        break;
                    }
                }
                stream
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                    .unwrap();
            }
        });
        (port, handle)
    }

    fn read_all(stream: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let _ = stream.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    }

    #[test]
    fn proxy_binds_ephemeral_port() {
        let proxy = HttpProxy::new(Arc::new(DomainFilter::from_allowed_hosts(&[]))).unwrap();
        assert!(proxy.port() > 0);
        assert_eq!(proxy.addr(), format!("127.0.0.1:{}", proxy.port()));
    }

    #[test]
    fn forwards_allowed_http_requests() {
        let (origin_port, origin) = spawn_origin();

        let mut proxy = HttpProxy::new(Arc::new(DomainFilter::from_allowed_hosts(&[]))).unwrap();
        proxy.start().unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", proxy.port())).unwrap();
        write!(
            client,
            "GET http://127.0.0.1:{origin_port}/ HTTP/1.1\r\nHost: 127.0.0.1:{origin_port}\r\n\r\n"
        )
        .unwrap();

        let response = read_all(&mut client);
        assert!(response.starts_with("HTTP/1.1 200"), "response: {response}");
        assert!(response.ends_with("ok"), "response: {response}");

        origin.join().unwrap();
        proxy.stop();
    }

    #[test]
    fn denies_hosts_outside_the_allow_list() {
        let filter = DomainFilter::from_allowed_hosts(&["allowed.example".to_string()]);
        let mut proxy = HttpProxy::new(Arc::new(filter)).unwrap();
        proxy.start().unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", proxy.port())).unwrap();
        write!(client, "GET http://evil.example/ HTTP/1.1\r\nHost: evil.example\r\n\r\n").unwrap();

        let response = read_all(&mut client);
        assert!(response.starts_with("HTTP/1.1 403"), "response: {response}");
        assert!(response.contains("evil.example"), "response: {response}");

        proxy.stop();
    }

    #[test]
    fn denies_connect_to_blocked_host() {
        let filter = DomainFilter::from_allowed_hosts(&["allowed.example".to_string()]);
        let mut proxy = HttpProxy::new(Arc::new(filter)).unwrap();
        proxy.start().unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", proxy.port())).unwrap();
        write!(client, "CONNECT evil.example:443 HTTP/1.1\r\n\r\n").unwrap();

        let response = read_all(&mut client);
        assert!(response.starts_with("HTTP/1.1 403"), "response: {response}");

        proxy.stop();
    }

    #[test]
    fn tunnels_connect_to_allowed_host() {
        // Echo origin for raw tunneled bytes.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let origin_port = listener.local_addr().unwrap().port();
        let origin = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).unwrap();
            stream.write_all(&buf).unwrap();
        });

        let mut proxy = HttpProxy::new(Arc::new(DomainFilter::from_allowed_hosts(&[]))).unwrap();
        proxy.start().unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", proxy.port())).unwrap();
        write!(client, "CONNECT 127.0.0.1:{origin_port} HTTP/1.1\r\n\r\n").unwrap();

        let mut reader = BufReader::new(client.try_clone().unwrap());
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert!(line.contains("200"), "line: {line}");
        let mut blank = String::new();
        reader.read_line(&mut blank).unwrap();

        client.write_all(b"ping").unwrap();
        let mut echoed = [0u8; 4];
        reader.read_exact(&mut echoed).unwrap();
        assert_eq!(&echoed, b"ping");

        origin.join().unwrap();
        proxy.stop();
    }

    #[cfg(unix)]
    #[test]
    fn unix_socket_proxy_serves_requests() {
        use std::os::unix::fs::PermissionsExt;

        let (origin_port, origin) = spawn_origin();

        let dir = tempfile::TempDir::new().unwrap();
        let socket_path = dir.path().join("proxy.sock");

        let filter = Arc::new(DomainFilter::from_allowed_hosts(&[]));
        let mut proxy = HttpProxy::new_unix(filter, &socket_path).unwrap();

        let mode = std::fs::metadata(&socket_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        proxy.start().unwrap();

        let mut client = UnixStream::connect(&socket_path).unwrap();
        write!(
            client,
            "GET http://127.0.0.1:{origin_port}/ HTTP/1.1\r\nHost: 127.0.0.1:{origin_port}\r\n\r\n"
        )
        .unwrap();

        let mut buf = Vec::new();
        let _ = client.read_to_end(&mut buf);
        let response = String::from_utf8_lossy(&buf);
        assert!(response.starts_with("HTTP/1.1 200"), "response: {response}");

        origin.join().unwrap();
        proxy.stop();
        assert!(!socket_path.exists(), "socket file removed on stop");
    }

    #[test]
    fn stop_is_idempotent() {
        let mut proxy = HttpProxy::new(Arc::new(DomainFilter::from_allowed_hosts(&[]))).unwrap();
        proxy.start().unwrap();
        proxy.stop();
        proxy.stop();
    }
}
