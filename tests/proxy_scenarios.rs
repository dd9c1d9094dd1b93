//! End-to-end proxy scenarios over loopback sockets

use httproxy::config::{ListenerDescriptor, SessionSettings, StartupPlan, Transport, UpstreamSettings};
use httproxy::proxy::{build_handler, Handler, ProxyServer};
use httproxy::Credentials;
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

struct RunningListener {
    addr: SocketAddr,
    task: JoinHandle<httproxy::Result<()>>,
}

fn listener(transport: Transport) -> ListenerDescriptor {
    ListenerDescriptor {
        bind_address: "127.0.0.1".to_string(),
        port: 0,
        transport,
    }
}

fn plan(listeners: Vec<ListenerDescriptor>, auth: Option<Credentials>) -> StartupPlan {
    StartupPlan {
        listeners,
        auth,
        upstream: UpstreamSettings {
            connect_timeout: Duration::from_secs(2),
            ..UpstreamSettings::default()
        },
        session: SessionSettings::default(),
    }
}

async fn start(plan: &StartupPlan, handler: Arc<dyn Handler>, descriptor: ListenerDescriptor) -> RunningListener {
    let bound = ProxyServer::new(descriptor, handler, plan.session.clone())
        .bind()
        .await
        .unwrap();
    let addr = bound.local_addr();
    RunningListener {
        addr,
        task: tokio::spawn(bound.serve()),
    }
}

async fn start_proxy(auth: Option<Credentials>) -> SocketAddr {
    let plan = plan(vec![listener(Transport::Plain)], auth);
    let handler = build_handler(&plan);
    start(&plan, handler, plan.listeners[0].clone()).await.addr
}

async fn origin_service(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    match req.uri().path() {
        "/hello" => Ok(Response::new(Body::from("HELLO"))),
        "/echo" => {
            let body = hyper::body::to_bytes(req.into_body()).await.unwrap_or_default();
            Ok(Response::new(Body::from(body)))
        }
        _ => Ok(Response::builder()
            .status(404)
            .body(Body::from("missing"))
            .unwrap()),
    }
}

/// hyper origin; the counter tracks accepted connections.
async fn hyper_origin() -> (SocketAddr, Arc<AtomicUsize>) {
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&connections);
    let make_svc = make_service_fn(move |_conn: &AddrStream| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Ok::<_, Infallible>(service_fn(origin_service)) }
    });

    let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = std_listener.local_addr().unwrap();
    let server = Server::from_tcp(std_listener).unwrap().serve(make_svc);
    tokio::spawn(server);
    (addr, connections)
}

/// Accepts one connection, replies with `response` once the request (and, if
/// given, a body ending in `body_end`) has arrived, and reports what it received.
async fn raw_origin(
    response: &'static [u8],
    body_end: Option<&'static [u8]>,
) -> (SocketAddr, oneshot::Receiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut received = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
            let head_done = received.windows(4).any(|w| w == b"\r\n\r\n");
            let body_done = body_end.map_or(true, |end| received.ends_with(end));
            if head_done && body_done {
                break;
            }
        }
        stream.write_all(response).await.unwrap();
        let _ = tx.send(received);
        let _ = stream.shutdown().await;
    });

    (addr, rx)
}

async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

struct ParsedResponse {
    status: u16,
    head: String,
    body: Vec<u8>,
}

impl ParsedResponse {
    fn header(&self, name: &str) -> Option<String> {
        self.head.lines().find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.eq_ignore_ascii_case(name).then(|| value.trim().to_string())
        })
    }
}

async fn read_response<R: AsyncBufRead + Unpin>(reader: &mut R) -> ParsedResponse {
    let mut head = String::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await.unwrap();
        assert!(n > 0, "connection closed before the response head ended: {:?}", head);
        head.push_str(&line);
        if line == "\r\n" {
            break;
        }
    }

    let status = head[9..12].parse().unwrap();
    let mut response = ParsedResponse {
        status,
        head,
        body: Vec::new(),
    };
    let length = response
        .header("content-length")
        .map(|value| value.parse::<usize>().unwrap())
        .unwrap_or(0);
    response.body = vec![0; length];
    reader.read_exact(&mut response.body).await.unwrap();
    response
}

async fn request(proxy: SocketAddr, raw: &str) -> ParsedResponse {
    let stream = TcpStream::connect(proxy).await.unwrap();
    let mut reader = BufReader::new(stream);
    reader.get_mut().write_all(raw.as_bytes()).await.unwrap();
    read_response(&mut reader).await
}

#[tokio::test]
async fn plain_get_is_forwarded() {
    let (origin, _) = hyper_origin().await;
    let proxy = start_proxy(None).await;

    let response = request(
        proxy,
        &format!("GET http://{}/hello HTTP/1.1\r\nHost: {}\r\n\r\n", origin, origin),
    )
    .await;

    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"HELLO");
}

#[tokio::test]
async fn request_body_is_streamed_to_origin() {
    let (origin, _) = hyper_origin().await;
    let proxy = start_proxy(None).await;

    let response = request(
        proxy,
        &format!(
            "POST http://{}/echo HTTP/1.1\r\nHost: {}\r\nContent-Length: 11\r\n\r\nhello world",
            origin, origin
        ),
    )
    .await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"hello world");
}

#[tokio::test]
async fn keep_alive_reuses_upstream_connection() {
    let (origin, connections) = hyper_origin().await;
    let proxy = start_proxy(None).await;

    let stream = TcpStream::connect(proxy).await.unwrap();
    let mut reader = BufReader::new(stream);
    for _ in 0..2 {
        let raw = format!("GET http://{}/hello HTTP/1.1\r\nHost: {}\r\n\r\n", origin, origin);
        reader.get_mut().write_all(raw.as_bytes()).await.unwrap();
        let response = read_response(&mut reader).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"HELLO");
    }

    assert_eq!(connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn connect_tunnel_is_byte_transparent() {
    let origin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin = origin_listener.local_addr().unwrap();
    let origin_task = tokio::spawn(async move {
        let (mut stream, _) = origin_listener.accept().await.unwrap();
        let mut received = [0u8; 2];
        stream.read_exact(&mut received).await.unwrap();
        stream.write_all(&[0xCC]).await.unwrap();
        received
    });

    let proxy = start_proxy(None).await;
    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\n", origin, origin).as_bytes())
        .await
        .unwrap();

    let expected = b"HTTP/1.1 200 Connection Established\r\n\r\n";
    let mut established = vec![0u8; expected.len()];
    client.read_exact(&mut established).await.unwrap();
    assert_eq!(established, expected);

    client.write_all(&[0xAA, 0xBB]).await.unwrap();
    let mut reply = [0u8; 1];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0xCC]);

    assert_eq!(origin_task.await.unwrap(), [0xAA, 0xBB]);
}

#[tokio::test]
async fn auth_challenge_accept_and_reject() {
    let (origin, _) = hyper_origin().await;
    let proxy = start_proxy(Some(Credentials {
        username: "u".to_string(),
        password: "p".to_string(),
    }))
    .await;
    let get = |authorization: &str| {
        format!(
            "GET http://{}/hello HTTP/1.1\r\nHost: {}\r\n{}\r\n",
            origin, origin, authorization
        )
    };

    let challenged = request(proxy, &get("")).await;
    assert_eq!(challenged.status, 407);
    let challenge = challenged.header("proxy-authenticate").unwrap();
    assert!(challenge.starts_with("Basic realm=\""));
    assert!(challenge.len() > "Basic realm=\"\"".len());

    let accepted = request(proxy, &get("Proxy-Authorization: Basic dTpw\r\n")).await;
    assert_eq!(accepted.status, 200);
    assert_eq!(accepted.body, b"HELLO");

    let rejected = request(proxy, &get("Proxy-Authorization: Basic dTpx\r\n")).await;
    assert_eq!(rejected.status, 403);
}

#[tokio::test]
async fn auth_gates_connect_too() {
    let proxy = start_proxy(Some(Credentials {
        username: "u".to_string(),
        password: "p".to_string(),
    }))
    .await;
    let response = request(proxy, "CONNECT 127.0.0.1:443 HTTP/1.1\r\nHost: 127.0.0.1:443\r\n\r\n").await;
    assert_eq!(response.status, 407);
}

#[tokio::test]
async fn origin_form_request_is_rejected_and_closed() {
    let proxy = start_proxy(None).await;
    let stream = TcpStream::connect(proxy).await.unwrap();
    let mut reader = BufReader::new(stream);
    reader
        .get_mut()
        .write_all(b"GET / HTTP/1.1\r\nHost: origin.test\r\n\r\n")
        .await
        .unwrap();

    let response = read_response(&mut reader).await;
    assert_eq!(response.status, 400);
    assert_eq!(response.header("connection").as_deref(), Some("close"));

    let mut rest = Vec::new();
    reader.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn unreachable_upstream_yields_502() {
    let port = closed_port().await;
    let proxy = start_proxy(None).await;

    let forwarded = request(
        proxy,
        &format!("GET http://127.0.0.1:{}/ HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n", port, port),
    )
    .await;
    assert_eq!(forwarded.status, 502);

    let stream = TcpStream::connect(proxy).await.unwrap();
    let mut reader = BufReader::new(stream);
    reader
        .get_mut()
        .write_all(format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", port).as_bytes())
        .await
        .unwrap();
    let tunneled = read_response(&mut reader).await;
    assert_eq!(tunneled.status, 502);
    assert!(tunneled.body.is_empty());

    let mut rest = Vec::new();
    reader.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn hop_by_hop_headers_are_stripped_both_ways() {
    let (origin, received) = raw_origin(
        b"HTTP/1.1 200 OK\r\nConnection: keep-alive, X-Origin-Hop\r\nKeep-Alive: timeout=5\r\nX-Origin-Hop: 1\r\nUpgrade: h2c\r\nProxy-Authenticate: Basic\r\nX-End-To-End: yes\r\nContent-Length: 2\r\n\r\nok",
        None,
    )
    .await;
    let proxy = start_proxy(None).await;

    let response = request(
        proxy,
        &format!(
            "GET http://{}/path?q=1 HTTP/1.1\r\nHost: elsewhere.test\r\nConnection: keep-alive, X-Client-Hop\r\nX-Client-Hop: 1\r\nKeep-Alive: 300\r\nProxy-Connection: keep-alive\r\nProxy-Authorization: Basic dTpw\r\nTE: trailers\r\nUpgrade: websocket\r\nX-End-To-End: yes\r\n\r\n",
            origin
        ),
    )
    .await;

    let upstream_head = String::from_utf8(received.await.unwrap()).unwrap().to_ascii_lowercase();
    assert!(upstream_head.starts_with("get /path?q=1 http/1.1\r\n"));
    assert!(upstream_head.contains(&format!("host: {}\r\n", origin)));
    assert!(upstream_head.contains("via: 1.1 httproxy\r\n"));
    assert!(upstream_head.contains("x-end-to-end: yes\r\n"));
    for hop in [
        "connection:",
        "keep-alive:",
        "x-client-hop:",
        "proxy-connection:",
        "proxy-authorization:",
        "te:",
        "upgrade:",
    ] {
        assert!(!upstream_head.contains(hop), "{} leaked upstream", hop);
    }

    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"ok");
    assert_eq!(response.header("x-end-to-end").as_deref(), Some("yes"));
    for hop in ["connection", "keep-alive", "x-origin-hop", "upgrade", "proxy-authenticate"] {
        assert!(response.header(hop).is_none(), "{} leaked to client", hop);
    }
}

#[tokio::test]
async fn chunked_bodies_keep_their_framing() {
    let (origin, received) = raw_origin(
        b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nHELLO\r\n0\r\n\r\n",
        Some(b"0\r\n\r\n"),
    )
    .await;
    let proxy = start_proxy(None).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(
            format!(
                "POST http://{}/upload HTTP/1.1\r\nHost: {}\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n3\r\nabc\r\n0\r\n\r\n",
                origin, origin
            )
            .as_bytes(),
        )
        .await
        .unwrap();

    let mut raw = Vec::new();
    client.read_to_end(&mut raw).await.unwrap();
    let raw = String::from_utf8(raw).unwrap();
    assert!(raw.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(raw.contains("transfer-encoding: chunked\r\n"));
    assert!(raw.ends_with("\r\n\r\n5\r\nHELLO\r\n0\r\n\r\n"));

    let upstream = String::from_utf8(received.await.unwrap()).unwrap();
    assert!(upstream.to_ascii_lowercase().contains("transfer-encoding: chunked\r\n"));
    assert!(upstream.ends_with("\r\n\r\n3\r\nabc\r\n0\r\n\r\n"));
}

#[tokio::test]
async fn close_delimited_response_closes_client() {
    let (origin, _received) = raw_origin(b"HTTP/1.1 200 OK\r\n\r\nuntil the origin hangs up", None).await;
    let proxy = start_proxy(None).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(format!("GET http://{}/ HTTP/1.1\r\nHost: {}\r\n\r\n", origin, origin).as_bytes())
        .await
        .unwrap();

    let mut raw = Vec::new();
    client.read_to_end(&mut raw).await.unwrap();
    let raw = String::from_utf8(raw).unwrap();
    assert!(raw.ends_with("\r\n\r\nuntil the origin hangs up"));
}

#[tokio::test]
async fn dual_listeners_run_independently() {
    let dir = tempfile::tempdir().unwrap();
    let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_pem = generated.serialize_pem().unwrap();
    let cert_path = dir.path().join("proxy.crt");
    let key_path = dir.path().join("proxy.key");
    std::fs::write(&cert_path, &cert_pem).unwrap();
    std::fs::write(&key_path, generated.serialize_private_key_pem()).unwrap();

    let plan = plan(
        vec![
            listener(Transport::Plain),
            listener(Transport::Tls {
                cert: cert_path,
                key: key_path,
            }),
        ],
        None,
    );
    let handler = build_handler(&plan);
    let plain = start(&plan, Arc::clone(&handler), plan.listeners[0].clone()).await;
    let tls = start(&plan, handler, plan.listeners[1].clone()).await;

    let (origin, _) = hyper_origin().await;
    let get = format!("GET http://{}/hello HTTP/1.1\r\nHost: {}\r\n\r\n", origin, origin);
    assert_eq!(request(plain.addr, &get).await.status, 200);

    let mut roots = rustls::RootCertStore::empty();
    for der in rustls_pemfile::certs(&mut cert_pem.as_bytes()).unwrap() {
        roots.add(&rustls::Certificate(der)).unwrap();
    }
    let connector = tokio_rustls::TlsConnector::from(Arc::new(
        rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    ));

    let tls_addr = tls.addr;
    let https_get = move |connector: tokio_rustls::TlsConnector, get: String| async move {
        let tcp = TcpStream::connect(tls_addr).await.unwrap();
        let server_name = rustls::ServerName::try_from("localhost").unwrap();
        let stream = connector.connect(server_name, tcp).await.unwrap();
        let mut reader = BufReader::new(stream);
        reader.get_mut().write_all(get.as_bytes()).await.unwrap();
        read_response(&mut reader).await
    };

    let response = https_get(connector.clone(), get.clone()).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"HELLO");

    // Take the plaintext listener down; the TLS listener keeps serving.
    plain.task.abort();
    let _ = plain.task.await;
    assert!(TcpStream::connect(plain.addr).await.is_err());

    let response = https_get(connector, get).await;
    assert_eq!(response.status, 200);
    assert!(!tls.task.is_finished());
}

#[tokio::test]
async fn stalled_origin_is_released_when_client_leaves() {
    let origin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin = origin_listener.local_addr().unwrap();
    let origin_task = tokio::spawn(async move {
        let (mut stream, _) = origin_listener.accept().await.unwrap();
        let mut received = Vec::new();
        let mut buf = [0u8; 4096];
        while !received.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0);
            received.extend_from_slice(&buf[..n]);
        }
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\nHELLO")
            .await
            .unwrap();

        // The rest of the body never comes; wait for the proxy to hang up.
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await
        .is_ok()
    });

    let proxy = start_proxy(None).await;
    let stream = TcpStream::connect(proxy).await.unwrap();
    let mut reader = BufReader::new(stream);
    reader
        .get_mut()
        .write_all(format!("GET http://{}/slow HTTP/1.1\r\nHost: {}\r\n\r\n", origin, origin).as_bytes())
        .await
        .unwrap();

    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        if line == "\r\n" {
            break;
        }
    }
    let mut partial = [0u8; 5];
    reader.read_exact(&mut partial).await.unwrap();
    assert_eq!(&partial, b"HELLO");
    drop(reader);

    assert!(origin_task.await.unwrap(), "origin connection outlived the client");
}

/// Collects formatted log output for assertions.
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl std::io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn every_request_is_logged_once() {
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let (origin, _) = hyper_origin().await;
    let proxy = start_proxy(None).await;

    let url = format!("http://{}/hello", origin);
    let stream = TcpStream::connect(proxy).await.unwrap();
    let client_addr = stream.local_addr().unwrap();
    let mut reader = BufReader::new(stream);
    for _ in 0..2 {
        let raw = format!("GET {} HTTP/1.1\r\nHost: {}\r\n\r\n", url, origin);
        reader.get_mut().write_all(raw.as_bytes()).await.unwrap();
        assert_eq!(read_response(&mut reader).await.status, 200);
    }

    let expected = format!("{} GET {}", client_addr, url);
    let text = logs.text();
    let lines: Vec<&str> = text.lines().filter(|line| line.contains(&expected)).collect();
    assert_eq!(lines.len(), 2, "captured logs:\n{}", text);
    assert!(lines.iter().all(|line| line.contains("INFO")));
}
