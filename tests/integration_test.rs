//! Integration tests for Lunar Tunnel
//!
//! Runs a real client and server over loopback:
//! - Handshake through the bootstrap layer
//! - Tunneled streams reaching their destinations
//! - Split routing (direct vs tunneled)
//! - SOCKS5 and HTTP CONNECT ingress

use bytes::Bytes;
use lunar_tunnel::auth::{AuthError, StaticAuth};
use lunar_tunnel::config::{ClientConfig, ServerConfig};
use lunar_tunnel::layers::{DebugLayer, LayerCatalog, LayerStack, PaddingConfig, PaddingLayer, XorLayer};
use lunar_tunnel::protocol::ClientHello;
use lunar_tunnel::proxy::{Address, HttpProxyServer, Socks5Server};
use lunar_tunnel::routing::{Route, RouteList, RoutingPolicy};
use lunar_tunnel::session::{Client, Server, Upstream};
use lunar_tunnel::transport::read_message;
use lunar_tunnel::Error;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// `[0] debug, [1] xor("K")`
fn catalog() -> LayerCatalog {
    LayerCatalog::new()
        .with(DebugLayer::new(false, false))
        .unwrap()
        .with(XorLayer::new(b"K").unwrap())
        .unwrap()
}

fn users() -> HashMap<String, String> {
    HashMap::from([("alice".to_string(), "secret".to_string())])
}

/// Start a relay server on an ephemeral port
async fn start_server(catalog: LayerCatalog) -> SocketAddr {
    let config = ServerConfig {
        listen: "127.0.0.1:0".to_string(),
        bootstrap_layer: 0,
        users: users(),
        handshake_timeout_secs: 5,
        connect_timeout_secs: 5,
        ..ServerConfig::default()
    };
    let server = Arc::new(
        Server::new(config, Arc::new(catalog), Arc::new(StaticAuth::new(users()))).unwrap(),
    );
    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server.serve(listener));
    addr
}

/// Start a TCP echo service
async fn start_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

fn client_config(server: SocketAddr, password: &str) -> ClientConfig {
    ClientConfig {
        server: server.to_string(),
        login: "alice".to_string(),
        password: password.to_string(),
        layers: vec![1],
        bootstrap_layer: 0,
        whitelist: None,
        blacklist: None,
        handshake_timeout_secs: 5,
        connect_timeout_secs: 5,
        ..ClientConfig::default()
    }
}

fn new_client(config: ClientConfig, catalog: LayerCatalog, policy: RoutingPolicy) -> Arc<Client> {
    Arc::new(Client::new(config, Arc::new(catalog), policy).unwrap())
}

#[tokio::test]
async fn test_tunneled_stream_reaches_destination() {
    let destination = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let destination_addr = destination.local_addr().unwrap();
    let server_addr = start_server(catalog()).await;

    let client = new_client(
        client_config(server_addr, "secret"),
        catalog(),
        RoutingPolicy::tunnel_all(),
    );
    client.connect().await.unwrap();
    assert!(client.is_connected().await);

    let upstream = client
        .open_upstream(&Address::from(destination_addr))
        .await
        .unwrap();
    let Upstream::Tunnel(mut stream) = upstream else {
        panic!("expected a tunneled upstream");
    };
    assert_eq!(stream.id() % 2, 1);

    stream.send(Bytes::from_static(b"ping")).await.unwrap();

    let (mut accepted, _) = tokio::time::timeout(Duration::from_secs(5), destination.accept())
        .await
        .unwrap()
        .unwrap();
    let mut buf = [0u8; 4];
    accepted.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    accepted.write_all(b"pong").await.unwrap();
    let reply = stream.recv().await.unwrap();
    assert_eq!(&reply[..], b"pong");

    // Destination closes: the stream reports end of data
    drop(accepted);
    assert!(stream.recv().await.is_none());
}

#[tokio::test]
async fn test_concurrent_streams_share_one_tunnel() {
    let echo = start_echo().await;
    let server_addr = start_server(catalog()).await;
    let client = new_client(
        client_config(server_addr, "secret"),
        catalog(),
        RoutingPolicy::tunnel_all(),
    );

    let mut tasks = Vec::new();
    for i in 0..8u8 {
        let client = Arc::clone(&client);
        tasks.push(tokio::spawn(async move {
            let Upstream::Tunnel(mut stream) =
                client.open_upstream(&Address::from(echo)).await.unwrap()
            else {
                panic!("expected a tunneled upstream");
            };
            let message = vec![i; 1000 + i as usize];
            stream.send(Bytes::from(message.clone())).await.unwrap();

            let mut received = Vec::new();
            while received.len() < message.len() {
                received.extend_from_slice(&stream.recv().await.unwrap());
            }
            assert_eq!(received, message);
            stream.id()
        }));
    }

    let mut ids = Vec::new();
    for task in tasks {
        ids.push(task.await.unwrap());
    }
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 8);
}

#[tokio::test]
async fn test_unread_stream_does_not_stall_other_flows() {
    // Destination that floods its stream and never reads
    let flood = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let flood_addr = flood.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = flood.accept().await.unwrap();
        let chunk = vec![0x5a; 64 * 1024];
        for _ in 0..256 {
            if stream.write_all(&chunk).await.is_err() {
                break;
            }
        }
    });

    let echo = start_echo().await;
    let server_addr = start_server(catalog()).await;
    let client = new_client(
        client_config(server_addr, "secret"),
        catalog(),
        RoutingPolicy::tunnel_all(),
    );

    let Upstream::Tunnel(mut flooded) = client.open_upstream(&Address::from(flood_addr)).await.unwrap()
    else {
        panic!("expected a tunneled upstream");
    };
    // Nobody reads the flooded stream while its window fills up
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let exchange = async {
        let Upstream::Tunnel(mut stream) = client.open_upstream(&Address::from(echo)).await? else {
            panic!("expected a tunneled upstream");
        };
        stream.send(Bytes::from_static(b"still moving")).await?;
        let mut received = Vec::new();
        while received.len() < 12 {
            received.extend_from_slice(&stream.recv().await.expect("echo closed early"));
        }
        Ok::<_, Error>(received)
    };
    let received = tokio::time::timeout(Duration::from_secs(5), exchange)
        .await
        .expect("second stream waited behind the unread one")
        .unwrap();
    assert_eq!(received, b"still moving");

    // The flooded stream still delivers once its reader catches up
    let chunk = tokio::time::timeout(Duration::from_secs(5), flooded.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(chunk.iter().all(|&b| b == 0x5a));
}

#[tokio::test]
async fn test_wrong_password_is_rejected() {
    let server_addr = start_server(catalog()).await;
    let client = new_client(
        client_config(server_addr, "wrong"),
        catalog(),
        RoutingPolicy::tunnel_all(),
    );

    let result = client.connect().await;
    assert!(matches!(result, Err(Error::Auth(AuthError::Rejected))));
    assert!(!client.is_connected().await);
}

#[tokio::test]
async fn test_unknown_layer_index_is_rejected() {
    let server_addr = start_server(catalog()).await;

    // The client knows a third layer the server does not
    let client_catalog = catalog()
        .with(PaddingLayer::new(PaddingConfig::default()))
        .unwrap();
    let mut config = client_config(server_addr, "secret");
    config.layers = vec![2];
    let client = new_client(config, client_catalog, RoutingPolicy::tunnel_all());

    assert!(matches!(
        client.connect().await,
        Err(Error::Auth(AuthError::Rejected))
    ));
}

#[tokio::test]
async fn test_whitelisted_flow_skips_the_tunnel() {
    let echo = start_echo().await;

    // Stand-in for the server: records the first message it receives
    let fake_server = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let fake_addr = fake_server.local_addr().unwrap();

    let policy = RoutingPolicy::new(
        RouteList::parse("127.0.0.1\n").unwrap(),
        RouteList::new(),
        Route::Tunnel,
    );
    let client = new_client(client_config(fake_addr, "secret"), catalog(), policy);

    let upstream = client.open_upstream(&Address::from(echo)).await.unwrap();
    assert!(!upstream.is_tunneled());
    assert!(
        tokio::time::timeout(Duration::from_millis(200), fake_server.accept())
            .await
            .is_err(),
        "whitelisted flow must not contact the server"
    );

    // A destination in neither list goes through the tunnel
    let tunneled = tokio::spawn({
        let client = Arc::clone(&client);
        async move {
            client
                .open_upstream(&Address::Ipv4([8, 8, 8, 8], 53))
                .await
        }
    });

    let (mut conn, _) = fake_server.accept().await.unwrap();
    let message = read_message(&mut conn).await.unwrap().unwrap();
    let bootstrap = LayerStack::single(&catalog(), 0).unwrap();
    let hello = ClientHello::decode(&bootstrap.decode(&message).unwrap()).unwrap();
    assert_eq!(hello.login(), Some("alice"));
    assert_eq!(hello.proposed_layers, vec![1]);

    drop(conn);
    assert!(tunneled.await.unwrap().is_err());
}

#[tokio::test]
async fn test_socks5_ingress_end_to_end() {
    let echo = start_echo().await;
    let server_addr = start_server(catalog()).await;
    let client = new_client(
        client_config(server_addr, "secret"),
        catalog(),
        RoutingPolicy::tunnel_all(),
    );

    let socks = Socks5Server::bind("127.0.0.1:0").await.unwrap();
    let socks_addr = socks.local_addr().unwrap();
    tokio::spawn(Arc::clone(&client).serve_socks5(socks));

    let mut app = TcpStream::connect(socks_addr).await.unwrap();
    app.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0u8; 2];
    app.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [0x05, 0x00]);

    let SocketAddr::V4(target) = echo else {
        panic!("echo service is IPv4");
    };
    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&target.ip().octets());
    request.extend_from_slice(&target.port().to_be_bytes());
    app.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    app.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x00);

    app.write_all(b"hello through the tunnel").await.unwrap();
    let mut echoed = [0u8; 24];
    app.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"hello through the tunnel");
    assert!(client.is_connected().await);
}

#[tokio::test]
async fn test_http_connect_refused_when_server_unreachable() {
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = closed.local_addr().unwrap();
    drop(closed);

    let client = new_client(
        client_config(server_addr, "secret"),
        catalog(),
        RoutingPolicy::tunnel_all(),
    );

    let http = HttpProxyServer::bind("127.0.0.1:0").await.unwrap();
    let http_addr = http.local_addr().unwrap();
    tokio::spawn(Arc::clone(&client).serve_http(http));

    let mut app = TcpStream::connect(http_addr).await.unwrap();
    app.write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
        .await
        .unwrap();

    let mut response = Vec::new();
    app.read_to_end(&mut response).await.unwrap();
    assert!(response.starts_with(b"HTTP/1.1 502"));
}

#[tokio::test]
async fn test_tunnel_comes_back_after_disconnect() {
    let echo = start_echo().await;
    let server_addr = start_server(catalog()).await;
    let client = new_client(
        client_config(server_addr, "secret"),
        catalog(),
        RoutingPolicy::tunnel_all(),
    );

    client.connect().await.unwrap();
    client.disconnect().await;
    assert!(!client.is_connected().await);

    // Next tunneled flow re-establishes the tunnel
    let upstream = client.open_upstream(&Address::from(echo)).await.unwrap();
    assert!(upstream.is_tunneled());
    assert!(client.is_connected().await);
}
