use std::sync::Arc;
use std::time::Duration;

use biddr::client::SECURE_REQUIRED;
use biddr::handshake::{PendingReply, VERSIONS_INCOMPATIBLE};
use biddr::network::{BoxedStream, UpgradeFuture};
use biddr::protocol::{AuctionStatus, Bid, BidInfo, ItemInfo, Price};
use biddr::request::LOGIN_INVALID;
use biddr::service::SERVER_SHUTTING_DOWN;
use biddr::store::BID_NOT_ABOVE_TOP;
use biddr::{
    setup_local_tracing, AppError, BiddrConfig, Client, ClientConfig, MemoryStore, Packet,
    PacketType, Payload, Server, StreamUpgrader, TransportKind, PROTOCOL_VERSION,
};
use chrono::Utc;
use rstest::{fixture, rstest};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use uuid::Uuid;

#[fixture]
#[once]
fn setup() {
    // another test binary may already own the subscriber
    let _ = setup_local_tracing();
}

/// Hands the socket back untouched; enough to exercise the redirect.
struct PassThrough;

impl StreamUpgrader for PassThrough {
    fn upgrade(&self, stream: TcpStream) -> UpgradeFuture {
        Box::pin(async move { Ok(Box::new(stream) as BoxedStream) })
    }
}

fn server_config() -> BiddrConfig {
    let mut config = BiddrConfig::default();
    config.worker_pool.workers = 2;
    config.handshake.timeout_ms = 1000;
    config
}

fn client_config(address: String) -> ClientConfig {
    ClientConfig {
        address,
        timeout: Duration::from_secs(1),
        ..ClientConfig::default()
    }
}

struct Running {
    server: Server,
    address: String,
    store: Arc<MemoryStore>,
}

async fn start_server(config: BiddrConfig) -> Running {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let store = Arc::new(MemoryStore::new());
    let (notify_shutdown, _) = broadcast::channel(1);
    let server = Server::new(Arc::new(config), store.clone(), notify_shutdown);

    let accepting = server.clone();
    tokio::spawn(async move { accepting.run(listener).await });
    Running {
        server,
        address,
        store,
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(3), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[rstest]
#[tokio::test]
async fn client_connects_and_is_registered(_setup: ()) {
    let running = start_server(server_config()).await;

    let client = Client::connect(client_config(running.address.clone()))
        .await
        .unwrap();
    assert!(client.is_connected());
    assert!(!client.is_secure());

    let server = running.server.clone();
    wait_until(move || server.client_count() == 1).await;
    let registered = running.server.registry().snapshot();
    assert!(registered[0].is_connected());
    assert!(!registered[0].is_authenticated());

    client.shutdown();
    let server = running.server.clone();
    wait_until(move || server.client_count() == 0).await;
    running.server.shutdown();
}

#[rstest]
#[tokio::test]
async fn client_is_served_as_soon_as_the_handshake_ends(_setup: ()) {
    let running = start_server(server_config()).await;
    running.store.seed_user("alice", "secret", "Alice", "Smith");

    let client = Client::connect(client_config(running.address.clone()))
        .await
        .unwrap();
    // registered before the final OK went out
    assert_eq!(running.server.client_count(), 1);
    let user = client.login("alice", "secret").await.unwrap();
    assert_eq!(user.username, "alice");
    running.server.shutdown();
}

#[rstest]
#[tokio::test]
async fn mismatched_version_is_refused(_setup: ()) {
    let running = start_server(server_config()).await;

    let mut config = client_config(running.address.clone());
    config.protocol_version = PROTOCOL_VERSION + 1;
    let err = Client::connect(config).await.unwrap_err();
    assert!(
        matches!(&err, AppError::ConnectionFailed(reason) if reason == VERSIONS_INCOMPATIBLE),
        "unexpected error: {}",
        err
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(running.server.client_count(), 0);
    running.server.shutdown();
}

#[rstest]
#[tokio::test]
async fn silent_server_times_out_the_client(_setup: ()) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let holder = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        drop(socket);
    });

    let mut config = client_config(address);
    config.timeout = Duration::from_millis(200);
    let err = Client::connect(config).await.unwrap_err();
    assert!(err.is_connection_failed(), "unexpected error: {}", err);
    holder.abort();
}

#[rstest]
#[tokio::test]
async fn secure_server_requires_an_upgrader_on_the_client(_setup: ()) {
    let secure_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut config = server_config();
    config.secure.enable = true;
    config.secure.port = secure_listener.local_addr().unwrap().port();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let (notify_shutdown, _) = broadcast::channel(1);
    let server = Server::new(
        Arc::new(config),
        Arc::new(MemoryStore::new()),
        notify_shutdown,
    )
    .with_upgrader(Arc::new(PassThrough));
    let plain = server.clone();
    tokio::spawn(async move { plain.run(listener).await });
    let secure = server.clone();
    tokio::spawn(async move { secure.run_secure(secure_listener).await });

    let err = Client::connect(client_config(address.clone()))
        .await
        .unwrap_err();
    assert!(
        matches!(&err, AppError::ConnectionFailed(reason) if reason == SECURE_REQUIRED),
        "unexpected error: {}",
        err
    );
    let watched = server.clone();
    wait_until(move || watched.client_count() == 0).await;

    let client = Client::connect_with(client_config(address), Some(Arc::new(PassThrough)))
        .await
        .unwrap();
    assert!(client.is_secure());
    let watched = server.clone();
    wait_until(move || watched.client_count() == 1).await;
    assert!(server.registry().snapshot()[0].is_secure());

    server.shutdown();
}

#[rstest]
#[tokio::test]
async fn failed_login_keeps_the_session_usable(_setup: ()) {
    let running = start_server(server_config()).await;
    running.store.seed_user("alice", "secret", "Alice", "Smith");

    let client = Client::connect(client_config(running.address.clone()))
        .await
        .unwrap();
    let err = client.login("alice", "wrong").await.unwrap_err();
    assert!(matches!(&err, AppError::OperationFailure(reason) if reason == LOGIN_INVALID));
    assert!(client.is_connected());

    let user = client.login("alice", "secret").await.unwrap();
    assert_eq!(user.username, "alice");

    let server = running.server.clone();
    wait_until(move || server.registry().snapshot().iter().any(|c| c.is_authenticated())).await;
    running.server.shutdown();
}

#[rstest]
#[tokio::test]
async fn bids_must_beat_the_top_bid(_setup: ()) {
    let running = start_server(server_config()).await;
    let seller = running.store.seed_user("seller", "pw", "Sam", "Seller");
    let rival = running.store.seed_user("rival", "pw", "Rita", "Rival");
    running.store.seed_user("bob", "pw", "Bob", "Bidder");

    let item_id = Uuid::new_v4();
    let now = Utc::now();
    running.store.seed_item(ItemInfo {
        item_id,
        seller_id: seller.user_id,
        title: "Brass lamp".to_string(),
        description: "Works".to_string(),
        keywords: vec!["lamp".to_string()],
        start_time: now - chrono::Duration::hours(1),
        end_time: now + chrono::Duration::hours(1),
        reserve: Price::from_cents(1000),
        status: AuctionStatus::Started,
        bids: vec![BidInfo {
            bid_id: Uuid::new_v4(),
            item_id,
            user_id: rival.user_id,
            price: Price::from_cents(7500),
            time: now,
        }],
    });

    let client = Client::connect(client_config(running.address.clone()))
        .await
        .unwrap();
    client.login("bob", "pw").await.unwrap();

    let bid = |cents| {
        Packet::with_payload(
            PacketType::PlaceBid,
            Payload::Bid(Bid {
                item_id,
                price: Price::from_cents(cents),
            }),
        )
    };
    let outcome = [PacketType::PlaceBidSuccess, PacketType::PlaceBidFail];

    let reply = client.request(bid(5000), &outcome).await.unwrap();
    assert!(reply.is(PacketType::PlaceBidFail));
    assert_eq!(reply.payload().as_text(), Some(BID_NOT_ABOVE_TOP));

    let update = PendingReply::expect(client.connection(), &[PacketType::Item]);
    let reply = client.request(bid(8000), &outcome).await.unwrap();
    assert!(reply.is(PacketType::PlaceBidSuccess));
    let update = update.wait(Duration::from_secs(1)).await.unwrap();
    match update.payload() {
        Payload::Item(item) => {
            assert_eq!(item.top_bid().unwrap().price, Price::from_cents(8000));
        }
        other => panic!("unexpected payload {:?}", other),
    }

    running.server.shutdown();
}

#[rstest]
#[tokio::test]
async fn server_shutdown_disconnects_clients(_setup: ()) {
    let running = start_server(server_config()).await;
    let client = Client::connect(client_config(running.address.clone()))
        .await
        .unwrap();
    let server = running.server.clone();
    wait_until(move || server.client_count() == 1).await;

    running.server.shutdown();
    running.server.shutdown();

    let watched = client.connection().clone();
    wait_until(move || !watched.is_open()).await;
    assert_eq!(client.close_reason().as_deref(), Some(SERVER_SHUTTING_DOWN));
}

#[rstest]
#[tokio::test]
async fn client_shutdown_is_idempotent(_setup: ()) {
    let running = start_server(server_config()).await;
    let client = Client::connect(client_config(running.address.clone()))
        .await
        .unwrap();

    client.shutdown();
    client.shutdown();
    assert!(!client.is_connected());
    assert!(matches!(
        client.send_packet(Packet::ping()),
        Err(AppError::PacketSendFailed(_))
    ));

    let server = running.server.clone();
    wait_until(move || server.client_count() == 0).await;
    running.server.shutdown();
}

#[rstest]
#[tokio::test]
async fn dropped_client_is_removed_from_the_server(_setup: ()) {
    let running = start_server(server_config()).await;
    let client = Client::connect(client_config(running.address.clone()))
        .await
        .unwrap();
    let conn = client.connection().clone();
    let server = running.server.clone();
    wait_until(move || server.client_count() == 1).await;

    drop(client);
    assert!(!conn.is_open());
    let server = running.server.clone();
    wait_until(move || server.client_count() == 0).await;
    running.server.shutdown();
}

#[rstest]
#[tokio::test]
async fn handshake_over_an_in_memory_pipe(_setup: ()) {
    let (notify_shutdown, _) = broadcast::channel(1);
    let store = Arc::new(MemoryStore::new());
    store.seed_user("carol", "pw", "Carol", "Jones");
    let server = Server::new(Arc::new(server_config()), store, notify_shutdown);

    let (client_end, server_end) = tokio::io::duplex(64 * 1024);
    let accepting = server.clone();
    let accepted = tokio::spawn(async move {
        accepting
            .accept_and_handshake(Box::new(server_end), TransportKind::Plain, "pipe".to_string())
            .await
    });
    let client = Client::connect_stream(
        Box::new(client_end),
        TransportKind::Plain,
        "pipe",
        client_config("pipe".to_string()),
    )
    .await
    .unwrap();

    let registered = accepted.await.unwrap().unwrap();
    assert!(registered.is_connected());
    assert_eq!(server.client_count(), 1);

    client.login("carol", "pw").await.unwrap();
    let reply = client
        .request(Packet::new(PacketType::FetchKeywords), &[PacketType::Keywords])
        .await
        .unwrap();
    assert_eq!(reply.payload(), &Payload::Keywords(Vec::new()));

    // unknown to the dispatcher
    let reply = client
        .request(Packet::new(PacketType::AuctionWin), &[PacketType::Nok])
        .await
        .unwrap();
    assert!(reply.is(PacketType::Nok));

    server.shutdown();
}
