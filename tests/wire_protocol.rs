use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::codec::{Framed, LinesCodec};
use ulid::Ulid;

use staybook::engine::BookingEngine;
use staybook::pricing::PricingPolicy;
use staybook::store::LedgerStore;
use staybook::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("staybook_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let store = Arc::new(LedgerStore::open(&dir.join("staybook.wal")).unwrap());
    let engine = Arc::new(BookingEngine::with_ledger(store, PricingPolicy::default()));

    tokio::spawn(wire::serve(
        listener,
        engine,
        Arc::new(Semaphore::new(64)),
        std::future::pending::<()>(),
    ));
    addr
}

struct Client {
    framed: Framed<TcpStream, LinesCodec>,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let socket = TcpStream::connect(addr).await.unwrap();
        Self {
            framed: Framed::new(socket, LinesCodec::new()),
        }
    }

    async fn send_raw(&mut self, line: &str) -> Value {
        self.framed.send(line.to_string()).await.unwrap();
        self.recv().await
    }

    async fn call(&mut self, request: Value) -> Value {
        self.send_raw(&request.to_string()).await
    }

    async fn recv(&mut self) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(5), self.framed.next())
            .await
            .expect("reply timed out")
            .expect("connection closed")
            .unwrap();
        serde_json::from_str(&line).unwrap()
    }
}

/// Scenario property: capacity 10, min 3 nights, 3500/5500, cleaning 500.
async fn seed_property(client: &mut Client) -> String {
    let id = Ulid::new().to_string();
    let reply = client
        .call(json!({
            "op": "upsert_property",
            "id": id,
            "ownerId": Ulid::new().to_string(),
            "name": "Casa Azul",
            "capacity": 10,
            "minNights": 3,
            "lowSeasonRate": "3500",
            "highSeasonRate": "5500",
            "cleaningFee": "500",
        }))
        .await;
    assert_eq!(reply["ok"], true, "{reply}");
    id
}

async fn seed_extra(client: &mut Client, price: &str) -> String {
    let id = Ulid::new().to_string();
    let reply = client
        .call(json!({
            "op": "upsert_extra",
            "id": id,
            "name": "Airport transfer",
            "price": price,
            "priceUnit": "per trip",
        }))
        .await;
    assert_eq!(reply["ok"], true, "{reply}");
    id
}

fn booking(property_id: &str, check_in: &str, check_out: &str, guests: i64) -> Value {
    json!({
        "op": "create_booking",
        "guestId": Ulid::new().to_string(),
        "propertyId": property_id,
        "checkInDate": check_in,
        "checkOutDate": check_out,
        "guestCount": guests,
    })
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn ping_pong() {
    let addr = start_test_server().await;
    let mut client = Client::connect(addr).await;
    let reply = client.call(json!({"op": "ping"})).await;
    assert_eq!(reply, json!({"ok": true, "pong": true}));
}

#[tokio::test]
async fn create_booking_with_extras() {
    let addr = start_test_server().await;
    let mut client = Client::connect(addr).await;
    let property = seed_property(&mut client).await;
    let transfer = seed_extra(&mut client, "450").await;

    let mut req = booking(&property, "2026-03-15", "2026-03-22", 6);
    req["extras"] = json!([{"extraId": transfer, "quantity": 2}]);
    req["guestMessage"] = json!("We land at 23:40");
    let reply = client.call(req).await;

    assert_eq!(reply["ok"], true, "{reply}");
    assert_eq!(reply["checkInDate"], "2026-03-15");
    assert_eq!(reply["checkOutDate"], "2026-03-22");
    assert_eq!(reply["nights"], 7);
    assert_eq!(reply["pricePerNight"], "5500");
    assert_eq!(reply["accommodationSubtotal"], "38500");
    assert_eq!(reply["cleaningFee"], "500");
    assert_eq!(reply["extrasSubtotal"], "900");
    assert_eq!(reply["totalAmount"], "39900");
    assert_eq!(reply["status"], "PENDING");
    assert_eq!(reply["paymentStatus"], "PENDING");

    let extras = reply["resolvedExtras"].as_array().unwrap();
    assert_eq!(extras.len(), 1);
    assert_eq!(extras[0]["name"], "Airport transfer");
    assert_eq!(extras[0]["quantity"], 2);
    assert_eq!(extras[0]["unitPrice"], "450");
    assert_eq!(extras[0]["date"], "2026-03-15");

    let id = reply["bookingId"].as_str().unwrap();
    let fetched = client.call(json!({"op": "get_booking", "bookingId": id})).await;
    assert_eq!(fetched, reply);
}

#[tokio::test]
async fn rejections_carry_code_and_friendly_message() {
    let addr = start_test_server().await;
    let mut client = Client::connect(addr).await;
    let property = seed_property(&mut client).await;

    assert_eq!(
        client.call(booking(&property, "2026-07-01", "2026-07-08", 2)).await["ok"],
        true
    );

    let cases = [
        (booking(&property, "2026-07-05", "2026-07-10", 2), "DATE_CONFLICT"),
        (booking(&property, "2026-08-01", "2026-08-03", 2), "STAY_TOO_SHORT"),
        (booking(&property, "2026-08-01", "2026-08-05", 11), "CAPACITY_EXCEEDED"),
        (booking(&property, "2026-08-01", "2026-08-05", -1), "CAPACITY_EXCEEDED"),
        (booking(&property, "2026-08-05", "2026-08-01", 2), "INVALID_DATE_RANGE"),
        (booking(&property, "2026-02-30", "2026-03-05", 2), "INVALID_DATE_RANGE"),
        (booking(&Ulid::new().to_string(), "2026-08-01", "2026-08-05", 2), "PROPERTY_UNAVAILABLE"),
        (booking("nope", "2026-08-01", "2026-08-05", 2), "INVALID_REQUEST"),
    ];
    for (req, code) in cases {
        let reply = client.call(req).await;
        assert_eq!(reply["ok"], false, "{reply}");
        assert_eq!(reply["reasonCode"], code, "{reply}");
        let message = reply["humanMessage"].as_str().unwrap();
        assert!(!message.is_empty());
        assert!(!message.contains(code));
    }

    let mut req = booking(&property, "2026-09-01", "2026-09-05", 2);
    req["extras"] = json!([{"extraId": Ulid::new().to_string(), "quantity": 1}]);
    assert_eq!(client.call(req).await["reasonCode"], "EXTRA_UNAVAILABLE");
}

#[tokio::test]
async fn bad_dates_reported_after_property_check() {
    let addr = start_test_server().await;
    let mut client = Client::connect(addr).await;
    let property = seed_property(&mut client).await;
    let transfer = seed_extra(&mut client, "450").await;

    let unknown = Ulid::new().to_string();
    let reply = client.call(booking(&unknown, "2026-13-45", "2026-08-05", 2)).await;
    assert_eq!(reply["reasonCode"], "PROPERTY_UNAVAILABLE", "{reply}");
    let mut quote = booking(&unknown, "garbage", "garbage", 2);
    quote["op"] = json!("quote");
    assert_eq!(client.call(quote).await["reasonCode"], "PROPERTY_UNAVAILABLE");

    let reply = client.call(booking(&property, "2026-13-45", "2026-08-05", 2)).await;
    assert_eq!(reply["reasonCode"], "INVALID_DATE_RANGE", "{reply}");

    // A bad service date only surfaces once capacity has passed.
    let mut req = booking(&property, "2026-08-01", "2026-08-05", 11);
    req["extras"] = json!([{"extraId": transfer, "quantity": 1, "date": "tomorrow"}]);
    assert_eq!(client.call(req.clone()).await["reasonCode"], "CAPACITY_EXCEEDED");
    req["guestCount"] = json!(2);
    assert_eq!(client.call(req).await["reasonCode"], "INVALID_DATE_RANGE");
}

#[tokio::test]
async fn malformed_lines_do_not_close_connection() {
    let addr = start_test_server().await;
    let mut client = Client::connect(addr).await;

    let reply = client.send_raw("{not json").await;
    assert_eq!(reply["reasonCode"], "INVALID_REQUEST");
    let reply = client.call(json!({"op": "teleport"})).await;
    assert_eq!(reply["reasonCode"], "INVALID_REQUEST");

    assert_eq!(client.call(json!({"op": "ping"})).await["pong"], true);
}

#[tokio::test]
async fn invalid_catalog_records_rejected() {
    let addr = start_test_server().await;
    let mut client = Client::connect(addr).await;
    let reply = client
        .call(json!({
            "op": "upsert_property",
            "id": Ulid::new().to_string(),
            "ownerId": Ulid::new().to_string(),
            "name": "Nowhere",
            "capacity": 0,
            "minNights": 1,
            "lowSeasonRate": "10",
            "highSeasonRate": "10",
            "cleaningFee": "0",
        }))
        .await;
    assert_eq!(reply["reasonCode"], "INVALID_REQUEST");
}

#[tokio::test]
async fn status_lifecycle_and_availability() {
    let addr = start_test_server().await;
    let mut client = Client::connect(addr).await;
    let property = seed_property(&mut client).await;

    let created = client.call(booking(&property, "2026-06-10", "2026-06-14", 2)).await;
    let id = created["bookingId"].as_str().unwrap().to_string();

    let free = client
        .call(json!({"op": "availability", "propertyId": property, "from": "2026-06-01", "to": "2026-06-30"}))
        .await;
    assert_eq!(
        free["free"],
        json!([
            {"checkInDate": "2026-06-01", "checkOutDate": "2026-06-10"},
            {"checkInDate": "2026-06-14", "checkOutDate": "2026-06-30"},
        ])
    );

    let bad = client
        .call(json!({"op": "update_status", "bookingId": id, "status": "CHECKED_OUT"}))
        .await;
    assert_eq!(bad["reasonCode"], "INVALID_TRANSITION");

    let confirmed = client
        .call(json!({"op": "update_status", "bookingId": id, "status": "CONFIRMED"}))
        .await;
    assert_eq!(confirmed["status"], "CONFIRMED");

    let cancelled = client
        .call(json!({"op": "update_status", "bookingId": id, "status": "CANCELLED"}))
        .await;
    assert_eq!(cancelled["status"], "CANCELLED");

    let free = client
        .call(json!({"op": "availability", "propertyId": property, "from": "2026-06-01", "to": "2026-06-30"}))
        .await;
    assert_eq!(free["free"].as_array().unwrap().len(), 1);

    let listed = client
        .call(json!({"op": "list_bookings", "propertyId": property}))
        .await;
    assert_eq!(listed["bookings"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn quote_does_not_reserve() {
    let addr = start_test_server().await;
    let mut client = Client::connect(addr).await;
    let property = seed_property(&mut client).await;

    let mut req = booking(&property, "2026-03-15", "2026-03-22", 6);
    req["op"] = json!("quote");
    let quote = client.call(req.clone()).await;
    assert_eq!(quote["ok"], true, "{quote}");
    assert_eq!(quote["totalAmount"], "39000");
    assert!(quote.get("bookingId").is_none());

    // Quoting twice still succeeds: nothing was held.
    assert_eq!(client.call(req).await["ok"], true);
}

#[tokio::test]
async fn watcher_sees_committed_bookings() {
    let addr = start_test_server().await;
    let mut client = Client::connect(addr).await;
    let property = seed_property(&mut client).await;

    let mut watcher = Client::connect(addr).await;
    let ack = watcher.call(json!({"op": "watch", "propertyId": property})).await;
    assert_eq!(ack["watching"], property.as_str());

    let created = client.call(booking(&property, "2026-05-01", "2026-05-05", 2)).await;
    let event = watcher.recv().await;
    assert_eq!(event["event"], "booking_created");
    assert_eq!(event["bookingId"], created["bookingId"]);
    assert_eq!(event["checkInDate"], "2026-05-01");

    client
        .call(json!({"op": "update_status", "bookingId": created["bookingId"], "status": "CONFIRMED"}))
        .await;
    let event = watcher.recv().await;
    assert_eq!(event["event"], "booking_status_changed");
    assert_eq!(event["status"], "CONFIRMED");
}

#[tokio::test]
async fn watch_unknown_property_is_rejected() {
    let addr = start_test_server().await;
    let mut client = Client::connect(addr).await;
    let reply = client
        .call(json!({"op": "watch", "propertyId": Ulid::new().to_string()}))
        .await;
    assert_eq!(reply["reasonCode"], "PROPERTY_UNAVAILABLE");
    assert_eq!(client.call(json!({"op": "ping"})).await["pong"], true);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_clients_one_winner() {
    const N: usize = 8;
    let addr = start_test_server().await;
    let mut admin = Client::connect(addr).await;
    let property = seed_property(&mut admin).await;

    let mut handles = Vec::new();
    for _ in 0..N {
        let property = property.clone();
        handles.push(tokio::spawn(async move {
            let mut client = Client::connect(addr).await;
            client
                .call(booking(&property, "2026-12-20", "2026-12-27", 4))
                .await
        }));
    }

    let mut winners = 0;
    for h in handles {
        let reply = h.await.unwrap();
        if reply["ok"] == true {
            winners += 1;
        } else {
            assert_eq!(reply["reasonCode"], "DATE_CONFLICT");
        }
    }
    assert_eq!(winners, 1);
}
