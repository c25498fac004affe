//! End-to-end worker cycle scenarios against a mocked upstream and webhook:
//! seeding, normal incremental delivery, webhook failure parking, retry
//! sweeps, breaker trips and half-open recovery.

mod test_utils;

use chrono::{Duration, Utc};
use orderbridge::models::sync_log::Model as SyncLogModel;
use orderbridge::poller::breaker::{Breaker, RECOVERY_TIMEOUT_SECS};
use orderbridge::poller::dispatcher::Dispatcher;
use orderbridge::poller::scheduler::EngineHandles;
use orderbridge::poller::worker::PollWorker;
use orderbridge::repositories::retry_queue::{
    EnqueueOutcome, NewRetryItem, STATUS_PENDING, STATUS_SUCCESS,
};
use orderbridge::upstream::UpstreamClient;
use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use test_utils::{
    insert_connection, mount_auth_ok, mount_read, mount_search_read, rpc_error, setup_handles,
};

const T3: &str = "2025-01-15 10:00:00";
const T4: &str = "2025-01-15 11:00:00";
const T5: &str = "2025-01-15 12:00:00";

fn order(id: i64, number: &str, write_date: &str) -> serde_json::Value {
    json!({
        "id": id,
        "name": number,
        "state": "sale",
        "date_order": "2025-01-15 09:30:00",
        "write_date": write_date,
        "partner_id": false,
        "partner_shipping_id": false,
        "amount_total": 99.0,
        "note": false,
        "client_order_ref": false,
    })
}

async fn run_cycle(handles: &EngineHandles, connection_id: Uuid) -> SyncLogModel {
    let connection = handles
        .connections
        .get(connection_id)
        .await
        .unwrap()
        .unwrap();
    let secrets = handles.connections.credentials(&connection).unwrap();

    let mut client = UpstreamClient::new(
        &connection.upstream_url,
        &connection.upstream_db,
        &connection.upstream_username,
        &secrets.api_key,
    );
    client.load_session(connection.session_id);

    let dispatcher = Dispatcher::new();
    let mut breaker = Breaker::from_connection(&connection);
    let mut worker = PollWorker::new(
        &connection,
        &secrets,
        &mut client,
        &dispatcher,
        &mut breaker,
        handles,
    );
    worker.execute().await.unwrap()
}

#[tokio::test]
async fn seed_cycle_registers_without_dispatching() {
    let upstream = MockServer::start().await;
    let webhook = MockServer::start().await;
    let handles = setup_handles().await.unwrap();
    let conn = insert_connection(&handles, &upstream.uri(), &webhook.uri())
        .await
        .unwrap();

    mount_auth_ok(&upstream, 7).await;
    mount_search_read(
        &upstream,
        "sale.order",
        json!([order(3, "S00003", T5), order(2, "S00002", T4), order(1, "S00001", T3)]),
    )
    .await;

    // Any webhook traffic during seeding is a bug.
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&webhook)
        .await;

    let log = run_cycle(&handles, conn.id).await;

    assert_eq!(log.orders_found, 3);
    assert_eq!(log.orders_sent, 0);
    assert_eq!(log.error_message, None);

    let ledger = handles.ledger.list_by_connection(conn.id, 10).await.unwrap();
    assert_eq!(ledger.len(), 3);

    let refreshed = handles.connections.get(conn.id).await.unwrap().unwrap();
    assert_eq!(refreshed.last_sync_at.as_deref(), Some(T5));
    assert_eq!(refreshed.session_id, Some(7));
}

#[tokio::test]
async fn normal_cycle_skips_ledgered_and_delivers_new() {
    let upstream = MockServer::start().await;
    let webhook = MockServer::start().await;
    let handles = setup_handles().await.unwrap();
    let conn = insert_connection(&handles, &upstream.uri(), &webhook.uri())
        .await
        .unwrap();

    handles
        .ledger
        .mark_sent(conn.id, 42, "S00042", T3)
        .await
        .unwrap();
    handles
        .connections
        .update_last_sync_at(conn.id, "2025-01-15 09:00:00")
        .await
        .unwrap();

    mount_auth_ok(&upstream, 7).await;
    mount_search_read(
        &upstream,
        "sale.order",
        json!([order(42, "S00042", T3), order(43, "S00043", T4)]),
    )
    .await;
    mount_search_read(&upstream, "sale.order.line", json!([])).await;

    Mock::given(method("POST"))
        .and(header("X-Webhook-Secret", "hook-secret"))
        .and(header("X-Upstream-Connection-Id", conn.id.to_string()))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&webhook)
        .await;

    let log = run_cycle(&handles, conn.id).await;

    assert_eq!(log.orders_found, 2);
    assert_eq!(log.orders_skipped, 1);
    assert_eq!(log.orders_sent, 1);
    assert_eq!(log.orders_failed, 0);

    let delivered = webhook.received_requests().await.unwrap();
    assert_eq!(delivered.len(), 1);
    let body: serde_json::Value = delivered[0].body_json().unwrap();
    assert_eq!(body["event"], "order.confirmed");
    assert_eq!(body["external_id"], "upstream_acme-prod_43");
    assert_eq!(body["order"]["platform_order_number"], "S00043");
    assert_eq!(body["source"]["store_id"], "store-9");

    assert!(handles.ledger.was_sent(conn.id, 43, T4).await.unwrap());
    let refreshed = handles.connections.get(conn.id).await.unwrap().unwrap();
    assert_eq!(refreshed.last_sync_at.as_deref(), Some(T4));
}

#[tokio::test]
async fn prefetched_dependencies_flow_into_the_envelope() {
    let upstream = MockServer::start().await;
    let webhook = MockServer::start().await;
    let handles = setup_handles().await.unwrap();
    let conn = insert_connection(&handles, &upstream.uri(), &webhook.uri())
        .await
        .unwrap();

    handles
        .connections
        .update_last_sync_at(conn.id, T3)
        .await
        .unwrap();

    mount_auth_ok(&upstream, 7).await;
    mount_search_read(
        &upstream,
        "sale.order",
        json!([{
            "id": 60,
            "name": "S00060",
            "state": "done",
            "date_order": "2025-01-15 10:30:00",
            "write_date": T4,
            "partner_id": [5, "Jane Fonda"],
            "partner_shipping_id": false,
            "amount_total": 39.98,
            "note": false,
            "client_order_ref": "PO-881",
        }]),
    )
    .await;
    mount_search_read(
        &upstream,
        "sale.order.line",
        json!([{
            "id": 900,
            "order_id": [60, "S00060"],
            "product_id": [77, "Shirt (L, Blue)"],
            "name": "Shirt (L, Blue)",
            "product_uom_qty": 2.0,
            "price_unit": 19.99,
        }]),
    )
    .await;
    mount_read(
        &upstream,
        "res.partner",
        json!([{
            "id": 5,
            "name": "Jane Fonda",
            "email": "jane@example.com",
            "phone": "+1 555 0100",
            "mobile": "+1 555 0199",
            "street": "1 Main St",
            "street2": false,
            "city": "Springfield",
            "state_id": [31, "Illinois"],
            "zip": "62701",
            "country_id": [233, "United States"],
            "country_code": "US",
            "sale_order_count": 7,
        }]),
    )
    .await;
    mount_read(
        &upstream,
        "product.product",
        json!([{
            "id": 77,
            "name": "Shirt",
            "default_code": false,
            "barcode": "761234",
            "product_tmpl_id": [12, "Shirt"],
            "product_template_attribute_value_ids": [201, 202],
        }]),
    )
    .await;
    mount_read(
        &upstream,
        "product.template",
        json!([{"id": 12, "name": "Shirt", "default_code": "SHIRT"}]),
    )
    .await;
    mount_read(
        &upstream,
        "product.template.attribute.value",
        json!([{"id": 201, "name": "L"}, {"id": 202, "name": "Blue"}]),
    )
    .await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&webhook)
        .await;

    let log = run_cycle(&handles, conn.id).await;
    assert_eq!(log.orders_sent, 1);

    let delivered = webhook.received_requests().await.unwrap();
    let body: serde_json::Value = delivered[0].body_json().unwrap();
    assert_eq!(body["order"]["date_order"], "2025-01-15T10:30:00Z");
    assert_eq!(body["order"]["client_order_ref"], "PO-881");
    assert_eq!(body["customer"]["name"], "Jane Fonda");
    assert_eq!(body["customer"]["phone"], "+1 555 0199");
    assert_eq!(body["customer"]["orders_count"], 7);
    // No dedicated shipping partner: the customer address is used.
    assert_eq!(body["shipping_address"]["city"], "Springfield");
    assert_eq!(body["shipping_address"]["province"], "Illinois");
    assert_eq!(body["shipping_address"]["country"], "US");
    assert_eq!(body["items"][0]["sku"], "761234");
    assert_eq!(body["items"][0]["variant_name"], "L, Blue");
    assert_eq!(body["items"][0]["quantity"], 2);
    assert_eq!(body["items"][0]["price_cents"], 19.99);
}

#[tokio::test]
async fn webhook_failure_parks_a_retry_and_still_advances() {
    let upstream = MockServer::start().await;
    let webhook = MockServer::start().await;
    let handles = setup_handles().await.unwrap();
    let conn = insert_connection(&handles, &upstream.uri(), &webhook.uri())
        .await
        .unwrap();

    handles
        .connections
        .update_last_sync_at(conn.id, T4)
        .await
        .unwrap();

    mount_auth_ok(&upstream, 7).await;
    mount_search_read(&upstream, "sale.order", json!([order(44, "S00044", T5)])).await;
    mount_search_read(&upstream, "sale.order.line", json!([])).await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream overloaded"))
        .mount(&webhook)
        .await;

    let before = Utc::now();
    let log = run_cycle(&handles, conn.id).await;

    assert_eq!(log.orders_found, 1);
    assert_eq!(log.orders_sent, 0);
    assert_eq!(log.orders_failed, 1);
    // A webhook failure is not a cycle failure.
    assert_eq!(log.error_message, None);

    let items = handles
        .retry_queue
        .list_by_connection(conn.id, 10)
        .await
        .unwrap();
    assert_eq!(items.len(), 1);
    let item = &items[0];
    assert_eq!(item.status, STATUS_PENDING);
    assert_eq!(item.attempts, 1);
    assert_eq!(item.external_id, "upstream_acme-prod_44");
    assert!(item.last_error.as_deref().unwrap().contains("503"));

    let delta = item.next_retry_at.with_timezone(&Utc) - before;
    assert!(
        (29..=40).contains(&delta.num_seconds()),
        "first retry should be ~30s out, got {}s",
        delta.num_seconds()
    );

    // Not ledgered yet, but the cursor moved: the order is durably parked.
    assert!(!handles.ledger.was_sent(conn.id, 44, T5).await.unwrap());
    let refreshed = handles.connections.get(conn.id).await.unwrap().unwrap();
    assert_eq!(refreshed.last_sync_at.as_deref(), Some(T5));
    // The breaker only watches the upstream.
    assert_eq!(refreshed.breaker_state, "closed");
    assert_eq!(refreshed.breaker_failure_count, 0);
}

#[tokio::test]
async fn retry_sweep_delivers_due_items() {
    let upstream = MockServer::start().await;
    let webhook = MockServer::start().await;
    let handles = setup_handles().await.unwrap();
    let conn = insert_connection(&handles, &upstream.uri(), &webhook.uri())
        .await
        .unwrap();

    handles
        .connections
        .update_last_sync_at(conn.id, T5)
        .await
        .unwrap();

    let payload = json!({
        "event": "order.confirmed",
        "external_id": "upstream_acme-prod_44",
        "order": {"platform_order_number": "S00044"},
    });
    let EnqueueOutcome::Queued(item) = handles
        .retry_queue
        .enqueue(NewRetryItem {
            connection_id: conn.id,
            order_id: 44,
            external_id: "upstream_acme-prod_44".to_string(),
            write_date: T5.to_string(),
            payload: payload.to_string(),
            next_retry_at: Utc::now() - Duration::seconds(1),
            last_error: Some("HTTP 503".to_string()),
        })
        .await
        .unwrap()
    else {
        panic!("enqueue should insert");
    };

    mount_auth_ok(&upstream, 7).await;
    mount_search_read(&upstream, "sale.order", json!([])).await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&webhook)
        .await;

    let log = run_cycle(&handles, conn.id).await;
    assert_eq!(log.orders_found, 0);

    let reloaded = handles.retry_queue.get(item.id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, STATUS_SUCCESS);
    assert!(handles.ledger.was_sent(conn.id, 44, T5).await.unwrap());
}

#[tokio::test]
async fn exhausted_retries_are_marked_failed() {
    let upstream = MockServer::start().await;
    let webhook = MockServer::start().await;
    let handles = setup_handles().await.unwrap();
    let conn = insert_connection(&handles, &upstream.uri(), &webhook.uri())
        .await
        .unwrap();

    handles
        .connections
        .update_last_sync_at(conn.id, T5)
        .await
        .unwrap();

    let EnqueueOutcome::Queued(item) = handles
        .retry_queue
        .enqueue(NewRetryItem {
            connection_id: conn.id,
            order_id: 45,
            external_id: "upstream_acme-prod_45".to_string(),
            write_date: T5.to_string(),
            payload: json!({"order": {"platform_order_number": "S00045"}}).to_string(),
            next_retry_at: Utc::now() - Duration::seconds(1),
            last_error: None,
        })
        .await
        .unwrap()
    else {
        panic!("enqueue should insert");
    };
    // Simulate three earlier failed sweeps.
    handles
        .retry_queue
        .reschedule(item.id, 4, Utc::now() - Duration::seconds(1), None)
        .await
        .unwrap();

    mount_auth_ok(&upstream, 7).await;
    mount_search_read(&upstream, "sale.order", json!([])).await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&webhook)
        .await;

    run_cycle(&handles, conn.id).await;

    let reloaded = handles.retry_queue.get(item.id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, "failed");
    assert_eq!(reloaded.attempts, 5);
}

#[tokio::test]
async fn breaker_trips_after_five_upstream_failures() {
    let upstream = MockServer::start().await;
    let webhook = MockServer::start().await;
    let handles = setup_handles().await.unwrap();
    let conn = insert_connection(&handles, &upstream.uri(), &webhook.uri())
        .await
        .unwrap();

    Mock::given(method("POST"))
        .and(path("/jsonrpc"))
        .respond_with(rpc_error("Access Denied"))
        .mount(&upstream)
        .await;

    for cycle in 1..=5 {
        let log = run_cycle(&handles, conn.id).await;
        assert!(log.error_message.is_some(), "cycle {cycle} should fail");
    }

    let tripped = handles.connections.get(conn.id).await.unwrap().unwrap();
    assert_eq!(tripped.breaker_state, "open");
    assert_eq!(tripped.breaker_failure_count, 5);
    let retry_at = tripped.breaker_retry_at.unwrap().with_timezone(&Utc);
    let window = retry_at - Utc::now();
    assert!(
        (RECOVERY_TIMEOUT_SECS - 10..=RECOVERY_TIMEOUT_SECS).contains(&window.num_seconds()),
        "recovery window should be ~120s, got {}s",
        window.num_seconds()
    );

    let requests_after_trip = upstream.received_requests().await.unwrap().len();
    assert_eq!(requests_after_trip, 5, "one auth attempt per failed cycle");

    // While open, cycles are skipped with no upstream traffic.
    let log = run_cycle(&handles, conn.id).await;
    assert_eq!(
        log.error_message.as_deref(),
        Some("breaker open; cycle skipped")
    );
    assert_eq!(log.breaker_state_entry, "open");
    assert_eq!(
        upstream.received_requests().await.unwrap().len(),
        requests_after_trip
    );
}

#[tokio::test]
async fn half_open_breaker_closes_after_two_good_cycles() {
    let upstream = MockServer::start().await;
    let webhook = MockServer::start().await;
    let handles = setup_handles().await.unwrap();
    let conn = insert_connection(&handles, &upstream.uri(), &webhook.uri())
        .await
        .unwrap();

    handles
        .connections
        .update_last_sync_at(conn.id, T5)
        .await
        .unwrap();
    // An open breaker whose recovery window has already elapsed.
    handles
        .connections
        .update_breaker(
            conn.id,
            "open",
            5,
            0,
            Some(Utc::now() - Duration::seconds(1)),
        )
        .await
        .unwrap();

    mount_auth_ok(&upstream, 7).await;
    mount_search_read(&upstream, "sale.order", json!([])).await;

    let probe = run_cycle(&handles, conn.id).await;
    assert_eq!(probe.breaker_state_entry, "open");
    assert_eq!(probe.breaker_state_exit, "half_open");

    let after_probe = handles.connections.get(conn.id).await.unwrap().unwrap();
    assert_eq!(after_probe.breaker_state, "half_open");
    assert_eq!(after_probe.breaker_half_open_successes, 1);

    let second = run_cycle(&handles, conn.id).await;
    assert_eq!(second.breaker_state_exit, "closed");

    let recovered = handles.connections.get(conn.id).await.unwrap().unwrap();
    assert_eq!(recovered.breaker_state, "closed");
    assert_eq!(recovered.breaker_failure_count, 0);
    assert_eq!(recovered.breaker_half_open_successes, 0);
}

#[tokio::test]
async fn rate_limited_cycles_leave_the_breaker_alone() {
    let upstream = MockServer::start().await;
    let webhook = MockServer::start().await;
    let handles = setup_handles().await.unwrap();
    let conn = insert_connection(&handles, &upstream.uri(), &webhook.uri())
        .await
        .unwrap();

    Mock::given(method("POST"))
        .and(path("/jsonrpc"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&upstream)
        .await;

    for _ in 0..6 {
        let log = run_cycle(&handles, conn.id).await;
        assert!(log
            .error_message
            .as_deref()
            .unwrap()
            .contains("rate limited"));
    }

    let refreshed = handles.connections.get(conn.id).await.unwrap().unwrap();
    assert_eq!(refreshed.breaker_state, "closed");
    assert_eq!(refreshed.breaker_failure_count, 0);
}
