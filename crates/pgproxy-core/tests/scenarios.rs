//! End-to-end supervisor scenarios over a scripted driver.
//!
//! Each test plays the role of the WebSocket ingress: it posts supervisor
//! messages and asserts on the exact frames the proxy hands back.

use pgproxy_commons::ids::ClientId;
use pgproxy_core::client::{ALREADY_LISTENING, LISTENING, NOT_CONNECTED, NOT_LISTENING_ON_CHANNEL};
use pgproxy_core::config::ProxyConfig;
use pgproxy_core::driver::QueryBatch;
use pgproxy_core::supervisor::{ProxyMsg, Supervisor, SupervisorHandle};
use pgproxy_core::test_support::{DriverCall, ScriptedDriver};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn test_config() -> ProxyConfig {
    ProxyConfig {
        tick_interval: None,
        delay_before_stop: Duration::from_millis(20),
        gc_disconnected_after_secs: 2,
        ..Default::default()
    }
}

struct TestClient {
    id: ClientId,
    rx: mpsc::UnboundedReceiver<String>,
}

impl TestClient {
    async fn recv(&mut self) -> String {
        tokio::time::timeout(Duration::from_secs(1), self.rx.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for a frame for {}", self.id))
            .expect("outbound channel closed")
    }

    fn no_frame(&mut self) {
        assert!(
            self.rx.try_recv().is_err(),
            "unexpected frame for {}",
            self.id
        );
    }
}

fn attach(handle: &SupervisorHandle, id: &str) -> TestClient {
    let (tx, rx) = mpsc::unbounded_channel();
    let id = ClientId::new(id);
    handle.post(ProxyMsg::Connected {
        client_id: id.clone(),
        ip: None,
        outbound: tx,
    });
    TestClient { id, rx }
}

fn send(handle: &SupervisorHandle, client: &TestClient, text: &str) {
    handle.post(ProxyMsg::Frame {
        client_id: client.id.clone(),
        text: text.to_string(),
    });
}

fn connect_frame(request_id: i64, password: &str) -> String {
    format!(
        r#"{{"func":"connect","requestId":{},"sessionId":"s","host":"h","port":5432,"database":"d","user":"u","password":"{}"}}"#,
        request_id, password
    )
}

async fn connect(handle: &SupervisorHandle, client: &mut TestClient, request_id: i64) {
    send(handle, client, &connect_frame(request_id, "p"));
    assert_eq!(
        client.recv().await,
        format!(
            r#"{{"requestId":{},"type":"connect","success":true,"clientId":"{}"}}"#,
            request_id, client.id
        )
    );
}

async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never reached: {}", what);
}

#[tokio::test]
async fn happy_path_query() {
    let driver = ScriptedDriver::new();
    driver.script_query(QueryBatch {
        records: vec!["1".to_string()],
        has_more: false,
    });
    let handle = Supervisor::spawn(test_config(), Arc::new(driver.clone()));
    let mut a = attach(&handle, "a");

    connect(&handle, &mut a, 1).await;

    send(
        &handle,
        &a,
        r#"{"func":"query","requestId":2,"sessionId":"s","sql":"SELECT 1","recordCount":10}"#,
    );
    assert_eq!(
        a.recv().await,
        r#"{"requestId":2,"type":"query","success":true,"records":["1"],"clientId":"a"}"#
    );

    send(
        &handle,
        &a,
        r#"{"func":"disconnect","requestId":3,"sessionId":"s","discardConnection":true}"#,
    );
    assert_eq!(
        a.recv().await,
        r#"{"requestId":3,"type":"disconnect","success":true,"clientId":"a"}"#
    );

    wait_until("backend connection closed", || driver.live_count() == 0).await;
    assert!(driver.calls().iter().any(|c| matches!(
        c,
        DriverCall::Disconnect { discard: true, .. }
    )));
}

#[tokio::test]
async fn execute_sql_reports_count() {
    let driver = ScriptedDriver::new();
    driver.script_execute(7);
    let handle = Supervisor::spawn(test_config(), Arc::new(driver.clone()));
    let mut a = attach(&handle, "a");
    connect(&handle, &mut a, 1).await;

    send(
        &handle,
        &a,
        r#"{"func":"executeSql","requestId":2,"sessionId":"s","sql":"DELETE FROM t"}"#,
    );
    assert_eq!(
        a.recv().await,
        r#"{"requestId":2,"type":"executeSql","success":true,"count":7,"clientId":"a"}"#
    );
}

#[tokio::test]
async fn more_query_results_drains_batches() {
    let driver = ScriptedDriver::new();
    driver.script_query(QueryBatch {
        records: vec!["r1".to_string(), "r2".to_string()],
        has_more: true,
    });
    driver.script_query(QueryBatch {
        records: vec!["r3".to_string()],
        has_more: false,
    });
    let handle = Supervisor::spawn(test_config(), Arc::new(driver.clone()));
    let mut a = attach(&handle, "a");
    connect(&handle, &mut a, 1).await;

    send(
        &handle,
        &a,
        r#"{"func":"query","requestId":2,"sessionId":"s","sql":"SELECT x","recordCount":2}"#,
    );
    assert_eq!(
        a.recv().await,
        r#"{"requestId":2,"type":"query","success":true,"records":["r1","r2"],"clientId":"a"}"#
    );

    send(
        &handle,
        &a,
        r#"{"func":"moreQueryResults","requestId":3,"sessionId":"s"}"#,
    );
    assert_eq!(
        a.recv().await,
        r#"{"requestId":3,"type":"moreQueryResults","success":true,"records":["r3"],"clientId":"a"}"#
    );
}

#[tokio::test]
async fn listen_sharing_single_backend_listen() {
    let driver = ScriptedDriver::new();
    let handle = Supervisor::spawn(test_config(), Arc::new(driver.clone()));
    let mut a = attach(&handle, "a");
    let mut b = attach(&handle, "b");

    // same fingerprint, different passwords: still shared
    send(&handle, &a, &connect_frame(1, "pa"));
    a.recv().await;
    send(&handle, &b, &connect_frame(1, "pb"));
    b.recv().await;
    assert_eq!(driver.live_count(), 2);

    send(
        &handle,
        &a,
        r#"{"func":"listen","requestId":10,"sessionId":"s","channel":"events"}"#,
    );
    assert_eq!(
        a.recv().await,
        r#"{"requestId":10,"type":"listen","success":true,"clientId":"a"}"#
    );

    send(
        &handle,
        &b,
        r#"{"func":"listen","requestId":20,"sessionId":"s","channel":"events"}"#,
    );
    assert_eq!(
        b.recv().await,
        r#"{"requestId":20,"type":"listen","success":true,"clientId":"b"}"#
    );

    // b's own connection was released; exactly one backend LISTEN exists
    wait_until("released connection closed", || driver.live_count() == 1).await;
    assert_eq!(driver.listening_count("events"), 1);
    let listens = driver
        .calls()
        .iter()
        .filter(|c| matches!(c, DriverCall::Listen { .. }))
        .count();
    assert_eq!(listens, 1);

    // one NOTIFY fans out to both clients, keyed to each listen request
    assert_eq!(driver.notify("events", "ping"), 1);
    assert_eq!(
        a.recv().await,
        r#"{"requestId":10,"type":"listen","unsolicited":true,"notification":"ping","clientId":"a"}"#
    );
    assert_eq!(
        b.recv().await,
        r#"{"requestId":20,"type":"listen","unsolicited":true,"notification":"ping","clientId":"b"}"#
    );
}

#[tokio::test]
async fn unlisten_with_remaining_sharers_reconnects() {
    let driver = ScriptedDriver::new();
    let handle = Supervisor::spawn(test_config(), Arc::new(driver.clone()));
    let mut a = attach(&handle, "a");
    let mut b = attach(&handle, "b");
    send(&handle, &a, &connect_frame(1, "p"));
    a.recv().await;
    send(&handle, &b, &connect_frame(1, "p"));
    b.recv().await;

    send(
        &handle,
        &a,
        r#"{"func":"listen","requestId":10,"sessionId":"s","channel":"events"}"#,
    );
    a.recv().await;
    send(
        &handle,
        &b,
        r#"{"func":"listen","requestId":20,"sessionId":"s","channel":"events"}"#,
    );
    b.recv().await;
    wait_until("released connection closed", || driver.live_count() == 1).await;

    send(
        &handle,
        &a,
        r#"{"func":"unlisten","requestId":30,"sessionId":"s","channel":"events"}"#,
    );
    assert_eq!(
        a.recv().await,
        r#"{"requestId":30,"type":"unlisten","success":true,"clientId":"a"}"#
    );

    // a got a fresh non-listen connection, the shared LISTEN stays for b
    wait_until("fresh connection open", || driver.live_count() == 2).await;
    assert_eq!(driver.listening_count("events"), 1);

    // notifications now reach only b
    assert_eq!(driver.notify("events", "ping"), 1);
    assert_eq!(
        b.recv().await,
        r#"{"requestId":20,"type":"listen","unsolicited":true,"notification":"ping","clientId":"b"}"#
    );
    tokio::time::sleep(Duration::from_millis(20)).await;
    a.no_frame();

    // and a can query again
    driver.script_query(QueryBatch {
        records: vec!["1".to_string()],
        has_more: false,
    });
    send(
        &handle,
        &a,
        r#"{"func":"query","requestId":31,"sessionId":"s","sql":"SELECT 1","recordCount":1}"#,
    );
    assert_eq!(
        a.recv().await,
        r#"{"requestId":31,"type":"query","success":true,"records":["1"],"clientId":"a"}"#
    );
}

#[tokio::test]
async fn listen_precheck_errors() {
    let driver = ScriptedDriver::new();
    let handle = Supervisor::spawn(test_config(), Arc::new(driver.clone()));
    let mut a = attach(&handle, "a");

    // not connected yet
    send(
        &handle,
        &a,
        r#"{"func":"listen","requestId":1,"sessionId":"s","channel":"events"}"#,
    );
    assert_eq!(
        a.recv().await,
        format!(
            r#"{{"requestId":1,"type":"listen","success":false,"error":"{}","clientId":"a"}}"#,
            NOT_CONNECTED
        )
    );

    connect(&handle, &mut a, 2).await;
    send(
        &handle,
        &a,
        r#"{"func":"listen","requestId":3,"sessionId":"s","channel":"events"}"#,
    );
    a.recv().await;

    // query on a listening connection
    send(
        &handle,
        &a,
        r#"{"func":"query","requestId":4,"sessionId":"s","sql":"SELECT 1","recordCount":1}"#,
    );
    assert_eq!(
        a.recv().await,
        format!(
            r#"{{"requestId":4,"type":"query","success":false,"error":"{}","clientId":"a"}}"#,
            LISTENING
        )
    );

    // a second listen on the same connection
    send(
        &handle,
        &a,
        r#"{"func":"listen","requestId":5,"sessionId":"s","channel":"other"}"#,
    );
    assert_eq!(
        a.recv().await,
        format!(
            r#"{{"requestId":5,"type":"listen","success":false,"error":"{}","clientId":"a"}}"#,
            ALREADY_LISTENING
        )
    );

    // unlisten on a channel it is not listening to
    send(
        &handle,
        &a,
        r#"{"func":"unlisten","requestId":6,"sessionId":"s","channel":"other"}"#,
    );
    assert_eq!(
        a.recv().await,
        format!(
            r#"{{"requestId":6,"type":"unlisten","success":false,"error":"{}","clientId":"a"}}"#,
            NOT_LISTENING_ON_CHANNEL
        )
    );
}

#[tokio::test]
async fn invalid_session_rejected_before_any_state() {
    let driver = ScriptedDriver::new();
    let config = ProxyConfig {
        authenticate: Arc::new(|state, session_id: &str| {
            let ok = session_id == "good";
            (state, ok)
        }),
        ..test_config()
    };
    let handle = Supervisor::spawn(config, Arc::new(driver.clone()));
    let mut a = attach(&handle, "a");

    send(&handle, &a, &connect_frame(1, "p").replace("\"s\"", "\"bad\""));
    assert_eq!(
        a.recv().await,
        r#"{"requestId":1,"type":"connect","success":false,"error":"Invalid session","clientId":"a"}"#
    );

    // a frame without any sessionId fails the same way
    send(
        &handle,
        &a,
        r#"{"func":"query","requestId":2,"sql":"SELECT 1","recordCount":1}"#,
    );
    assert_eq!(
        a.recv().await,
        r#"{"requestId":2,"type":"query","success":false,"error":"Invalid session","clientId":"a"}"#
    );

    assert!(driver.calls().is_empty());
}

#[tokio::test]
async fn fatal_send_error_poisons_client() {
    let driver = ScriptedDriver::new();
    let handle = Supervisor::spawn(test_config(), Arc::new(driver.clone()));
    let mut a = attach(&handle, "a");
    connect(&handle, &mut a, 1).await;

    handle.post(ProxyMsg::SendFailed {
        client_id: a.id.clone(),
        error: "Unable to send response to client: broken pipe".to_string(),
    });

    send(
        &handle,
        &a,
        r#"{"func":"query","requestId":2,"sessionId":"s","sql":"SELECT 1","recordCount":1}"#,
    );
    assert_eq!(
        a.recv().await,
        r#"{"requestId":2,"type":"query","success":false,"error":"Unable to send response to client: broken pipe","clientId":"a"}"#
    );

    // every subsequent request echoes the same fatal error
    send(
        &handle,
        &a,
        r#"{"func":"disconnect","requestId":3,"sessionId":"s","discardConnection":false}"#,
    );
    assert_eq!(
        a.recv().await,
        r#"{"requestId":3,"type":"disconnect","success":false,"error":"Unable to send response to client: broken pipe","clientId":"a"}"#
    );
}

#[tokio::test]
async fn connection_lost_fans_out_once_per_client() {
    let driver = ScriptedDriver::new();
    let handle = Supervisor::spawn(test_config(), Arc::new(driver.clone()));
    let mut a = attach(&handle, "a");
    let mut b = attach(&handle, "b");
    send(&handle, &a, &connect_frame(1, "p"));
    a.recv().await;
    send(&handle, &b, &connect_frame(7, "p"));
    b.recv().await;

    // both share one LISTEN connection
    send(
        &handle,
        &a,
        r#"{"func":"listen","requestId":10,"sessionId":"s","channel":"events"}"#,
    );
    a.recv().await;
    send(
        &handle,
        &b,
        r#"{"func":"listen","requestId":20,"sessionId":"s","channel":"events"}"#,
    );
    b.recv().await;
    wait_until("released connection closed", || driver.live_count() == 1).await;

    driver.kill_connection(&pgproxy_commons::ids::ConnectionId::new("conn-1"), "db gone");

    assert_eq!(
        a.recv().await,
        r#"{"requestId":10,"type":"connect","unsolicited":true,"connectionLostError":"db gone","clientId":"a"}"#
    );
    assert_eq!(
        b.recv().await,
        r#"{"requestId":20,"type":"connect","unsolicited":true,"connectionLostError":"db gone","clientId":"b"}"#
    );

    // exactly once, and no mapping survives
    tokio::time::sleep(Duration::from_millis(20)).await;
    a.no_frame();
    b.no_frame();

    send(
        &handle,
        &a,
        r#"{"func":"query","requestId":11,"sessionId":"s","sql":"SELECT 1","recordCount":1}"#,
    );
    assert_eq!(
        a.recv().await,
        format!(
            r#"{{"requestId":11,"type":"query","success":false,"error":"{}","clientId":"a"}}"#,
            NOT_CONNECTED
        )
    );
}

#[tokio::test]
async fn disconnected_client_is_garbage_collected() {
    let driver = ScriptedDriver::new();
    let handle = Supervisor::spawn(test_config(), Arc::new(driver.clone()));
    let mut a = attach(&handle, "a");
    connect(&handle, &mut a, 1).await;
    assert_eq!(handle.client_count(), 1);

    handle.post(ProxyMsg::Disconnected {
        client_id: a.id.clone(),
    });
    wait_until("backend torn down", || driver.live_count() == 0).await;

    // gc_disconnected_after_secs = 2: two ticks age the client out
    handle.post(ProxyMsg::Tick);
    handle.post(ProxyMsg::Tick);
    wait_until("client destroyed", || handle.client_count() == 0).await;
}

#[tokio::test]
async fn stale_connect_completion_is_closed_again() {
    let driver = ScriptedDriver::new();
    let handle = Supervisor::spawn(test_config(), Arc::new(driver.clone()));
    let a = attach(&handle, "a");

    // the WebSocket closes in the same breath as the connect request
    send(&handle, &a, &connect_frame(1, "p"));
    handle.post(ProxyMsg::Disconnected {
        client_id: a.id.clone(),
    });

    // the late connect completion must not leak a backend connection
    wait_until("stale connection closed", || driver.live_count() == 0).await;
    assert!(driver
        .calls()
        .iter()
        .any(|c| matches!(c, DriverCall::Connect { .. })));
}

#[tokio::test]
async fn graceful_shutdown_destroys_clients_then_stops() {
    let driver = ScriptedDriver::new();
    let handle = Supervisor::spawn(test_config(), Arc::new(driver.clone()));
    let mut a = attach(&handle, "a");
    let mut b = attach(&handle, "b");
    connect(&handle, &mut a, 1).await;
    send(&handle, &b, &connect_frame(2, "p"));
    b.recv().await;

    handle.post(ProxyMsg::Stop);
    wait_until("stop accepted", || handle.is_stopping()).await;

    // requests during the stop window are rejected without a response
    send(
        &handle,
        &a,
        r#"{"func":"query","requestId":9,"sessionId":"s","sql":"SELECT 1","recordCount":1}"#,
    );

    tokio::time::timeout(Duration::from_secs(1), handle.stopped())
        .await
        .expect("supervisor must stop");

    assert_eq!(handle.client_count(), 0);
    wait_until("backends closed", || driver.live_count() == 0).await;
    a.no_frame();
    b.no_frame();
}

#[tokio::test]
async fn credential_remapping_hides_real_credentials() {
    let driver = ScriptedDriver::new();
    let mut maps = pgproxy_core::auth::CredentialMaps::default();
    maps.host = Some(std::collections::HashMap::from([(
        "h".to_string(),
        "db.internal".to_string(),
    )]));
    maps.user = Some(std::collections::HashMap::from([(
        "u".to_string(),
        "real_user".to_string(),
    )]));
    maps.password = Some(std::collections::HashMap::from([(
        "p".to_string(),
        "real_pw".to_string(),
    )]));
    let config = ProxyConfig {
        maps,
        ..test_config()
    };
    let handle = Supervisor::spawn(config, Arc::new(driver.clone()));
    let mut a = attach(&handle, "a");
    connect(&handle, &mut a, 1).await;

    assert_eq!(
        driver.calls()[0],
        DriverCall::Connect {
            host: "db.internal".to_string(),
            user: "real_user".to_string(),
            password: "real_pw".to_string(),
        }
    );
}
