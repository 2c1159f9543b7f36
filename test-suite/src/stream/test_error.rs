use super::helper::*;
use crate::*;
use log::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use wirerpc::error::{RpcErr, code};
use wirerpc::*;

const CMD_FLAKY: u32 = 10;

/// The first `fail` requests sleep past any test timeout, later ones reply at once
fn flaky_server(fail: usize) -> (TcpServer<Simple>, Arc<AtomicUsize>) {
    let attempts = Arc::new(AtomicUsize::new(0));
    let mut server = TcpServer::<Simple>::new(ServerConfig::default());
    let _attempts = attempts.clone();
    server.register(CMD_FLAKY, move |body: Vec<u8>| {
        let n = _attempts.fetch_add(1, Ordering::SeqCst);
        async move {
            if n < fail {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            (code::OK, body)
        }
    });
    (server, attempts)
}

#[logfn]
#[rstest]
#[case(true)]
#[case(false)]
fn test_unknown_cmd(runner: TestRunner, #[case] is_tcp: bool) {
    runner.block_on(async move {
        let (mut server, addr) =
            init_server::<Guarded>(ServerConfig::default(), &bind_addr(is_tcp, "unknown_cmd"))
                .expect("listen");
        let client = TcpClient::<Guarded>::new(ClientConfig::default());
        let resp = client.call(&addr, 404, b"what".to_vec()).await.expect("call");
        assert_eq!(resp.err_code, code::INVALID_PARAM);
        assert!(resp.body.is_empty());
        // the connection is still usable
        let resp = client.call(&addr, CMD_ECHO, b"next".to_vec()).await.expect("call");
        assert_eq!(resp.err_code, code::OK);
        assert_eq!(resp.body, b"next");
        assert_eq!(server.alive_conns(), 1);
        client.stop().await;
        server.stop().await;
    });
}

#[logfn]
#[rstest]
#[case(true)]
#[case(false)]
fn test_handler_panic(runner: TestRunner, #[case] is_tcp: bool) {
    runner.block_on(async move {
        let (mut server, addr) =
            init_server::<Simple>(ServerConfig::default(), &bind_addr(is_tcp, "panic"))
                .expect("listen");
        let client = TcpClient::<Simple>::new(ClientConfig::default());
        for _ in 0..3 {
            let resp = client.call(&addr, CMD_PANIC, b"boom".to_vec()).await.expect("call");
            assert_eq!(resp.err_code, code::INTERNAL_SERVER_ERROR);
            let resp = client.call(&addr, CMD_ECHO, b"alive".to_vec()).await.expect("call");
            assert_eq!(resp.body, b"alive");
        }
        assert_eq!(client.get_conn(&addr).expect("conn").connected(), 1);
        assert!(wait_until(|| server.busy_workers() == 0, Duration::from_secs(2)).await);
        client.stop().await;
        server.stop().await;
    });
}

#[logfn]
#[rstest]
#[case(true)]
#[case(false)]
fn test_timeout(runner: TestRunner, #[case] is_tcp: bool) {
    runner.block_on(async move {
        let (mut server, addr) =
            init_server::<Simple>(ServerConfig::default(), &bind_addr(is_tcp, "timeout"))
                .expect("listen");
        let client = TcpClient::<Simple>::new(ClientConfig::default());
        let body = sleep_body(300, b"slow");
        let r = client.call_timeout(&addr, CMD_SLEEP, body, Duration::from_millis(50), 0).await;
        assert_eq!(r.unwrap_err(), RpcErr::Timeout);
        let resp = client.call(&addr, CMD_ECHO, b"fast".to_vec()).await.expect("call");
        assert_eq!(resp.body, b"fast");
        // the late response arrives and is dropped without effect
        tokio::time::sleep(Duration::from_millis(400)).await;
        let resp = client.call(&addr, CMD_ECHO, b"after".to_vec()).await.expect("call");
        assert_eq!(resp.body, b"after");
        assert_eq!(client.get_conn(&addr).expect("conn").connected(), 1);
        client.stop().await;
        server.stop().await;
    });
}

#[logfn]
#[rstest]
fn test_retry_then_success(runner: TestRunner) {
    runner.block_on(async move {
        let (mut server, attempts) = flaky_server(2);
        let addr = server.start("127.0.0.1:0").expect("listen");
        let client = TcpClient::<Simple>::new(ClientConfig::default());
        let resp = client
            .call_timeout(&addr, CMD_FLAKY, b"retry".to_vec(), Duration::from_millis(100), 3)
            .await
            .expect("call");
        assert_eq!(resp.body, b"retry");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        client.stop().await;
        server.stop().await;
    });
}

#[logfn]
#[rstest]
fn test_retry_exhausted(runner: TestRunner) {
    runner.block_on(async move {
        let (mut server, attempts) = flaky_server(usize::MAX);
        let addr = server.start("127.0.0.1:0").expect("listen");
        let config = ClientConfig { request_timeout: Duration::from_millis(100), ..Default::default() };
        let client = TcpClient::<Simple>::new(config);
        let r = client.call_retry(&addr, CMD_FLAKY, b"x".to_vec(), 2).await;
        assert_eq!(r.unwrap_err(), RpcErr::Timeout);
        // every attempt reached the server
        assert!(wait_until(|| attempts.load(Ordering::SeqCst) >= 3, Duration::from_secs(2)).await);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        client.stop().await;
        server.stop().await;
    });
}

/// Nothing listens on the path, so the queue is never consumed
#[logfn]
#[rstest]
fn test_queue_overflow(runner: TestRunner) {
    runner.block_on(async move {
        let addr = "/tmp/wirerpc-test-nobody.sock";
        let _ = std::fs::remove_file(addr);
        let config = ClientConfig { pending_requests: 2, dial_retries: 1000, ..Default::default() };
        let client = TcpClient::<Simple>::new(config);
        let mut handles = Vec::new();
        for i in 0..10u8 {
            handles.push(client.call_async(addr, CMD_ECHO, vec![i], false).expect("enqueue"));
        }
        let conn = client.get_conn(addr).expect("conn");
        let queued = conn.queued();
        assert!(queued >= 1 && queued < 10);
        let mut evicted = 0;
        for h in handles.iter_mut().take(10 - queued) {
            assert_eq!(h.try_take().expect("evicted").unwrap_err(), RpcErr::Overflow);
            evicted += 1;
        }
        for h in handles.iter().skip(10 - queued) {
            assert!(!h.is_done());
        }
        info!("{} evicted, {} queued", evicted, queued);
        // fire-and-forget never evicts
        assert_eq!(client.send(addr, CMD_ECHO, vec![0]).unwrap_err(), RpcErr::Overflow);
        assert_eq!(conn.queued(), queued);
        client.stop().await;
        for h in handles.into_iter().skip(10 - queued) {
            assert_eq!(h.wait().await.unwrap_err(), RpcErr::Closed);
        }
    });
}

/// Queue one call at a time, so no call is evicted from the request queue
async fn push_call(
    client: &TcpClient<Simple>, conn: &ClientConn, addr: &str, body: Vec<u8>,
) -> AsyncResult {
    let h = client.call_async(addr, CMD_SLEEP, body, false).expect("enqueue");
    assert!(wait_until(|| conn.queued() == 0, Duration::from_secs(2)).await);
    h
}

/// With `pending_requests` 1 a session tolerates 3 calls in flight, the 4th breaks it
#[logfn]
#[rstest]
#[case(true)]
#[case(false)]
fn test_pending_table_overrun(runner: TestRunner, #[case] is_tcp: bool) {
    runner.block_on(async move {
        let (mut server, addr) =
            init_server::<Simple>(ServerConfig::default(), &bind_addr(is_tcp, "pending_overrun"))
                .expect("listen");
        let config =
            ClientConfig { pending_requests: 1, flush_delay: Duration::ZERO, ..Default::default() };
        let client = TcpClient::<Simple>::new(config);
        client.call(&addr, CMD_ECHO, b"up".to_vec()).await.expect("call");
        let conn = client.get_conn(&addr).expect("conn");
        let mut in_flight = Vec::new();
        for i in 0..3u8 {
            in_flight.push(push_call(&client, &conn, &addr, sleep_body(2000, &[i])).await);
        }
        let over = push_call(&client, &conn, &addr, sleep_body(2000, b"over")).await;
        assert_eq!(over.wait().await.unwrap_err(), RpcErr::Overflow);
        for h in in_flight {
            assert_eq!(h.wait().await.unwrap_err(), RpcErr::IO);
        }
        // a new session serves the next call
        let resp = client.call(&addr, CMD_ECHO, b"again".to_vec()).await.expect("call");
        assert_eq!(resp.body, b"again");
        assert_eq!(conn.connected(), 1);
        client.stop().await;
        server.stop().await;
    });
}

/// Canceled calls still in the pending table do not count against its limit
#[logfn]
#[rstest]
fn test_pending_table_reclaims_canceled(runner: TestRunner) {
    runner.block_on(async move {
        let (mut server, addr) =
            init_server::<Simple>(ServerConfig::default(), "127.0.0.1:0").expect("listen");
        let config =
            ClientConfig { pending_requests: 1, flush_delay: Duration::ZERO, ..Default::default() };
        let client = TcpClient::<Simple>::new(config);
        client.call(&addr, CMD_ECHO, b"up".to_vec()).await.expect("call");
        let conn = client.get_conn(&addr).expect("conn");
        for i in 0..3u8 {
            let h = push_call(&client, &conn, &addr, sleep_body(2000, &[i])).await;
            // not done, dropping it cancels the call
            drop(h);
        }
        for i in 0..3u8 {
            let h = push_call(&client, &conn, &addr, sleep_body(50, &[i])).await;
            let resp = h.wait_timeout(Duration::from_secs(5)).await.expect("call");
            assert_eq!(resp.body, sleep_body(50, &[i]));
        }
        assert_eq!(conn.connected(), 1);
        client.stop().await;
        server.stop().await;
    });
}

#[logfn]
#[rstest]
fn test_dial_unreachable(runner: TestRunner) {
    runner.block_on(async move {
        let addr = "/tmp/wirerpc-test-unreachable.sock";
        let _ = std::fs::remove_file(addr);
        let config = ClientConfig { dial_retries: 1, ..Default::default() };
        let client = TcpClient::<Simple>::new(config);
        let r = client
            .call_timeout(addr, CMD_ECHO, b"x".to_vec(), Duration::from_secs(5), 0)
            .await;
        assert_eq!(r.unwrap_err(), RpcErr::Unreachable);
        assert_eq!(client.get_conn(addr).expect("conn").connected(), 0);
        client.stop().await;
    });
}

#[logfn]
#[rstest]
fn test_client_stop(runner: TestRunner) {
    runner.block_on(async move {
        let (mut server, addr) =
            init_server::<Simple>(ServerConfig::default(), "127.0.0.1:0").expect("listen");
        let client = TcpClient::<Simple>::new(ClientConfig::default());
        client.call(&addr, CMD_ECHO, b"x".to_vec()).await.expect("call");
        let pending =
            client.call_async(&addr, CMD_SLEEP, sleep_body(2000, b""), false).expect("enqueue");
        tokio::time::sleep(Duration::from_millis(100)).await;
        client.stop().await;
        assert_eq!(pending.wait().await.unwrap_err(), RpcErr::Closed);
        assert_eq!(client.call(&addr, CMD_ECHO, b"x".to_vec()).await.unwrap_err(), RpcErr::Closed);
        assert_eq!(client.get_conn(&addr).expect("conn").connected(), 0);
        // the server notices the close
        assert!(wait_until(|| server.alive_conns() == 0, Duration::from_secs(5)).await);
        server.stop().await;
    });
}
