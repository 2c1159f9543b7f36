use super::helper::*;
use crate::*;
use futures::future::join_all;
use log::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use wirerpc::error::code;
use wirerpc::metrics::CallStats;
use wirerpc::*;

async fn echo_round<W: WireFormat>(is_tcp: bool, name: &str) {
    let (mut server, addr) =
        init_server::<W>(ServerConfig::default(), &bind_addr(is_tcp, name)).expect("listen");
    debug!("server {} on {}", W::NAME, addr);
    let client = TcpClient::<W>::new(ClientConfig::default());
    for body in [Vec::new(), b"hello".to_vec(), vec![7u8; 200 * 1024]] {
        let resp = client.call(&addr, CMD_ECHO, body.clone()).await.expect("call");
        assert_eq!(resp.err_code, code::OK);
        assert_eq!(resp.cmd, CMD_ECHO);
        assert_eq!(resp.body, body);
    }
    let conn = client.get_conn(&addr).expect("conn");
    assert_eq!(conn.connected(), 1);
    assert_eq!(server.alive_conns(), 1);
    client.stop().await;
    server.stop().await;
}

#[logfn]
#[rstest]
#[case(true)]
#[case(false)]
fn test_echo_simple(runner: TestRunner, #[case] is_tcp: bool) {
    runner.block_on(async move {
        echo_round::<Simple>(is_tcp, "echo_simple").await;
    });
}

#[logfn]
#[rstest]
#[case(true)]
#[case(false)]
fn test_echo_guarded(runner: TestRunner, #[case] is_tcp: bool) {
    runner.block_on(async move {
        echo_round::<Guarded>(is_tcp, "echo_guarded").await;
    });
}

/// Later requests sleep less, so the server answers in reverse order
#[logfn]
#[rstest]
#[case(true)]
#[case(false)]
fn test_out_of_order_no_crosstalk(runner: TestRunner, #[case] is_tcp: bool) {
    runner.block_on(async move {
        let (mut server, addr) = init_server::<Simple>(
            ServerConfig::default(),
            &bind_addr(is_tcp, "out_of_order"),
        )
        .expect("listen");
        let client = TcpClient::<Simple>::new(ClientConfig::default());
        let count = 50u64;
        let calls = (0..count).map(|i| {
            let body = sleep_body((count - i) * 4, format!("req-{}", i).as_bytes());
            let client = &client;
            let addr = &addr;
            async move {
                let resp = client.call(addr, CMD_SLEEP, body.clone()).await.expect("call");
                assert_eq!(resp.body, body);
                resp.seq
            }
        });
        let mut seqs = join_all(calls).await;
        seqs.sort();
        seqs.dedup();
        assert_eq!(seqs.len(), count as usize);
        client.stop().await;
        server.stop().await;
    });
}

#[logfn]
#[rstest]
#[case(true)]
#[case(false)]
fn test_multi_conns(runner: TestRunner, #[case] is_tcp: bool) {
    runner.block_on(async move {
        let (mut server, addr) =
            init_server::<Guarded>(ServerConfig::default(), &bind_addr(is_tcp, "multi_conns"))
                .expect("listen");
        let config = ClientConfig { conns: 3, ..Default::default() };
        let client = TcpClient::<Guarded>::new(config);
        let calls = (0..30u32).map(|i| {
            let client = &client;
            let addr = &addr;
            async move {
                let body = i.to_be_bytes().to_vec();
                let resp = client.call(addr, CMD_ECHO, body.clone()).await.expect("call");
                assert_eq!(resp.body, body);
            }
        });
        join_all(calls).await;
        let conn = client.get_conn(&addr).expect("conn");
        assert!(wait_until(|| conn.connected() == 3, Duration::from_secs(5)).await);
        assert!(wait_until(|| server.alive_conns() == 3, Duration::from_secs(5)).await);
        client.stop().await;
        server.stop().await;
    });
}

#[logfn]
#[rstest]
fn test_fire_and_forget(runner: TestRunner) {
    runner.block_on(async move {
        let received = Arc::new(AtomicUsize::new(0));
        let mut server = TcpServer::<Simple>::new(ServerConfig::default());
        let _received = received.clone();
        server.register(CMD_ECHO, move |body: Vec<u8>| {
            _received.fetch_add(1, Ordering::SeqCst);
            async move { (code::OK, body) }
        });
        let addr = server.start("127.0.0.1:0").expect("listen");
        let client = TcpClient::<Simple>::new(ClientConfig::default());
        for i in 0..10u8 {
            let res = client.send(&addr, CMD_ECHO, vec![i]).expect("send");
            // resolved once written, carries no response body
            let resp = res.wait_timeout(Duration::from_secs(5)).await.expect("sent");
            assert!(resp.body.is_empty());
        }
        // dropping the handle does not cancel
        for i in 0..10u8 {
            drop(client.send(&addr, CMD_ECHO, vec![i]).expect("send"));
        }
        assert!(wait_until(|| received.load(Ordering::SeqCst) == 20, Duration::from_secs(5)).await);
        client.stop().await;
        server.stop().await;
    });
}

#[logfn]
#[rstest]
fn test_metrics(runner: TestRunner) {
    runner.block_on(async move {
        let server_stats = Arc::new(CallStats::default());
        let mut server = TcpServer::<Simple>::new(ServerConfig::default());
        register_basic(&mut server);
        server.add_filter(MetricsFilter::new(server_stats.clone()));
        let addr = server.start("127.0.0.1:0").expect("listen");

        let client_stats = Arc::new(CallStats::default());
        let client = TcpClient::<Simple>::with_metrics(ClientConfig::default(), client_stats.clone());
        for _ in 0..5 {
            client.call(&addr, CMD_ECHO, b"x".to_vec()).await.expect("call");
        }
        let resp = client.call(&addr, 99, Vec::new()).await.expect("call");
        assert_eq!(resp.err_code, code::INVALID_PARAM);
        let r = client.call_timeout(&addr, CMD_SLEEP, sleep_body(300, b""), Duration::from_millis(50), 0);
        assert_eq!(r.await.unwrap_err(), error::RpcErr::Timeout);

        let s = client_stats.snapshot();
        assert_eq!(s.calls, 7);
        assert_eq!(s.errors, 2);
        assert_eq!(s.timeouts, 1);
        // the sleeping request finishes later on the server
        assert!(wait_until(|| server_stats.snapshot().calls == 7, Duration::from_secs(5)).await);
        assert_eq!(server_stats.snapshot().errors, 1);
        client.stop().await;
        server.stop().await;
    });
}

/// Responses squeeze through a one-slot channel, each written and flushed on its own
#[logfn]
#[rstest]
#[case(true)]
#[case(false)]
fn test_server_unbatched_writer(runner: TestRunner, #[case] is_tcp: bool) {
    runner.block_on(async move {
        let config =
            ServerConfig { pending_responses: 1, flush_delay: Duration::ZERO, ..Default::default() };
        let (mut server, addr) =
            init_server::<Guarded>(config, &bind_addr(is_tcp, "unbatched_writer")).expect("listen");
        let client = TcpClient::<Guarded>::new(ClientConfig::default());
        let calls = (0..100u32).map(|i| {
            let client = &client;
            let addr = &addr;
            async move {
                let body = vec![i as u8; 1024 + i as usize];
                let resp = client.call(addr, CMD_ECHO, body.clone()).await.expect("call");
                assert_eq!(resp.body, body);
            }
        });
        join_all(calls).await;
        assert!(wait_until(|| server.busy_workers() == 0, Duration::from_secs(2)).await);
        client.stop().await;
        server.stop().await;
    });
}
