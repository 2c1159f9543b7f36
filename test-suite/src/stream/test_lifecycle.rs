use super::helper::*;
use crate::*;
use log::*;
use std::time::Duration;
use wirerpc::error::{RpcErr, code};
use wirerpc::io::{AsyncConn, AsyncRead, AsyncWrite, Transport};
use wirerpc::*;

#[logfn]
#[rstest]
#[case(true)]
#[case(false)]
fn test_server_stop(runner: TestRunner, #[case] is_tcp: bool) {
    runner.block_on(async move {
        let (mut server, addr) =
            init_server::<Simple>(ServerConfig::default(), &bind_addr(is_tcp, "server_stop"))
                .expect("listen");
        let mut clients = Vec::new();
        for _ in 0..4 {
            let client = TcpClient::<Simple>::new(ClientConfig::default());
            client.call(&addr, CMD_ECHO, b"hi".to_vec()).await.expect("call");
            clients.push(client);
        }
        assert!(wait_until(|| server.alive_conns() == 4, Duration::from_secs(5)).await);
        server.stop().await;
        assert_eq!(server.alive_conns(), 0);
        for client in clients.iter() {
            let r = client.call_timeout(&addr, CMD_ECHO, b"hi".to_vec(), Duration::from_millis(300), 0);
            assert!(r.await.is_err());
        }
        for client in clients {
            client.stop().await;
        }
    });
}

#[logfn]
#[rstest]
fn test_start_bad_addr(runner: TestRunner) {
    runner.block_on(async move {
        let mut server = TcpServer::<Simple>::new(ServerConfig::default());
        register_basic(&mut server);
        assert!(server.start("not an address").is_err());
        // still usable after a failed start
        let addr = server.start("127.0.0.1:0").expect("listen");
        assert_eq!(server.local_addr(), Some(addr.as_str()));
        let client = TcpClient::<Simple>::new(ClientConfig::default());
        let resp = client.call(&addr, CMD_ECHO, b"ok".to_vec()).await.expect("call");
        assert_eq!(resp.body, b"ok");
        client.stop().await;
        server.stop().await;
    });
}

/// A handler that never returns keeps its worker token, even after the caller and the
/// connection are gone
#[logfn]
#[rstest]
fn test_hung_handler_holds_token(runner: TestRunner) {
    runner.block_on(async move {
        let config = ServerConfig { max_workers: 2, ..Default::default() };
        let (mut server, addr) = init_server::<Simple>(config, "127.0.0.1:0").expect("listen");
        let client = TcpClient::<Simple>::new(ClientConfig::default());
        let hang = sleep_body(3600 * 1000, b"");
        let r = client.call_timeout(&addr, CMD_SLEEP, hang, Duration::from_millis(100), 0).await;
        assert_eq!(r.unwrap_err(), RpcErr::Timeout);
        assert_eq!(server.busy_workers(), 1);
        // one token left for everybody else
        let resp = client.call(&addr, CMD_ECHO, b"x".to_vec()).await.expect("call");
        assert_eq!(resp.err_code, code::OK);
        client.stop().await;
        assert!(wait_until(|| server.alive_conns() == 0, Duration::from_secs(5)).await);
        assert!(wait_until(|| server.busy_workers() == 1, Duration::from_secs(2)).await);
        server.stop().await;
    });
}

async fn raw_conn(addr: &str) -> <TcpTransport as Transport>::Conn {
    TcpTransport::connect(addr, &SocketOptions::default()).await.expect("connect")
}

fn guarded_frame(pkt: &Packet) -> Vec<u8> {
    let mut frame = vec![0u8; Guarded::HEAD_LEN];
    Guarded::encode_head(pkt, &mut frame);
    frame.extend_from_slice(&pkt.body);
    frame
}

#[logfn]
#[rstest]
fn test_guarded_checksum_tamper(runner: TestRunner) {
    runner.block_on(async move {
        let (mut server, addr) =
            init_server::<Guarded>(ServerConfig::default(), "127.0.0.1:0").expect("listen");
        let mut pkt = Packet::new(CMD_ECHO, b"guarded body".to_vec());
        pkt.seq = 42;

        // an intact frame is answered
        let (r1, mut w1) = raw_conn(&addr).await.into_split();
        w1.write_all(&guarded_frame(&pkt)).await.expect("write");
        let mut reader = Guarded::new_reader(r1, 4096);
        let resp = reader.read_packet().await.expect("resp");
        assert_eq!(resp.seq, 42);
        assert_eq!(resp.body, pkt.body);

        // one flipped body byte closes the connection without a response
        let (mut r, mut w) = raw_conn(&addr).await.into_split();
        let mut frame = guarded_frame(&pkt);
        let last = frame.len() - 1;
        frame[last] ^= 0x20;
        w.write_all(&frame).await.expect("write");
        let mut buf = [0u8; 64];
        match r.read(&mut buf).await {
            Ok(n) => assert_eq!(n, 0),
            Err(e) => debug!("read after tamper: {}", e),
        }
        assert!(wait_until(|| server.alive_conns() == 1, Duration::from_secs(5)).await);
        drop(reader);
        drop(w1);
        assert!(wait_until(|| server.alive_conns() == 0, Duration::from_secs(5)).await);
        server.stop().await;
    });
}
