use std::time::Duration;
use wirerpc::error::code;
use wirerpc::*;

/// Replies with the request body
pub const CMD_ECHO: u32 = 1;
/// Sleeps for the milliseconds in the first 8 bytes of the body, then echoes
pub const CMD_SLEEP: u32 = 2;
/// Panics on a non-empty body
pub const CMD_PANIC: u32 = 3;

/// Port 0 for tcp, a socket file named after the test otherwise
pub fn bind_addr(is_tcp: bool, name: &str) -> String {
    if is_tcp { "127.0.0.1:0".to_string() } else { format!("/tmp/wirerpc-test-{}.sock", name) }
}

pub fn sleep_body(ms: u64, tag: &[u8]) -> Vec<u8> {
    let mut body = ms.to_be_bytes().to_vec();
    body.extend_from_slice(tag);
    body
}

pub fn sleep_ms(body: &[u8]) -> u64 {
    match body.get(..8) {
        Some(b) => {
            let mut ms = [0u8; 8];
            ms.copy_from_slice(b);
            u64::from_be_bytes(ms)
        }
        None => 0,
    }
}

pub fn register_basic<W: WireFormat>(server: &mut TcpServer<W>) {
    server.register(CMD_ECHO, |body: Vec<u8>| async move { (code::OK, body) });
    server.register(CMD_SLEEP, |body: Vec<u8>| async move {
        tokio::time::sleep(Duration::from_millis(sleep_ms(&body))).await;
        (code::OK, body)
    });
    server.register(CMD_PANIC, |body: Vec<u8>| async move {
        if !body.is_empty() {
            panic!("panic on purpose with {} bytes", body.len());
        }
        (code::OK, body)
    });
}

/// Start a server with the basic handlers, return it with its actual address
pub fn init_server<W: WireFormat>(
    config: ServerConfig, addr: &str,
) -> std::io::Result<(TcpServer<W>, String)> {
    let mut server = TcpServer::<W>::new(config);
    register_basic(&mut server);
    server.add_filter(AccessLogFilter::new(server.get_logger().clone()));
    let local_addr = server.start(addr)?;
    Ok((server, local_addr))
}

/// Poll `f` until it holds or `timeout` passes
pub async fn wait_until<F: Fn() -> bool>(f: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if f() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    f()
}
