use std::time::Duration;

pub const DEFAULT_MAX_WORKERS: usize = 8 * 1024;
pub const DEFAULT_PENDING: usize = 32 * 1024;
pub const DEFAULT_BUF_SIZE: usize = 64 * 1024;
pub const DEFAULT_FLUSH_DELAY: Duration = Duration::from_millis(5);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_DIAL_RETRIES: usize = 3;

/// Options applied to every dialed or accepted socket.
#[derive(Clone, Debug)]
pub struct SocketOptions {
    /// connect timeout
    pub connect_timeout: Duration,
    /// TCP keep-alive idle time, None to leave the OS default
    pub keepalive: Option<Duration>,
    /// Set TCP_NODELAY
    pub nodelay: bool,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            keepalive: Some(Duration::from_secs(30)),
            nodelay: true,
        }
    }
}

impl SocketOptions {
    fn normalize(&mut self) {
        if self.connect_timeout.is_zero() {
            self.connect_timeout = Duration::from_secs(10);
        }
    }
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Max handlers running at the same time, across all connections
    pub max_workers: usize,
    /// Responses buffered per connection before the handler blocks on the writer
    pub pending_responses: usize,
    pub read_buf_size: usize,
    pub write_buf_size: usize,
    /// Max time a response waits in the write buffer. Zero means flush after every response.
    pub flush_delay: Duration,
    /// Sleep after an accept error
    pub accept_backoff: Duration,
    pub socket: SocketOptions,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            pending_responses: DEFAULT_PENDING,
            read_buf_size: DEFAULT_BUF_SIZE,
            write_buf_size: DEFAULT_BUF_SIZE,
            flush_delay: DEFAULT_FLUSH_DELAY,
            accept_backoff: Duration::from_secs(1),
            socket: SocketOptions::default(),
        }
    }
}

impl ServerConfig {
    /// Replace the unset (zero) fields with defaults
    pub fn normalize(&mut self) {
        if self.max_workers == 0 {
            self.max_workers = DEFAULT_MAX_WORKERS;
        }
        if self.pending_responses == 0 {
            self.pending_responses = DEFAULT_PENDING;
        }
        if self.read_buf_size == 0 {
            self.read_buf_size = DEFAULT_BUF_SIZE;
        }
        if self.write_buf_size == 0 {
            self.write_buf_size = DEFAULT_BUF_SIZE;
        }
        if self.accept_backoff.is_zero() {
            self.accept_backoff = Duration::from_secs(1);
        }
        self.socket.normalize();
    }
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Connections opened to every address, all of them drain the same request queue
    pub conns: usize,
    /// Capacity of the request queue of an address.
    ///
    /// The pending table of a connection is allowed up to 3 times of it.
    pub pending_requests: usize,
    /// Deadline of `call()`
    pub request_timeout: Duration,
    /// Extra attempts of `call()` after a timeout
    pub retries: usize,
    /// Connect attempts before the queued calls are failed as unreachable
    pub dial_retries: usize,
    /// Max time a request waits in the write buffer. Zero means flush after every request.
    pub flush_delay: Duration,
    pub read_buf_size: usize,
    pub write_buf_size: usize,
    pub socket: SocketOptions,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            conns: 1,
            pending_requests: DEFAULT_PENDING,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            retries: 0,
            dial_retries: DEFAULT_DIAL_RETRIES,
            flush_delay: DEFAULT_FLUSH_DELAY,
            read_buf_size: DEFAULT_BUF_SIZE,
            write_buf_size: DEFAULT_BUF_SIZE,
            socket: SocketOptions::default(),
        }
    }
}

impl ClientConfig {
    /// Replace the unset (zero) fields with defaults
    pub fn normalize(&mut self) {
        if self.conns == 0 {
            self.conns = 1;
        }
        if self.pending_requests == 0 {
            self.pending_requests = DEFAULT_PENDING;
        }
        if self.request_timeout.is_zero() {
            self.request_timeout = DEFAULT_REQUEST_TIMEOUT;
        }
        if self.dial_retries == 0 {
            self.dial_retries = DEFAULT_DIAL_RETRIES;
        }
        if self.read_buf_size == 0 {
            self.read_buf_size = DEFAULT_BUF_SIZE;
        }
        if self.write_buf_size == 0 {
            self.write_buf_size = DEFAULT_BUF_SIZE;
        }
        self.socket.normalize();
    }
}
