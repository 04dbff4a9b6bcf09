//! In-memory gateway for dispatcher tests.
//!
//! Each accepted connection is one side of a `tokio::io::duplex` pipe with a
//! server task on the other side. The server parses notification frames,
//! records their identifiers per connection and can be told to reject or drop
//! a connection when a given identifier arrives.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};

use crate::error::{Error, Result};
use crate::push::connection::Connector;
use crate::push::frame::{ErrorResponse, ErrorStatus, NOTIFICATION_COMMAND, NOTIFICATION_HEADER_SIZE};

const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// What the server does when a given identifier arrives.
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    /// Send an error response with this status, then close.
    Reject(ErrorStatus),
    /// Send six bytes that are not an error response, then close.
    Garbage,
    /// Close without a word.
    Drop,
}

#[derive(Debug, Clone, Copy)]
struct Rule {
    identifier: u32,
    fault: Fault,
    /// Fire on every connection instead of once.
    persistent: bool,
    fired: bool,
}

#[derive(Debug, Default)]
struct ConnectionLog {
    identifiers: Vec<u32>,
    tokens: Vec<[u8; 32]>,
    closed: bool,
}

#[derive(Debug, Default)]
struct State {
    connections: Vec<ConnectionLog>,
    rules: Vec<Rule>,
    connect_attempts: u32,
    failing_connects: u32,
    always_fail: bool,
    stall: bool,
}

/// Simulated gateway implementing [`Connector`].
#[derive(Clone)]
pub struct MockGateway {
    state: Arc<Mutex<State>>,
    buffer_size: usize,
}

impl MockGateway {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    /// Use a small pipe so writes block until the server reads.
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Apply `fault` the first time `identifier` arrives.
    pub fn fault_once(self, identifier: u32, fault: Fault) -> Self {
        self.add_rule(identifier, fault, false)
    }

    /// Apply `fault` every time `identifier` arrives.
    pub fn fault_always(self, identifier: u32, fault: Fault) -> Self {
        self.add_rule(identifier, fault, true)
    }

    /// Refuse the next `count` connection attempts.
    pub fn fail_connects(self, count: u32) -> Self {
        self.lock().failing_connects = count;
        self
    }

    /// Refuse every connection attempt.
    pub fn always_fail(self) -> Self {
        self.lock().always_fail = true;
        self
    }

    /// Accept connections but never read from them.
    pub fn stall(self) -> Self {
        self.lock().stall = true;
        self
    }

    fn add_rule(self, identifier: u32, fault: Fault, persistent: bool) -> Self {
        self.lock().rules.push(Rule {
            identifier,
            fault,
            persistent,
            fired: false,
        });
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn connect_attempts(&self) -> u32 {
        self.lock().connect_attempts
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    /// Identifiers received on each accepted connection, in order.
    pub fn received(&self) -> Vec<Vec<u32>> {
        self.lock()
            .connections
            .iter()
            .map(|c| c.identifiers.clone())
            .collect()
    }

    /// All identifiers received, across connections.
    pub fn all_received(&self) -> Vec<u32> {
        self.received().into_iter().flatten().collect()
    }

    /// Device tokens received on connection `index`.
    pub fn tokens(&self, index: usize) -> Vec<[u8; 32]> {
        self.lock().connections[index].tokens.clone()
    }

    /// Wait until every accepted connection has been closed.
    pub async fn wait_all_closed(&self) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if self.lock().connections.iter().all(|c| c.closed) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("gateway connections were left open");
    }

    /// Fault to apply for `identifier` on the current connection, if any.
    fn take_fault(&self, identifier: u32) -> Option<Fault> {
        let mut state = self.lock();
        let rule = state
            .rules
            .iter_mut()
            .find(|r| r.identifier == identifier && (r.persistent || !r.fired))?;
        rule.fired = true;
        Some(rule.fault)
    }

    async fn serve(self, index: usize, mut stream: DuplexStream) {
        let stall = self.lock().stall;
        if stall {
            // Hold the stream without reading so the client's writes block.
            let _stream = stream;
            std::future::pending::<()>().await;
            return;
        }

        let mut header = [0u8; NOTIFICATION_HEADER_SIZE];
        loop {
            if stream.read_exact(&mut header).await.is_err() {
                break;
            }
            assert_eq!(header[0], NOTIFICATION_COMMAND);
            assert_eq!(u16::from_be_bytes([header[9], header[10]]), 32);
            let identifier = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
            let payload_len = u16::from_be_bytes([header[43], header[44]]) as usize;
            let mut payload = vec![0u8; payload_len];
            if stream.read_exact(&mut payload).await.is_err() {
                break;
            }

            {
                let mut state = self.lock();
                let log = &mut state.connections[index];
                log.identifiers.push(identifier);
                let mut token = [0u8; 32];
                token.copy_from_slice(&header[11..43]);
                log.tokens.push(token);
            }

            match self.take_fault(identifier) {
                Some(Fault::Reject(status)) => {
                    let response = ErrorResponse { status, identifier };
                    let _ = stream.write_all(&response.encode()).await;
                    let _ = stream.flush().await;
                    break;
                }
                Some(Fault::Garbage) => {
                    let _ = stream.write_all(&[0xde, 0xad, 0xbe, 0xef, 0, 1]).await;
                    let _ = stream.flush().await;
                    break;
                }
                Some(Fault::Drop) => break,
                None => {}
            }
        }

        self.lock().connections[index].closed = true;
    }
}

impl Connector for MockGateway {
    type Stream = DuplexStream;

    async fn connect(&self) -> Result<DuplexStream> {
        let index = {
            let mut state = self.lock();
            state.connect_attempts += 1;
            if state.always_fail {
                return Err(Error::Connection("connection refused".to_string()));
            }
            if state.failing_connects > 0 {
                state.failing_connects -= 1;
                return Err(Error::Connection("connection refused".to_string()));
            }
            state.connections.push(ConnectionLog::default());
            state.connections.len() - 1
        };

        let (client, server) = duplex(self.buffer_size);
        tokio::spawn(self.clone().serve(index, server));
        Ok(client)
    }

    fn endpoint(&self) -> String {
        "mock-gateway:2195".to_string()
    }
}
