//! Scripted transport for exercising the delivery engine without a network.
//!
//! Every transport created by a [`MockTransportFactory`] shares one script of
//! send replies and one set of counters, so tests can assert on attempts,
//! connections and concurrency across the whole pool.
//!
//! ```rust,no_run
//! let factory = MockTransportFactory::builder()
//!     .with_replies([Reply::Reject(451, "4.3.0 Try again later"), Reply::Accept])
//!     .build();
//! let sender = EmailSender::with_transport(options, factory.clone())?;
//! ```

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use courier_smtp::{
    Credentials, Endpoint, Transport, TransportFactory,
    client::{ClientError, Mail, Result},
};
use parking_lot::Mutex;
use tokio::sync::Semaphore;

/// How the mock answers one send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Accept,
    Reject(u16, &'static str),
    /// The connection drops mid-transaction.
    Drop,
    Disposed,
}

#[derive(Debug)]
struct Shared {
    replies: Mutex<VecDeque<Reply>>,
    default_reply: Reply,
    send_delay: Duration,
    gate: Option<Arc<Semaphore>>,
    connect_fails: bool,
    noop_fails: bool,

    created: AtomicUsize,
    connects: AtomicUsize,
    authentications: AtomicUsize,
    noops: AtomicUsize,
    attempts: AtomicUsize,
    closed: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    delivered: Mutex<Vec<Vec<String>>>,
}

#[derive(Debug)]
pub struct MockTransportBuilder {
    replies: VecDeque<Reply>,
    default_reply: Reply,
    send_delay: Duration,
    gated: bool,
    connect_fails: bool,
    noop_fails: bool,
}

impl MockTransportBuilder {
    /// Replies used in order, one per send, before falling back to the
    /// default reply.
    #[must_use]
    pub fn with_replies(mut self, replies: impl IntoIterator<Item = Reply>) -> Self {
        self.replies.extend(replies);
        self
    }

    #[must_use]
    pub const fn with_default_reply(mut self, reply: Reply) -> Self {
        self.default_reply = reply;
        self
    }

    #[must_use]
    pub const fn with_send_delay(mut self, delay: Duration) -> Self {
        self.send_delay = delay;
        self
    }

    /// Sends block until [`MockTransportFactory::open_gate`] lets them through.
    #[must_use]
    pub const fn gated(mut self) -> Self {
        self.gated = true;
        self
    }

    #[must_use]
    pub const fn with_failing_connect(mut self) -> Self {
        self.connect_fails = true;
        self
    }

    #[must_use]
    pub const fn with_failing_noop(mut self) -> Self {
        self.noop_fails = true;
        self
    }

    #[must_use]
    pub fn build(self) -> Arc<MockTransportFactory> {
        Arc::new(MockTransportFactory {
            shared: Arc::new(Shared {
                replies: Mutex::new(self.replies),
                default_reply: self.default_reply,
                send_delay: self.send_delay,
                gate: self.gated.then(|| Arc::new(Semaphore::new(0))),
                connect_fails: self.connect_fails,
                noop_fails: self.noop_fails,
                created: AtomicUsize::new(0),
                connects: AtomicUsize::new(0),
                authentications: AtomicUsize::new(0),
                noops: AtomicUsize::new(0),
                attempts: AtomicUsize::new(0),
                closed: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                delivered: Mutex::new(Vec::new()),
            }),
        })
    }
}

#[derive(Debug)]
pub struct MockTransportFactory {
    shared: Arc<Shared>,
}

impl MockTransportFactory {
    #[must_use]
    pub fn builder() -> MockTransportBuilder {
        MockTransportBuilder {
            replies: VecDeque::new(),
            default_reply: Reply::Accept,
            send_delay: Duration::ZERO,
            gated: false,
            connect_fails: false,
            noop_fails: false,
        }
    }

    /// Lets `sends` blocked or future sends through a gated transport.
    pub fn open_gate(&self, sends: usize) {
        if let Some(gate) = &self.shared.gate {
            gate.add_permits(sends);
        }
    }

    pub fn created(&self) -> usize {
        self.shared.created.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    pub fn authentications(&self) -> usize {
        self.shared.authentications.load(Ordering::SeqCst)
    }

    pub fn noops(&self) -> usize {
        self.shared.noops.load(Ordering::SeqCst)
    }

    /// Send calls made on a connected transport.
    pub fn attempts(&self) -> usize {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.shared.max_in_flight.load(Ordering::SeqCst)
    }

    /// Recipients of every accepted mail, in delivery order.
    pub fn delivered(&self) -> Vec<Vec<String>> {
        self.shared.delivered.lock().clone()
    }

    /// Polls until `sends` sends are in progress.
    pub async fn wait_for_in_flight(&self, sends: usize) {
        while self.in_flight() < sends {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

impl TransportFactory for MockTransportFactory {
    fn create(&self) -> Box<dyn Transport> {
        self.shared.created.fetch_add(1, Ordering::SeqCst);
        Box::new(MockTransport {
            shared: Arc::clone(&self.shared),
            connected: false,
            authenticated: false,
            disposed: false,
        })
    }
}

struct MockTransport {
    shared: Arc<Shared>,
    connected: bool,
    authenticated: bool,
    disposed: bool,
}

/// Counts a send as in flight until dropped, cancellation included.
struct InFlight<'a>(&'a Shared);

impl<'a> InFlight<'a> {
    fn enter(shared: &'a Shared) -> Self {
        let now = shared.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        shared.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(shared)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn is_connected(&self) -> bool {
        !self.disposed && self.connected
    }

    fn is_authenticated(&self) -> bool {
        self.is_connected() && self.authenticated
    }

    async fn connect(&mut self, _: &Endpoint) -> Result<()> {
        if self.disposed {
            return Err(ClientError::Disposed);
        }
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        self.authenticated = false;

        if self.shared.connect_fails {
            self.connected = false;
            return Err(ClientError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            )));
        }

        self.connected = true;
        Ok(())
    }

    async fn authenticate(&mut self, _: &Credentials) -> Result<()> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        self.shared.authentications.fetch_add(1, Ordering::SeqCst);
        self.authenticated = true;
        Ok(())
    }

    async fn noop(&mut self) -> Result<()> {
        if self.disposed {
            return Err(ClientError::Disposed);
        }
        self.shared.noops.fetch_add(1, Ordering::SeqCst);

        if self.shared.noop_fails {
            self.connected = false;
            return Err(ClientError::ConnectionClosed);
        }
        Ok(())
    }

    async fn send(&mut self, mail: &Mail) -> Result<()> {
        if self.disposed {
            return Err(ClientError::Disposed);
        }
        if !self.is_authenticated() {
            return Err(ClientError::NotAuthenticated);
        }

        let shared = Arc::clone(&self.shared);
        shared.attempts.fetch_add(1, Ordering::SeqCst);
        let _in_flight = InFlight::enter(&shared);

        if let Some(gate) = &shared.gate
            && let Ok(permit) = gate.acquire().await
        {
            permit.forget();
        }
        if !shared.send_delay.is_zero() {
            tokio::time::sleep(shared.send_delay).await;
        }

        let reply = shared
            .replies
            .lock()
            .pop_front()
            .unwrap_or(shared.default_reply);

        match reply {
            Reply::Accept => {
                shared
                    .delivered
                    .lock()
                    .push(mail.recipients.iter().map(ToString::to_string).collect());
                Ok(())
            }
            Reply::Reject(code, message) => Err(ClientError::SmtpError {
                code,
                message: message.to_string(),
            }),
            Reply::Drop => {
                self.connected = false;
                self.authenticated = false;
                Err(ClientError::ConnectionClosed)
            }
            Reply::Disposed => {
                self.disposed = true;
                Err(ClientError::Disposed)
            }
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.connected = false;
        self.authenticated = false;
        Ok(())
    }

    fn abort(&mut self) {
        self.connected = false;
        self.authenticated = false;
    }

    async fn close(&mut self) {
        self.connected = false;
        self.authenticated = false;
        self.disposed = true;
        self.shared.closed.fetch_add(1, Ordering::SeqCst);
    }
}
