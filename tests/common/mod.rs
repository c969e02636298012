//! A deterministic stand-in mechanism and an in-memory duplex transport.
//!
//! The stub mechanism speaks a two-token handshake (`HELLO|<initiator>|<flags>` answered by
//! `REPLY|<acceptor>|<flags>`) inside standard records and "protects" data by XOR with a fixed
//! key. An initiator can put a `PART` record in front of its hello, which the acceptor answers
//! with nothing and keeps reading. It counts every handle it hands out and takes back.

#![allow(dead_code)]

use gss_channel::framing::encode_record;
use gss_channel::{
    AcceptStep, Config, ContextFlags, CredentialPaths, CredentialUsage, InitStep, ProviderError,
    SecurityProvider, Session, Transport,
};
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

pub const PEER_CHAIN: &[u8] = include_bytes!("../testdata/chain/proxy-chain.der");
pub const EXAMPLE_CA: &str = "/C=CH/O=Example Grid/CN=Example Grid CA";

pub const CLIENT_DN: &str = "/C=CH/O=Example Grid/OU=Users/CN=Jane Doe";
pub const SERVER_DN: &str = "/C=CH/O=Example Grid/CN=host/se.example.org";

const HANDSHAKE: u8 = 0x16;
const APPLICATION_DATA: u8 = 0x17;
const KEY: u8 = 0x5a;
const DELEGATED_SUFFIX: &str = "/CN=delegated";

pub static ACTIVATIONS: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug, Default)]
pub struct Stats {
    pub contexts_created: AtomicUsize,
    pub contexts_released: AtomicUsize,
    pub credentials_acquired: AtomicUsize,
    pub credentials_released: AtomicUsize,
    pub wraps: AtomicUsize,
    pub unwraps: AtomicUsize,
    pub exports: AtomicUsize,
}

impl Stats {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    pub fn balanced(&self) -> bool {
        Self::get(&self.contexts_created) == Self::get(&self.contexts_released)
            && Self::get(&self.credentials_acquired) == Self::get(&self.credentials_released)
    }
}

#[derive(Debug, Clone)]
pub struct MockCredential {
    pub name: String,
    pub chain: Vec<u8>,
}

#[derive(Debug)]
pub struct MockContext {
    peer: Option<String>,
}

#[derive(Debug)]
pub struct MockProvider {
    identity: String,
    granted: ContextFlags,
    fail_acquire: bool,
    split_hello: bool,
    always_delegate: bool,
    unnamed_delegation: bool,
    contextless: bool,
    pub stats: Stats,
    pub last_target: Mutex<Option<String>>,
}

impl MockProvider {
    pub fn new(identity: &str) -> Self {
        Self {
            identity: identity.to_owned(),
            granted: ContextFlags::all(),
            fail_acquire: false,
            split_hello: false,
            always_delegate: false,
            unnamed_delegation: false,
            contextless: false,
            stats: Stats::default(),
            last_target: Mutex::new(None),
        }
    }

    /// Grants at most `flags`, whatever the initiator asks for.
    pub fn granting(mut self, flags: ContextFlags) -> Self {
        self.granted = flags;
        self
    }

    pub fn failing_acquire(mut self) -> Self {
        self.fail_acquire = true;
        self
    }

    /// As initiator, sends a `PART` record before the hello, costing the acceptor a round.
    pub fn splitting_hello(mut self) -> Self {
        self.split_hello = true;
        self
    }

    /// As acceptor, hands out a delegated credential even when delegation was not granted.
    pub fn always_delegating(mut self) -> Self {
        self.always_delegate = true;
        self
    }

    /// Delegated credentials cannot be named.
    pub fn unnamed_delegation(mut self) -> Self {
        self.unnamed_delegation = true;
        self
    }

    /// As initiator, completes the exchange without ever creating a context.
    pub fn contextless(mut self) -> Self {
        self.contextless = true;
        self
    }

    pub fn last_target(&self) -> Option<String> {
        self.last_target.lock().unwrap().clone()
    }

    fn credential(&self, name: String, chain: Vec<u8>) -> MockCredential {
        self.stats.credentials_acquired.fetch_add(1, Ordering::SeqCst);
        MockCredential { name, chain }
    }

    fn new_context(&self, slot: &mut Option<MockContext>) {
        if slot.is_none() {
            self.stats.contexts_created.fetch_add(1, Ordering::SeqCst);
            *slot = Some(MockContext { peer: None });
        }
    }
}

fn body(token: &[u8]) -> Result<&str, ProviderError> {
    token
        .get(5..)
        .and_then(|body| std::str::from_utf8(body).ok())
        .ok_or_else(|| ProviderError::new("defective token"))
}

fn parse_message<'a>(token: &'a [u8], kind: &str) -> Result<(&'a str, ContextFlags), ProviderError> {
    let mut parts = body(token)?.split('|');
    if parts.next() != Some(kind) {
        return Err(ProviderError::new("defective token").with_detail(format!("expected {kind}")));
    }
    let name = parts.next().ok_or_else(|| ProviderError::new("missing name"))?;
    let flags = parts
        .next()
        .and_then(|bits| bits.parse().ok())
        .map(ContextFlags::from_bits_retain)
        .ok_or_else(|| ProviderError::new("missing flags"))?;
    Ok((name, flags))
}

fn record(content_type: u8, body: &[u8]) -> Result<Vec<u8>, ProviderError> {
    encode_record(content_type, body).map_err(|e| ProviderError::new(e.to_string()))
}

fn xor(data: &[u8]) -> Vec<u8> {
    data.iter().map(|b| b ^ KEY).collect()
}

impl SecurityProvider for MockProvider {
    type Credential = MockCredential;
    type Context = MockContext;
    type Name = String;

    fn activate(&self) -> Result<(), ProviderError> {
        ACTIVATIONS.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn acquire_credential(
        &self,
        _usage: CredentialUsage,
        paths: Option<&CredentialPaths>,
    ) -> Result<MockCredential, ProviderError> {
        if self.fail_acquire {
            return Err(ProviderError::new("no credentials found")
                .with_detail("proxy file does not exist"));
        }
        let name = match paths {
            Some(paths) => paths.certificate().display().to_string(),
            None => self.identity.clone(),
        };
        Ok(self.credential(name, PEER_CHAIN.to_vec()))
    }

    fn import_credential(&self, token: &[u8]) -> Result<MockCredential, ProviderError> {
        let name = std::str::from_utf8(token)
            .ok()
            .and_then(|token| token.strip_prefix("EXPORTED:"))
            .ok_or_else(|| ProviderError::new("invalid credential token"))?;
        Ok(self.credential(name.to_owned(), PEER_CHAIN.to_vec()))
    }

    fn export_credential(&self, credential: &MockCredential) -> Result<Vec<u8>, ProviderError> {
        self.stats.exports.fetch_add(1, Ordering::SeqCst);
        Ok(format!("EXPORTED:{}", credential.name).into_bytes())
    }

    fn credential_name(&self, credential: &MockCredential) -> Result<String, ProviderError> {
        if self.unnamed_delegation && credential.name.ends_with(DELEGATED_SUFFIX) {
            return Err(ProviderError::new("cannot inquire credential"));
        }
        Ok(credential.name.clone())
    }

    fn host_based_name(&self, service: &str) -> Result<String, ProviderError> {
        Ok(service.to_owned())
    }

    fn init_context(
        &self,
        credential: &MockCredential,
        context: &mut Option<MockContext>,
        target: &String,
        flags: ContextFlags,
        input: Option<&[u8]>,
    ) -> Result<InitStep, ProviderError> {
        match input {
            None => {
                if !self.contextless {
                    self.new_context(context);
                }
                *self.last_target.lock().unwrap() = Some(target.clone());
                let hello = format!("HELLO|{}|{}", credential.name, flags.bits());
                let mut output = Vec::new();
                if self.split_hello {
                    output.extend(record(HANDSHAKE, b"PART")?);
                }
                output.extend(record(HANDSHAKE, hello.as_bytes())?);
                Ok(InitStep {
                    output,
                    continue_needed: true,
                    flags: ContextFlags::empty(),
                })
            }
            Some(token) => {
                let (server, granted) = parse_message(token, "REPLY")?;
                if self.contextless {
                    return Ok(InitStep {
                        output: Vec::new(),
                        continue_needed: false,
                        flags: granted,
                    });
                }
                let context = context
                    .as_mut()
                    .ok_or_else(|| ProviderError::new("no context"))?;
                context.peer = Some(server.to_owned());
                Ok(InitStep {
                    output: Vec::new(),
                    continue_needed: false,
                    flags: granted,
                })
            }
        }
    }

    fn accept_context(
        &self,
        credential: &MockCredential,
        context: &mut Option<MockContext>,
        input: &[u8],
    ) -> Result<AcceptStep<MockCredential, String>, ProviderError> {
        if body(input)? == "PART" {
            self.new_context(context);
            return Ok(AcceptStep {
                output: Vec::new(),
                continue_needed: true,
                flags: ContextFlags::empty(),
                peer: None,
                delegated: None,
            });
        }
        let (client, requested) = parse_message(input, "HELLO")?;
        self.new_context(context);
        if let Some(context) = context.as_mut() {
            context.peer = Some(client.to_owned());
        }

        let granted = requested & self.granted;
        let reply = format!("REPLY|{}|{}", credential.name, granted.bits());
        let delegated = (self.always_delegate || granted.contains(ContextFlags::DELEGATION))
            .then(|| self.credential(format!("{client}{DELEGATED_SUFFIX}"), Vec::new()));

        Ok(AcceptStep {
            output: record(HANDSHAKE, reply.as_bytes())?,
            continue_needed: false,
            flags: granted,
            peer: Some(client.to_owned()),
            delegated,
        })
    }

    fn target_name(&self, context: &MockContext) -> Result<String, ProviderError> {
        context
            .peer
            .clone()
            .ok_or_else(|| ProviderError::new("context is not complete"))
    }

    fn wrap(
        &self,
        _context: &mut MockContext,
        _confidential: bool,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, ProviderError> {
        self.stats.wraps.fetch_add(1, Ordering::SeqCst);
        record(APPLICATION_DATA, &xor(plaintext))
    }

    fn unwrap(&self, _context: &mut MockContext, record: &[u8]) -> Result<Vec<u8>, ProviderError> {
        self.stats.unwraps.fetch_add(1, Ordering::SeqCst);
        match record.split_first() {
            Some((&APPLICATION_DATA, rest)) if rest.len() >= 4 => Ok(xor(&rest[4..])),
            _ => Err(ProviderError::new("bad record mac")),
        }
    }

    fn display_name(&self, name: &String) -> Result<String, ProviderError> {
        Ok(name.clone())
    }

    fn compare_names(&self, a: &String, b: &String) -> Result<bool, ProviderError> {
        Ok(a == b)
    }

    fn peer_credential(
        &self,
        context: &MockContext,
    ) -> Result<Option<MockCredential>, ProviderError> {
        Ok(context
            .peer
            .clone()
            .map(|peer| self.credential(peer, PEER_CHAIN.to_vec())))
    }

    fn certificate_chain(&self, credential: &MockCredential) -> Result<Vec<u8>, ProviderError> {
        Ok(credential.chain.clone())
    }

    fn delete_context(&self, context: MockContext) -> Result<Vec<u8>, ProviderError> {
        self.release_context(context);
        Ok(b"DELETE".to_vec())
    }

    fn release_context(&self, _context: MockContext) {
        self.stats.contexts_released.fetch_add(1, Ordering::SeqCst);
    }

    fn release_credential(&self, _credential: MockCredential) {
        self.stats.credentials_released.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
struct PipeState {
    data: VecDeque<u8>,
    closed: bool,
}

#[derive(Debug, Default)]
struct Pipe {
    state: Mutex<PipeState>,
    ready: Condvar,
}

impl Pipe {
    fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.ready.notify_all();
    }
}

/// One end of a blocking in-memory connection.
#[derive(Debug)]
pub struct MemoryTransport {
    incoming: Arc<Pipe>,
    outgoing: Arc<Pipe>,
    max_chunk: usize,
    peer: SocketAddr,
    pub fail_sends: Arc<AtomicBool>,
    pub send_calls: Arc<AtomicUsize>,
    pub opened: Arc<AtomicBool>,
}

impl MemoryTransport {
    pub fn pair() -> (MemoryTransport, MemoryTransport) {
        let a = Arc::new(Pipe::default());
        let b = Arc::new(Pipe::default());
        (
            Self::end(Arc::clone(&a), Arc::clone(&b), "127.0.0.1:8443"),
            Self::end(b, a, "127.0.0.1:50000"),
        )
    }

    /// A transport whose peer never sends anything and has already hung up.
    pub fn hung_up() -> MemoryTransport {
        let (transport, mut peer) = Self::pair();
        peer.close().unwrap();
        transport
    }

    fn end(incoming: Arc<Pipe>, outgoing: Arc<Pipe>, peer: &str) -> Self {
        Self {
            incoming,
            outgoing,
            max_chunk: usize::MAX,
            peer: peer.parse().unwrap(),
            fail_sends: Arc::new(AtomicBool::new(false)),
            send_calls: Arc::new(AtomicUsize::new(0)),
            opened: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Delivers at most `max_chunk` bytes per read.
    pub fn chunked(mut self, max_chunk: usize) -> Self {
        self.max_chunk = max_chunk;
        self
    }

    /// Queues raw bytes for the peer, bypassing any session.
    pub fn inject(&self, bytes: &[u8]) {
        self.outgoing.state.lock().unwrap().data.extend(bytes);
        self.outgoing.ready.notify_all();
    }
}

impl Transport for MemoryTransport {
    fn open(&mut self, _endpoint: &str, _host: &str, _port: u16) -> io::Result<()> {
        self.opened.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "simulated failure"));
        }
        let mut state = self.outgoing.state.lock().unwrap();
        if state.closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        state.data.extend(buf);
        self.outgoing.ready.notify_all();
        Ok(buf.len())
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.incoming.state.lock().unwrap();
        while state.data.is_empty() && !state.closed {
            state = self.incoming.ready.wait(state).unwrap();
        }
        let n = buf.len().min(self.max_chunk).min(state.data.len());
        for (slot, byte) in buf.iter_mut().zip(state.data.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn close(&mut self) -> io::Result<()> {
        self.outgoing.close();
        self.incoming.close();
        Ok(())
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.peer)
    }
}

pub type MockSession = Session<MockProvider, MemoryTransport>;

/// Runs a server session until its first `recv` returns, handing back the session and the data.
pub fn serve_once(
    provider: Arc<MockProvider>,
    transport: MemoryTransport,
    config: Config,
) -> JoinHandle<(MockSession, gss_channel::Result<Vec<u8>>)> {
    thread::spawn(move || {
        let mut session = Session::new(provider, transport, config).unwrap();
        let mut buf = [0u8; 1024];
        let result = session.recv(&mut buf).map(|n| buf[..n].to_vec());
        (session, result)
    })
}
