//! `Clerk`: the synchronous client used by `kvctl` and by anything embedding this store.
//!
//! Grounded on `kvraft1/client.go`: on a network error, sleep 100ms and try the next server;
//! on `WrongLeader`, sleep 2ms and try the next server; a `Version` mismatch is reported to the
//! caller as-is on the first attempt, but once we've already had to retry at least once, it's
//! reclassified as `Maybe` — we cannot tell whether that retry's own `Put` already landed.

use super::server::{ClientErr, KvRequest, KvResponse};
use super::KvOp;
use crate::net;
use std::net::{SocketAddr, TcpStream};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClerkError {
    NoKey,
    VersionMismatch,
    /// The last `Put` may or may not have committed; retrying it is unsafe without a
    /// higher-level idempotency key.
    Maybe,
}

enum Outcome {
    WrongLeader,
    NetworkError,
}

pub struct Clerk {
    servers: Vec<SocketAddr>,
    leader_hint: Mutex<usize>,
}

impl Clerk {
    pub fn new(servers: Vec<SocketAddr>) -> Self {
        assert!(!servers.is_empty(), "a clerk needs at least one server address");
        Self {
            servers,
            leader_hint: Mutex::new(0),
        }
    }

    pub fn get(&self, key: &str) -> Result<(String, u64), ClerkError> {
        let op = KvOp::Get { key: key.to_string() };
        loop {
            match self.try_once(&op) {
                Ok(KvResponse::Get { value, version, err }) => match err {
                    ClientErr::Ok => return Ok((value, version)),
                    ClientErr::NoKey => return Err(ClerkError::NoKey),
                    ClientErr::WrongLeader => self.backoff(Outcome::WrongLeader),
                    ClientErr::Version => unreachable!("a Get never yields Version"),
                },
                Ok(KvResponse::Put { .. }) => unreachable!("server answered Get with a Put response"),
                Err(outcome) => self.backoff(outcome),
            }
        }
    }

    pub fn put(&self, key: &str, value: &str, version: u64) -> Result<(), ClerkError> {
        let op = KvOp::Put {
            key: key.to_string(),
            value: value.to_string(),
            version,
        };
        let mut retries = 0u32;
        loop {
            match self.try_once(&op) {
                Ok(KvResponse::Put { err }) => match err {
                    ClientErr::Ok => return Ok(()),
                    ClientErr::NoKey => return Err(ClerkError::NoKey),
                    ClientErr::Version => {
                        return Err(if retries > 0 {
                            ClerkError::Maybe
                        } else {
                            ClerkError::VersionMismatch
                        });
                    }
                    ClientErr::WrongLeader => self.backoff(Outcome::WrongLeader),
                },
                Ok(KvResponse::Get { .. }) => unreachable!("server answered Put with a Get response"),
                Err(outcome) => {
                    retries += 1;
                    self.backoff(outcome);
                }
            }
        }
    }

    fn backoff(&self, outcome: Outcome) {
        match outcome {
            Outcome::WrongLeader => {
                self.advance_leader();
                std::thread::sleep(Duration::from_millis(2));
            }
            Outcome::NetworkError => {
                std::thread::sleep(Duration::from_millis(100));
                self.advance_leader();
            }
        }
    }

    fn try_once(&self, op: &KvOp) -> Result<KvResponse, Outcome> {
        let addr = self.servers[*self.leader_hint.lock().unwrap()];
        let mut stream = TcpStream::connect(addr).map_err(|_| Outcome::NetworkError)?;
        stream.set_nodelay(true).ok();
        net::sync::write_frame(&mut stream, &KvRequest { op: op.clone() })
            .map_err(|_| Outcome::NetworkError)?;
        net::sync::read_frame(&mut stream).map_err(|_| Outcome::NetworkError)
    }

    fn advance_leader(&self) {
        let mut hint = self.leader_hint.lock().unwrap();
        *hint = (*hint + 1) % self.servers.len();
    }
}
