//! In-process message fabric
//!
//! Every rank owns a mailbox: a queue of envelopes behind a mutex, plus a
//! condvar that senders signal. Per-pair FIFO order follows from appending
//! under the lock; receives match on (source, tag) and leave everything else
//! queued, so a fast sender can run ahead without its messages being
//! consumed out of order. The lock is only held to scan or append, never
//! across a wait, so concurrent waits on one endpoint keep their own bounds.
//!
//! Leaving ranks post a `Closed` envelope to every peer. A receiver that finds
//! it (after any data the peer sent earlier) fails with `PeerDisconnected`
//! instead of waiting for the deadline.

use super::comm::{
    CancelToken, Communicator, Tag, BARRIER_ARRIVE_TAG, BARRIER_RELEASE_TAG, BROADCAST_TAG,
};
use crate::error::{ForgeResult, RingForgeError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Longest single wait before a cancelled receive notices
const CANCEL_POLL: Duration = Duration::from_millis(10);

#[derive(Debug)]
enum Envelope {
    Data {
        src: usize,
        tag: Tag,
        payload: Vec<f32>,
    },
    Closed {
        src: usize,
    },
}

impl Envelope {
    fn src(&self) -> usize {
        match self {
            Envelope::Data { src, .. } | Envelope::Closed { src } => *src,
        }
    }
}

#[derive(Debug, Default)]
struct MailboxState {
    queue: VecDeque<Envelope>,
    /// Owner has shut down; further posts are refused
    closed: bool,
}

#[derive(Debug, Default)]
struct Mailbox {
    state: Mutex<MailboxState>,
    arrived: Condvar,
}

/// Factory for a fully connected set of endpoints
pub struct LocalFabric;

impl LocalFabric {
    /// One endpoint per rank, indexed by rank
    pub fn create(world_size: usize) -> ForgeResult<Vec<LocalEndpoint>> {
        if world_size == 0 {
            return Err(RingForgeError::DistributedSetupFailed(
                "fabric needs at least one rank".to_string(),
            ));
        }

        let mailboxes: Vec<Arc<Mailbox>> = (0..world_size).map(|_| Arc::new(Mailbox::default())).collect();

        Ok((0..world_size)
            .map(|rank| LocalEndpoint {
                rank,
                world_size,
                mailboxes: mailboxes.clone(),
                shut_down: AtomicBool::new(false),
            })
            .collect())
    }
}

/// One rank's view of the fabric
pub struct LocalEndpoint {
    rank: usize,
    world_size: usize,
    mailboxes: Vec<Arc<Mailbox>>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for LocalEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalEndpoint")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .field("shut_down", &self.shut_down.load(Ordering::Acquire))
            .finish()
    }
}

impl LocalEndpoint {
    fn check_open(&self, op: &str) -> ForgeResult<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(RingForgeError::ProcessGroupNotInitialized(format!(
                "rank {} called {} after shutdown",
                self.rank, op
            )));
        }
        Ok(())
    }

    fn check_peer(&self, peer: usize) -> ForgeResult<()> {
        if peer >= self.world_size {
            return Err(RingForgeError::InvalidRank {
                rank: peer,
                world_size: self.world_size,
            });
        }
        Ok(())
    }

    fn disconnected(&self, op: &str, peer: usize) -> RingForgeError {
        RingForgeError::PeerDisconnected {
            op: op.to_string(),
            rank: self.rank,
            peer,
        }
    }

    /// Remove the first queued `tag` data from `src`; a close notice from
    /// `src` ahead of it is an error and stays queued for later receives
    fn take_match(&self, queue: &mut VecDeque<Envelope>, src: usize, tag: Tag, op: &str) -> ForgeResult<Option<Vec<f32>>> {
        let found = queue.iter().position(|env| match env {
            Envelope::Data { src: s, tag: t, .. } => *s == src && *t == tag,
            Envelope::Closed { src: s } => *s == src,
        });

        let Some(idx) = found else {
            return Ok(None);
        };
        if matches!(queue[idx], Envelope::Closed { .. }) {
            return Err(self.disconnected(op, src));
        }
        match queue.remove(idx) {
            Some(Envelope::Data { payload, .. }) => Ok(Some(payload)),
            _ => Err(RingForgeError::InternalError(
                "mailbox changed under lock".to_string(),
            )),
        }
    }

    fn recv_until(
        &self,
        src: usize,
        tag: Tag,
        deadline: Instant,
        timeout: Duration,
        cancel: Option<&CancelToken>,
        op: &str,
    ) -> ForgeResult<Vec<f32>> {
        let mailbox = &self.mailboxes[self.rank];
        let mut state = mailbox.state.lock()?;
        loop {
            if let Some(payload) = self.take_match(&mut state.queue, src, tag, op)? {
                return Ok(payload);
            }
            if cancel.is_some_and(CancelToken::is_cancelled) {
                return Err(RingForgeError::ExchangeCancelled {
                    op: op.to_string(),
                    rank: self.rank,
                });
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(self.timeout(op, timeout));
            }
            let wait = match cancel {
                Some(_) => (deadline - now).min(CANCEL_POLL),
                None => deadline - now,
            };
            let (guard, _) = mailbox.arrived.wait_timeout(state, wait)?;
            state = guard;
        }
    }

    fn timeout(&self, op: &str, waited: Duration) -> RingForgeError {
        RingForgeError::CollectiveTimeout {
            op: op.to_string(),
            rank: self.rank,
            waited,
        }
    }

    fn post(&self, dest: usize, env: Envelope, op: &str) -> ForgeResult<()> {
        let mailbox = &self.mailboxes[dest];
        {
            let mut state = mailbox.state.lock()?;
            if state.closed {
                return Err(self.disconnected(op, dest));
            }
            tracing::trace!(rank = self.rank, to = dest, from = env.src(), "fabric envelope");
            state.queue.push_back(env);
        }
        mailbox.arrived.notify_all();
        Ok(())
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

impl Communicator for LocalEndpoint {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn send(&self, dest: usize, tag: Tag, data: Vec<f32>) -> ForgeResult<()> {
        self.check_open("send")?;
        self.check_peer(dest)?;
        self.post(
            dest,
            Envelope::Data {
                src: self.rank,
                tag,
                payload: data,
            },
            "send",
        )
    }

    fn recv(&self, src: usize, tag: Tag, timeout: Duration) -> ForgeResult<Vec<f32>> {
        self.check_open("recv")?;
        self.check_peer(src)?;
        let op = format!("recv from rank {} (tag {})", src, tag);
        self.recv_until(src, tag, Instant::now() + timeout, timeout, None, &op)
    }

    fn recv_cancellable(
        &self,
        src: usize,
        tag: Tag,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> ForgeResult<Vec<f32>> {
        self.check_open("recv")?;
        self.check_peer(src)?;
        let op = format!("recv from rank {} (tag {})", src, tag);
        self.recv_until(src, tag, Instant::now() + timeout, timeout, Some(cancel), &op)
    }

    fn barrier(&self, timeout: Duration) -> ForgeResult<()> {
        self.check_open("barrier")?;
        let deadline = Instant::now() + timeout;

        if self.rank == 0 {
            for peer in 1..self.world_size {
                self.recv_until(peer, BARRIER_ARRIVE_TAG, deadline, timeout, None, "barrier")?;
            }
            for peer in 1..self.world_size {
                self.post(
                    peer,
                    Envelope::Data {
                        src: 0,
                        tag: BARRIER_RELEASE_TAG,
                        payload: Vec::new(),
                    },
                    "barrier",
                )?;
            }
        } else {
            self.post(
                0,
                Envelope::Data {
                    src: self.rank,
                    tag: BARRIER_ARRIVE_TAG,
                    payload: Vec::new(),
                },
                "barrier",
            )?;
            self.recv_until(0, BARRIER_RELEASE_TAG, deadline, timeout, None, "barrier")?;
        }
        Ok(())
    }

    fn broadcast(&self, data: &mut Vec<f32>, root: usize, timeout: Duration) -> ForgeResult<()> {
        self.check_open("broadcast")?;
        self.check_peer(root)?;

        if self.rank == root {
            for peer in (0..self.world_size).filter(|&p| p != root) {
                self.post(
                    peer,
                    Envelope::Data {
                        src: root,
                        tag: BROADCAST_TAG,
                        payload: data.clone(),
                    },
                    "broadcast",
                )?;
            }
        } else {
            let deadline = Instant::now() + timeout;
            *data = self.recv_until(root, BROADCAST_TAG, deadline, timeout, None, "broadcast")?;
        }
        Ok(())
    }

    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        match self.mailboxes[self.rank].state.lock() {
            Ok(mut state) => state.closed = true,
            Err(poisoned) => poisoned.into_inner().closed = true,
        }
        for peer in (0..self.world_size).filter(|&p| p != self.rank) {
            // peers that already left refuse the notice
            let _ = self.post(peer, Envelope::Closed { src: self.rank }, "shutdown");
        }
        tracing::debug!(rank = self.rank, "fabric endpoint shut down");
    }
}

impl Drop for LocalEndpoint {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const SHORT: Duration = Duration::from_millis(100);
    const LONG: Duration = Duration::from_secs(5);

    fn pair() -> (LocalEndpoint, LocalEndpoint) {
        let mut eps = LocalFabric::create(2).unwrap();
        let b = eps.pop().unwrap();
        let a = eps.pop().unwrap();
        (a, b)
    }

    #[test]
    fn test_send_recv_matches_tag() {
        let (a, b) = pair();
        a.send(1, 7, vec![7.0]).unwrap();
        a.send(1, 3, vec![3.0]).unwrap();

        assert_eq!(b.recv(0, 3, LONG).unwrap(), vec![3.0]);
        assert_eq!(b.recv(0, 7, LONG).unwrap(), vec![7.0]);
    }

    #[test]
    fn test_same_tag_is_fifo() {
        let (a, b) = pair();
        a.send(1, 1, vec![1.0]).unwrap();
        a.send(1, 1, vec![2.0]).unwrap();
        assert_eq!(b.recv(0, 1, LONG).unwrap(), vec![1.0]);
        assert_eq!(b.recv(0, 1, LONG).unwrap(), vec![2.0]);
    }

    #[test]
    fn test_recv_times_out() {
        let (_a, b) = pair();
        let start = Instant::now();
        let err = b.recv(0, 0, SHORT).unwrap_err();
        assert!(err.is_timeout());
        assert!(start.elapsed() >= SHORT);
        assert!(err.to_string().starts_with("[rank 1]"));
    }

    #[test]
    fn test_closed_peer_is_disconnect_not_timeout() {
        let (a, b) = pair();
        a.send(1, 0, vec![1.0]).unwrap();
        drop(a);

        // data sent before leaving is still delivered
        assert_eq!(b.recv(0, 0, LONG).unwrap(), vec![1.0]);
        let err = b.recv(0, 0, LONG).unwrap_err();
        assert!(matches!(err, RingForgeError::PeerDisconnected { peer: 0, .. }));
    }

    #[test]
    fn test_calls_after_shutdown_fail() {
        let (a, _b) = pair();
        a.shutdown();
        a.shutdown();
        assert!(a.is_shut_down());
        assert!(matches!(
            a.send(1, 0, vec![]).unwrap_err(),
            RingForgeError::ProcessGroupNotInitialized(_)
        ));
    }

    #[test]
    fn test_invalid_peer() {
        let (a, _b) = pair();
        assert!(matches!(
            a.send(2, 0, vec![]).unwrap_err(),
            RingForgeError::InvalidRank { rank: 2, world_size: 2 }
        ));
    }

    #[test]
    fn test_barrier_and_broadcast_across_threads() {
        let eps = LocalFabric::create(3).unwrap();
        let handles: Vec<_> = eps
            .into_iter()
            .map(|ep| {
                thread::spawn(move || {
                    let mut data = if ep.rank() == 1 {
                        vec![1.0, 2.0, 3.0]
                    } else {
                        Vec::new()
                    };
                    ep.broadcast(&mut data, 1, LONG).unwrap();
                    ep.barrier(LONG).unwrap();
                    ep.barrier(LONG).unwrap();
                    data
                })
            })
            .collect();

        for h in handles {
            assert_eq!(h.join().unwrap(), vec![1.0, 2.0, 3.0]);
        }
    }

    #[test]
    fn test_concurrent_waits_keep_their_own_bounds() {
        let (_a, b) = pair();
        let b = Arc::new(b);

        let long_wait = {
            let b = Arc::clone(&b);
            thread::spawn(move || b.recv(0, 1, Duration::from_secs(2)))
        };
        thread::sleep(Duration::from_millis(20));

        let start = Instant::now();
        let err = b.barrier(SHORT).unwrap_err();
        assert!(err.is_timeout());
        assert!(start.elapsed() < Duration::from_secs(1), "took {:?}", start.elapsed());
        assert!(long_wait.join().unwrap().unwrap_err().is_timeout());
    }

    #[test]
    fn test_cancelled_recv_stops_early_and_leaves_data() {
        let (a, b) = pair();
        let b = Arc::new(b);
        let token = CancelToken::new();

        let waiter = {
            let (b, token) = (Arc::clone(&b), token.clone());
            thread::spawn(move || {
                let start = Instant::now();
                (b.recv_cancellable(0, 5, LONG, &token), start.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(30));
        token.cancel();

        let (result, elapsed) = waiter.join().unwrap();
        assert!(matches!(result, Err(RingForgeError::ExchangeCancelled { rank: 1, .. })));
        assert!(elapsed < Duration::from_secs(1), "took {:?}", elapsed);

        // a later, uncancelled receive still gets the data
        a.send(1, 5, vec![5.0]).unwrap();
        assert_eq!(b.recv_cancellable(0, 5, LONG, &CancelToken::new()).unwrap(), vec![5.0]);
    }

    #[test]
    fn test_send_to_departed_peer_fails() {
        let (a, b) = pair();
        drop(b);
        assert!(matches!(
            a.send(1, 0, vec![1.0]).unwrap_err(),
            RingForgeError::PeerDisconnected { peer: 1, .. }
        ));
    }

    #[test]
    fn test_barrier_times_out_when_peer_absent() {
        let (a, _b) = pair();
        let err = a.barrier(SHORT).unwrap_err();
        assert!(err.is_timeout());
        assert!(err.to_string().contains("barrier"));
    }
}
