//! Session pool.
//!
//! The pool keeps up to `capacity` idle sessions. A miss creates a new
//! session rather than waiting (overflow-create), and a release into a full
//! inventory closes the session (overflow-discard), so the number of live
//! sessions may briefly exceed the capacity under load while the idle
//! inventory never does.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::DEFAULT_POOL_SIZE;
use crate::connector::ConnectionFactory;
use crate::errors::{SmtpError, SmtpResult};
use crate::session::Session;
use crate::types::PoolStatus;

/// Pool of authenticated sessions.
#[derive(Debug)]
pub struct SessionPool {
    factory: Arc<dyn ConnectionFactory>,
    capacity: usize,
    idle: Mutex<VecDeque<Session>>,
    closed: AtomicBool,
    outstanding: AtomicUsize,
    created: AtomicU64,
    discarded: AtomicU64,
}

impl SessionPool {
    /// Opens `size` sessions (the default when zero).
    ///
    /// Creation is all-or-nothing: if any session fails to open, the ones
    /// already opened are closed and the error is returned.
    pub async fn create(factory: Arc<dyn ConnectionFactory>, size: usize) -> SmtpResult<Self> {
        let capacity = if size == 0 { DEFAULT_POOL_SIZE } else { size };
        let mut sessions = VecDeque::with_capacity(capacity);

        for _ in 0..capacity {
            match factory.connect().await {
                Ok(session) => sessions.push_back(session),
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(opened = sessions.len(), capacity, error = %e, "Pool creation failed");
                    for session in sessions {
                        session.quit().await;
                    }
                    return Err(e);
                }
            }
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(capacity, "Session pool created");

        Ok(Self {
            factory,
            capacity,
            idle: Mutex::new(sessions),
            closed: AtomicBool::new(false),
            outstanding: AtomicUsize::new(0),
            created: AtomicU64::new(capacity as u64),
            discarded: AtomicU64::new(0),
        })
    }

    /// Returns the nominal capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns true once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Borrows a session, opening a new one if none is idle.
    ///
    /// Never waits for another caller to release.
    pub async fn acquire(&self) -> SmtpResult<Session> {
        if self.is_closed() {
            return Err(SmtpError::pool_closed());
        }

        let pooled = self.idle.lock().pop_front();
        let session = match pooled {
            Some(session) => session,
            None => {
                let session = self.factory.connect().await?;
                self.created.fetch_add(1, Ordering::Relaxed);

                #[cfg(feature = "tracing")]
                tracing::debug!(session = session.id(), "Overflow session created");

                // The pool may have been closed while connecting.
                if self.is_closed() {
                    session.quit().await;
                    return Err(SmtpError::pool_closed());
                }
                session
            }
        };

        self.outstanding.fetch_add(1, Ordering::AcqRel);
        Ok(session)
    }

    /// Returns a borrowed session.
    ///
    /// The session is closed instead of pooled if the pool is closed, the
    /// session is not reusable, or the inventory is already full.
    pub async fn release(&self, session: Session) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);

        let rejected = if !session.is_reusable() {
            Some(session)
        } else {
            let mut idle = self.idle.lock();
            // Checked under the lock so close() cannot miss this session.
            if self.is_closed() || idle.len() >= self.capacity {
                Some(session)
            } else {
                idle.push_back(session);
                None
            }
        };

        if let Some(session) = rejected {
            self.discarded.fetch_add(1, Ordering::Relaxed);

            #[cfg(feature = "tracing")]
            tracing::debug!(
                session = session.id(),
                health = ?session.health(),
                closed = self.is_closed(),
                "Discarding session on release"
            );

            session.quit().await;
        }
    }

    /// Accounts for a borrowed session that was dropped instead of released,
    /// as happens when a send is cancelled mid-transaction. Dropping the
    /// session has already closed its connection.
    pub fn abandon(&self) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        self.discarded.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "tracing")]
        tracing::debug!("Borrowed session abandoned");
    }

    /// Closes the pool and every idle session. Sessions still borrowed are
    /// closed when they are released.
    pub async fn close(&self) {
        let drained: Vec<Session> = {
            let mut idle = self.idle.lock();
            self.closed.store(true, Ordering::Release);
            idle.drain(..).collect()
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(idle = drained.len(), "Closing session pool");

        for session in drained {
            session.quit().await;
        }
    }

    /// Returns a snapshot of the pool state.
    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            capacity: self.capacity,
            idle: self.idle.lock().len(),
            outstanding: self.outstanding.load(Ordering::Acquire),
            created: self.created.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            closed: self.is_closed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SmtpErrorKind;
    use crate::mocks::MockConnectionFactory;
    use rstest::rstest;

    #[rstest]
    #[case(0, 10)]
    #[case(1, 1)]
    #[case(3, 3)]
    #[tokio::test]
    async fn test_create_opens_capacity(#[case] size: usize, #[case] expected: usize) {
        let factory = Arc::new(MockConnectionFactory::new());
        let pool = SessionPool::create(factory.clone(), size).await.unwrap();

        assert_eq!(pool.capacity(), expected);
        assert_eq!(pool.status().idle, expected);
        assert_eq!(factory.connect_count(), expected);
    }

    #[tokio::test]
    async fn test_create_is_all_or_nothing() {
        let factory = Arc::new(MockConnectionFactory::new().fail_after(2));
        let err = SessionPool::create(factory.clone(), 4).await.unwrap_err();

        assert_eq!(err.kind(), SmtpErrorKind::Connection(crate::errors::ConnectStage::Dial));
        assert_eq!(factory.journal().closed(), 2);
    }

    #[tokio::test]
    async fn test_overflow_create_and_discard() {
        let factory = Arc::new(MockConnectionFactory::new());
        let pool = SessionPool::create(factory.clone(), 2).await.unwrap();

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let c = pool.acquire().await.unwrap();
        assert_eq!(factory.connect_count(), 3);
        assert_eq!(pool.status().outstanding, 3);
        assert_eq!(pool.status().idle, 0);

        pool.release(a).await;
        pool.release(b).await;
        pool.release(c).await;

        let status = pool.status();
        assert_eq!(status.idle, 2);
        assert_eq!(status.outstanding, 0);
        assert_eq!(status.discarded, 1);
        assert_eq!(factory.journal().closed(), 1);
    }

    #[tokio::test]
    async fn test_reuses_idle_sessions() {
        let factory = Arc::new(MockConnectionFactory::new());
        let pool = SessionPool::create(factory.clone(), 1).await.unwrap();

        let session = pool.acquire().await.unwrap();
        let id = session.id();
        pool.release(session).await;

        let session = pool.acquire().await.unwrap();
        assert_eq!(session.id(), id);
        assert_eq!(factory.connect_count(), 1);
        pool.release(session).await;
    }

    #[tokio::test]
    async fn test_broken_session_discarded() {
        let factory = Arc::new(MockConnectionFactory::new());
        let pool = SessionPool::create(factory.clone(), 1).await.unwrap();

        let mut session = pool.acquire().await.unwrap();
        session.mark_broken();
        pool.release(session).await;

        assert_eq!(pool.status().idle, 0);
        assert_eq!(pool.status().discarded, 1);

        let fresh = pool.acquire().await.unwrap();
        assert_eq!(factory.connect_count(), 2);
        pool.release(fresh).await;
    }

    #[tokio::test]
    async fn test_close_drains_and_rejects() {
        let factory = Arc::new(MockConnectionFactory::new());
        let pool = SessionPool::create(factory.clone(), 3).await.unwrap();
        let borrowed = pool.acquire().await.unwrap();

        pool.close().await;
        assert_eq!(factory.journal().closed(), 2);
        assert!(pool.status().closed);

        let err = pool.acquire().await.unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::PoolClosed);

        pool.release(borrowed).await;
        assert_eq!(pool.status().idle, 0);
        assert_eq!(factory.journal().closed(), 3);
    }

    #[tokio::test]
    async fn test_balanced_concurrent_use_bounds_inventory() {
        let factory = Arc::new(MockConnectionFactory::new());
        let pool = Arc::new(SessionPool::create(factory.clone(), 4).await.unwrap());

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..5 {
                    let session = pool.acquire().await.unwrap();
                    tokio::task::yield_now().await;
                    pool.release(session).await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let status = pool.status();
        assert!(status.idle <= 4);
        assert_eq!(status.outstanding, 0);
        assert_eq!(status.created - status.discarded, status.idle as u64);
    }
}
