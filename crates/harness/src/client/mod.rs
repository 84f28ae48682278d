//! Browser client sessions and the pool that owns them

pub mod webdriver;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{HarnessError, HarnessResult};
use crate::scope::Scoped;

pub use webdriver::{
    ConsoleEntry, IdentityMode, Page, Post, WebDriverConfig, WebDriverFactory, WebDriverSession,
};

/// One browser-driven client connected to the served app.
#[async_trait]
pub trait Session: Send + Sync + 'static {
    /// Server port this session talks to
    fn port(&self) -> u16;

    async fn logged_out(&mut self) -> HarnessResult<bool>;

    /// Return to a logged-out state with client-side storage cleared.
    async fn reset(&mut self) -> HarnessResult<()>;

    /// Tear the session down, including any browser processes it owns.
    async fn close(&mut self) -> HarnessResult<()>;
}

/// Creates sessions for a pool.
#[async_trait]
pub trait SessionFactory: Send + Sync + 'static {
    type Session: Session;

    /// Launch session `index` against the server on `port`.
    async fn create(&self, index: usize, port: u16) -> HarnessResult<Self::Session>;
}

/// Fixed-size, index-addressable set of sessions bound to one server port.
pub struct ClientPool<S: Session> {
    sessions: Vec<S>,
    port: u16,
    destroyed: bool,
}

impl<S: Session> ClientPool<S> {
    /// Start `count` sessions concurrently, at most `parallelism` at a time.
    ///
    /// Returns only once every session is up and logged out. If any session
    /// fails, the ones that did start are closed and the first error is
    /// returned as [`HarnessError::ClientSetup`].
    pub async fn connect<F>(factory: Arc<F>, port: u16, count: usize, parallelism: usize) -> HarnessResult<Self>
    where
        F: SessionFactory<Session = S>,
    {
        info!(port, count, parallelism, "starting client pool");
        let permits = Arc::new(Semaphore::new(parallelism.max(1)));
        let mut tasks = JoinSet::new();

        for index in 0..count {
            let factory = Arc::clone(&factory);
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|e| HarnessError::ClientSetup(format!("client {index}: {e}")))?;
                start_session(factory.as_ref(), index, port).await
            });
        }

        let mut slots: Vec<Option<S>> = (0..count).map(|_| None).collect();
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok((index, session))) => slots[index] = Some(session),
                Ok(Err(e)) => {
                    warn!(error = %e, "client setup failed");
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    warn!(error = %e, "client setup task failed");
                    first_error.get_or_insert(HarnessError::ClientSetup(e.to_string()));
                }
            }
        }

        if let Some(e) = first_error {
            for (index, session) in slots.iter_mut().enumerate() {
                if let Some(session) = session {
                    if let Err(close_err) = session.close().await {
                        warn!(client = index, error = %close_err, "failed to close client after setup failure");
                    }
                }
            }
            return Err(e);
        }

        Ok(Self {
            sessions: slots.into_iter().flatten().collect(),
            port,
            destroyed: false,
        })
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn client(&self, index: usize) -> Option<&S> {
        self.sessions.get(index)
    }

    pub fn client_mut(&mut self, index: usize) -> Option<&mut S> {
        self.sessions.get_mut(index)
    }

    pub fn clients_mut(&mut self) -> &mut [S] {
        &mut self.sessions
    }

    /// Reset every session.
    ///
    /// All sessions are attempted; the first failure is reported.
    pub async fn reset(&mut self) -> HarnessResult<()> {
        let count = self.sessions.len();
        self.reset_first(count).await
    }

    /// Reset the first `count` sessions only.
    pub async fn reset_first(&mut self, count: usize) -> HarnessResult<()> {
        if count > self.sessions.len() {
            return Err(HarnessError::Reset(format!(
                "asked to reset {} clients but the pool has {}",
                count,
                self.sessions.len()
            )));
        }

        let mut first_error = None;
        for (index, session) in self.sessions.iter_mut().take(count).enumerate() {
            debug!(client = index, "resetting client");
            if let Err(e) = session.reset().await {
                first_error.get_or_insert(HarnessError::Reset(format!("client {index}: {e}")));
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Close every session. Only the first call does anything.
    pub async fn destroy(&mut self) -> HarnessResult<()> {
        if self.destroyed {
            return Ok(());
        }
        self.destroyed = true;

        info!(port = self.port, count = self.sessions.len(), "closing client pool");
        let mut first_error = None;
        for (index, session) in self.sessions.iter_mut().enumerate() {
            if let Err(e) = session.close().await {
                warn!(client = index, error = %e, "failed to close client");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[async_trait]
impl<S: Session> Scoped for ClientPool<S> {
    async fn release(&mut self) -> HarnessResult<()> {
        self.destroy().await
    }
}

async fn start_session<F: SessionFactory>(
    factory: &F,
    index: usize,
    port: u16,
) -> HarnessResult<(usize, F::Session)> {
    let mut session = factory
        .create(index, port)
        .await
        .map_err(|e| HarnessError::ClientSetup(format!("client {index}: {e}")))?;

    let ready = match session.logged_out().await {
        Ok(true) => Ok(()),
        Ok(false) => Err(HarnessError::ClientSetup(format!(
            "client {index} did not start logged out"
        ))),
        Err(e) => Err(HarnessError::ClientSetup(format!("client {index}: {e}"))),
    };

    if let Err(e) = ready {
        if let Err(close_err) = session.close().await {
            warn!(client = index, error = %close_err, "failed to close unready client");
        }
        return Err(e);
    }

    debug!(client = index, port, "client ready");
    Ok((index, session))
}
