//! Serializes concurrent callers onto a single realtime protocol client.
//!
//! A [`SessionBridge`] owns one worker thread running a current-thread tokio
//! runtime. All provider I/O happens on that thread, fed by a single-consumer
//! work queue, so exchanges never interleave on the wire and no lock guards
//! the connection. Callers block on `send_message` from whatever thread they
//! live on; the worker unblocks each caller exactly once with its own
//! response.

use crate::config::{Config, ProviderKind, SessionConfig};
use crate::provider::{ProtocolClient, build_client};
use anyhow::{Context, Result, anyhow, bail};
use std::sync::{Mutex, MutexGuard, mpsc};
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

/// How long `stop` waits for an in-flight exchange before abandoning the
/// worker.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Produces a fresh protocol client for each (re-)initialization attempt.
pub type ClientFactory = Box<dyn FnMut() -> Box<dyn ProtocolClient> + Send>;

enum Work {
    Exchange(Exchange),
    Stop,
}

/// One in-flight request/response pair. The worker resolves it exactly once;
/// if the worker dies first, the dropped sender unblocks the caller with an
/// error.
struct Exchange {
    text: String,
    reply: mpsc::Sender<Result<String>>,
}

pub struct SessionBridge {
    work_tx: Mutex<Option<mpsc::Sender<Work>>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    worker_thread: thread::ThreadId,
    done_rx: Mutex<mpsc::Receiver<()>>,
}

impl SessionBridge {
    /// Creates a bridge for the given provider. The worker thread starts
    /// immediately; the provider connection is only established on the first
    /// `send_message`.
    pub fn new(provider: ProviderKind, session: SessionConfig, config: &Config) -> Result<Self> {
        let api_key = config.api_key_for(provider)?.to_owned();
        let factory: ClientFactory =
            Box::new(move || build_client(provider, session.clone(), api_key.clone()));
        Self::with_client_factory(factory)
    }

    /// Creates a bridge around an arbitrary client factory.
    pub fn with_client_factory(factory: ClientFactory) -> Result<Self> {
        let (work_tx, work_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();

        let worker = thread::Builder::new()
            .name("session-bridge".to_string())
            .spawn(move || {
                let _ = ready_tx.send(thread::current().id());
                worker_loop(factory, work_rx);
                let _ = done_tx.send(());
            })
            .context("failed to spawn session bridge worker")?;
        let worker_thread = ready_rx
            .recv()
            .map_err(|_| anyhow!("session bridge worker exited during startup"))?;

        Ok(Self {
            work_tx: Mutex::new(Some(work_tx)),
            worker: Mutex::new(Some(worker)),
            worker_thread,
            done_rx: Mutex::new(done_rx),
        })
    }

    /// Submits one exchange and blocks until the worker resolves it.
    ///
    /// Safe to call from any number of threads at once; exchanges are
    /// serviced strictly one at a time in submission order. The first
    /// exchange also triggers connect/configure, and a failure there
    /// propagates to that caller while leaving the bridge clean for a retry.
    ///
    /// This call parks the current thread, so it must not run on an async
    /// executor thread.
    pub fn send_message(&self, text: &str) -> Result<String> {
        // Self-submission from the worker would wait on itself forever.
        if thread::current().id() == self.worker_thread {
            bail!("send_message called from the bridge worker thread");
        }
        let work_tx = lock(&self.work_tx)
            .as_ref()
            .context("session bridge is stopped")?
            .clone();

        let (reply_tx, reply_rx) = mpsc::channel();
        work_tx
            .send(Work::Exchange(Exchange {
                text: text.to_owned(),
                reply: reply_tx,
            }))
            .map_err(|_| anyhow!("session bridge worker is no longer running"))?;
        reply_rx
            .recv()
            .map_err(|_| anyhow!("session bridge stopped before the exchange completed"))?
    }

    /// Tears down the provider connection and the worker thread.
    ///
    /// An in-flight exchange is allowed to finish, bounded by a timeout; past
    /// that the worker is abandoned. Exchanges still queued behind the stop
    /// request are dropped and their callers unblocked with an error.
    /// Idempotent, and safe before any message was ever sent.
    pub fn stop(&self) {
        let Some(work_tx) = lock(&self.work_tx).take() else {
            return;
        };
        let _ = work_tx.send(Work::Stop);
        drop(work_tx);

        let Some(worker) = lock(&self.worker).take() else {
            return;
        };
        match lock(&self.done_rx).recv_timeout(STOP_TIMEOUT) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                let _ = worker.join();
                info!("session bridge stopped");
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                warn!(
                    timeout = ?STOP_TIMEOUT,
                    "bridge worker still busy at shutdown; abandoning the in-flight exchange"
                );
            }
        }
    }
}

impl Drop for SessionBridge {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn worker_loop(mut factory: ClientFactory, work_rx: mpsc::Receiver<Work>) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            // Dropping the receiver unblocks every queued caller with an error.
            error!(error = %e, "failed to build the bridge runtime");
            return;
        }
    };

    runtime.block_on(async {
        let mut client: Option<Box<dyn ProtocolClient>> = None;

        while let Ok(work) = work_rx.recv() {
            let exchange = match work {
                Work::Exchange(exchange) => exchange,
                Work::Stop => break,
            };
            let result = service_exchange(&mut factory, &mut client, &exchange.text).await;
            if exchange.reply.send(result).is_err() {
                warn!("caller went away before its response arrived");
            }
        }

        if let Some(mut client) = client.take() {
            if let Err(e) = client.disconnect().await {
                warn!(error = %e, "provider disconnect failed during shutdown");
            }
        }
    });
}

/// Runs one exchange, lazily establishing and configuring the connection on
/// the first pass. Initialization failures leave no client behind, so the
/// next exchange retries from a clean state.
async fn service_exchange(
    factory: &mut ClientFactory,
    client: &mut Option<Box<dyn ProtocolClient>>,
    text: &str,
) -> Result<String> {
    let active = match client.as_mut() {
        Some(active) => active,
        None => {
            let mut fresh = factory();
            if let Err(e) = initialize(fresh.as_mut()).await {
                let _ = fresh.disconnect().await;
                return Err(e);
            }
            client.insert(fresh)
        }
    };
    active.send_message(text).await
}

async fn initialize(client: &mut dyn ProtocolClient) -> Result<()> {
    client.connect().await?;
    client.configure_session().await
}
