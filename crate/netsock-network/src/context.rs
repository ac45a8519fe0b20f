use crate::config::{DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_WRITE_QUEUE_MAX_SIZE, NetConfig};
use crate::connector::Connector;
use crate::listener::Listener;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// The reactor context listeners, connectors and sockets run in.
///
/// A context owns the cancellation token and the task tracker of
/// everything created from it. Contexts are independent from each
/// other: shutting one down leaves the others alone.
///
/// Cloning a context gives another handle on the same context.
///
/// Contexts must be used from within a tokio runtime.
#[derive(Clone)]
pub struct NetContext {
    scope: IoScope,
    connect_timeout: Duration,
}

impl Default for NetContext {
    fn default() -> Self {
        Self::new()
    }
}

impl NetContext {
    pub fn new() -> Self {
        Self {
            scope: IoScope::new(DEFAULT_WRITE_QUEUE_MAX_SIZE),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
        }
    }

    /// Create a context using the defaults from the given config.
    ///
    /// The listener and connector sections aren't applied here; see
    /// [Listener::from_config] and [Connector::from_config].
    pub fn from_config(config: &NetConfig) -> Self {
        Self {
            scope: IoScope::new(config.write_queue_max_size),
            connect_timeout: Duration::from_millis(config.connector.connect_timeout_ms),
        }
    }

    /// Create a new, unbound, listener.
    pub fn listener(&self) -> Listener {
        Listener::new(self.scope.child())
    }

    /// Create a new plaintext connector.
    pub fn connector(&self) -> Connector {
        Connector::new(self.scope.clone(), self.connect_timeout)
    }

    /// Close every listener and socket created from this context and
    /// wait for their tasks to finish.
    pub async fn shutdown(&self) {
        log::debug!("Shutting down network context");
        self.scope.shutdown().await;
    }

    pub fn is_shut_down(&self) -> bool {
        self.scope.is_shut_down()
    }
}

/// Cancellation and task tracking shared by a group of tasks.
///
/// A child scope is cancelled with its parent, and its tasks are
/// tracked by its parent as well as by itself.
#[derive(Clone)]
pub(crate) struct IoScope {
    token: CancellationToken,
    tasks: TaskTracker,
    parent_tasks: Option<TaskTracker>,
    write_queue_max_size: usize,
}

impl IoScope {
    pub(crate) fn new(write_queue_max_size: usize) -> Self {
        Self {
            token: CancellationToken::new(),
            tasks: TaskTracker::new(),
            parent_tasks: None,
            write_queue_max_size,
        }
    }

    pub(crate) fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            tasks: TaskTracker::new(),
            parent_tasks: Some(self.tasks.clone()),
            write_queue_max_size: self.write_queue_max_size,
        }
    }

    pub(crate) fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let fut = self.tasks.track_future(fut);
        match &self.parent_tasks {
            Some(parent) => tokio::spawn(parent.track_future(fut)),
            None => tokio::spawn(fut),
        };
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub(crate) fn write_queue_max_size(&self) -> usize {
        self.write_queue_max_size
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.token.is_cancelled()
    }

    pub(crate) async fn shutdown(&self) {
        self.token.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}
