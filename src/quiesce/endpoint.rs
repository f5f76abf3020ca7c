//! Listening endpoint
//!
//! Binding is retried because a restarting server may find its port still
//! held for a while. Once serving, each accepted connection runs in its own
//! task and is counted in the endpoint's [`ConnectionGroup`] until it ends.

use super::{lock, Channel, ConnectionGroup, Error, Result};
use crate::config::EndpointConfig;
use socket2::{Domain, Protocol, Socket, Type};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A bound TCP listener taking part in shutdown as a [`Channel`]
pub struct Endpoint {
    name: String,
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    group: ConnectionGroup,
    quiescing: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl Endpoint {
    /// Bind `addr`, retrying up to `config.bind_attempts` times
    pub async fn bind(
        name: impl Into<String>,
        addr: SocketAddr,
        config: &EndpointConfig,
    ) -> Result<Arc<Endpoint>> {
        let name = name.into();
        let attempts = config.bind_attempts.max(1);
        let mut attempt = 0;
        let listener = loop {
            attempt += 1;
            match bind_listener(addr, config.backlog) {
                Ok(listener) => break listener,
                Err(e) if attempt >= attempts => {
                    warn!(endpoint = %name, %addr, attempts, cause = %e, "giving up on bind");
                    return Err(Error::Bind {
                        addr,
                        attempts,
                        source: e,
                    });
                }
                Err(e) => {
                    warn!(endpoint = %name, %addr, attempt, cause = %e, "bind failed, retrying");
                    tokio::time::sleep(config.bind_retry_interval).await;
                }
            }
        };

        let local_addr = listener.local_addr()?;
        info!(endpoint = %name, %local_addr, "endpoint listening");
        Ok(Arc::new(Endpoint {
            name,
            local_addr,
            listener: Mutex::new(Some(listener)),
            accept_task: Mutex::new(None),
            group: ConnectionGroup::new(),
            quiescing: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn group(&self) -> &ConnectionGroup {
        &self.group
    }

    pub fn is_quiescing(&self) -> bool {
        self.quiescing.load(Ordering::Acquire)
    }

    /// Start accepting; each connection is passed to `handler` in its own
    /// task. Connections arriving after quiesce started are dropped.
    pub fn serve<F, Fut>(&self, handler: F) -> Result<()>
    where
        F: Fn(TcpStream, SocketAddr) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = lock(&self.listener).take().ok_or(Error::NotListening)?;
        let group = self.group.clone();
        let quiescing = self.quiescing.clone();
        let name = self.name.clone();

        let task = tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(endpoint = %name, cause = %e, "failed to accept");
                        continue;
                    }
                };

                if quiescing.load(Ordering::Acquire) {
                    debug!(endpoint = %name, %peer, "refusing connection while quiescing");
                    drop(stream);
                    continue;
                }

                let guard = group.register();
                let guard_id = guard.id();
                let connection = handler(stream, peer);
                let child = tokio::spawn(async move {
                    let _guard = guard;
                    connection.await;
                });
                group.attach(guard_id, child.abort_handle());
                debug!(endpoint = %name, %peer, live = group.len(), "connection accepted");
            }
        });

        *lock(&self.accept_task) = Some(task);
        Ok(())
    }
}

impl Channel for Endpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn quiesce_started(&self) {
        if !self.quiescing.swap(true, Ordering::AcqRel) {
            info!(endpoint = %self.name, live = self.group.len(), "endpoint quiescing");
        }
    }

    fn live_connections(&self) -> usize {
        self.group.len()
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.quiescing.store(true, Ordering::Release);
        if let Some(task) = lock(&self.accept_task).take() {
            task.abort();
        }
        lock(&self.listener).take();
        self.group.close_all();
        info!(endpoint = %self.name, "endpoint closed");
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.accept_task).take() {
            task.abort();
        }
    }
}

fn bind_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    TcpListener::from_std(socket.into())
}
