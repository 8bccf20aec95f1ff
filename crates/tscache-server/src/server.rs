use std::collections::HashMap;
use std::io::{self, BufReader, BufWriter, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use signal_hook::consts::SIGTERM;
use signal_hook::flag;

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::protocol::{Response, read_request};
use crate::session::Session;
use crate::store::MemoryCache;

const ACCEPT_POLL: Duration = Duration::from_millis(10);

pub struct Server {
    cache: Arc<MemoryCache>,
    config: ServerConfig,
    connections: Arc<Connections>,
}

impl Server {
    pub fn new(cache: MemoryCache, config: ServerConfig) -> Self {
        Self {
            cache: Arc::new(cache),
            config,
            connections: Arc::new(Connections::default()),
        }
    }

    pub fn cache(&self) -> &Arc<MemoryCache> {
        &self.cache
    }

    /// Client connections currently being served.
    pub fn open_connections(&self) -> usize {
        self.connections.len()
    }

    /// Accept clients until SIGTERM, then close every open connection's read
    /// side and wait for the handlers to finish their current request.
    pub fn serve(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.addr)?;
        tracing::info!(addr = %self.config.addr, "tscache-server listening");

        let shutdown = Arc::new(AtomicBool::new(false));
        flag::register(SIGTERM, Arc::clone(&shutdown))?;
        listener.set_nonblocking(true)?;

        let mut workers: Vec<JoinHandle<()>> = Vec::new();
        while !shutdown.load(Ordering::Relaxed) {
            workers.retain(|w| !w.is_finished());
            match listener.accept() {
                Ok((stream, peer)) => match self.spawn_worker(stream, peer) {
                    Ok(worker) => workers.push(worker),
                    Err(e) => tracing::warn!(%peer, error = %e, "could not start connection"),
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
                Err(e) => tracing::warn!(error = %e, "accept error"),
            }
        }

        tracing::info!(open = self.connections.len(), "draining connections");
        self.connections.close_reads();
        for worker in workers {
            let _ = worker.join();
        }
        tracing::info!("shutdown complete");
        Ok(())
    }

    fn spawn_worker(&self, stream: TcpStream, peer: SocketAddr) -> io::Result<JoinHandle<()>> {
        stream.set_nonblocking(false)?;
        let registration = self.connections.register(&stream)?;
        let cache = Arc::clone(&self.cache);
        let max_payload = self.config.max_payload;

        thread::Builder::new()
            .name(format!("tscache-conn-{}", registration.id))
            .spawn(move || {
                let _registration = registration;
                tracing::debug!(%peer, "connection opened");
                match handle_connection(stream, cache, max_payload) {
                    Ok(()) => tracing::debug!(%peer, "connection closed"),
                    Err(e) => tracing::warn!(%peer, error = %e, "connection error"),
                }
            })
    }
}

/// Open client sockets by connection id. Shutdown closes their read sides;
/// each entry leaves the map when its handler returns.
#[derive(Default)]
struct Connections {
    next_id: AtomicU64,
    open: Mutex<HashMap<u64, TcpStream>>,
}

impl Connections {
    fn register(self: &Arc<Self>, stream: &TcpStream) -> io::Result<Registration> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(id, stream.try_clone()?);
        Ok(Registration {
            id,
            connections: Arc::clone(self),
        })
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn close_reads(&self) {
        for stream in self.lock().values() {
            let _ = stream.shutdown(Shutdown::Read);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, TcpStream>> {
        self.open.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Removes its connection from [`Connections`] when dropped.
struct Registration {
    id: u64,
    connections: Arc<Connections>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.connections.lock().remove(&self.id);
    }
}

fn handle_connection(
    stream: TcpStream,
    cache: Arc<MemoryCache>,
    max_payload: usize,
) -> Result<(), ServerError> {
    let session = Session::new(cache);
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = BufWriter::new(stream);

    loop {
        let response = match read_request(&mut reader, max_payload) {
            Ok(Some(request)) => session.handle(request),
            Ok(None) => return Ok(()),
            Err(ServerError::BadCommand(msg)) => Response::ClientError(msg),
            Err(ServerError::Desync(msg)) => {
                Response::ClientError(msg.clone()).write_to(&mut writer)?;
                writer.flush()?;
                // The registry holds a clone of the stream, so close explicitly.
                let _ = writer.get_ref().shutdown(Shutdown::Both);
                return Err(ServerError::Desync(msg));
            }
            Err(ServerError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        response.write_to(&mut writer)?;
        writer.flush()?;
    }
}
