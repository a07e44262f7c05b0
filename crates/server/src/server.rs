//! The listener: one OS thread per connection, a shared shutdown flag
//! polled between accepts and between opcodes.

use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use ahash::AHashMap;
use whais_dbs::DbsHandle;
use whais_vm::{CompiledUnit, NameSpace, Session};

use crate::config::ServerConfig;
use crate::connection::ClientConnection;
use crate::errors::ConnectionError;

struct Database {
    handle: Arc<DbsHandle>,
    units: Vec<CompiledUnit>,
}

pub struct ServerState {
    config: ServerConfig,
    databases: AHashMap<String, Database>,
    shared: Arc<NameSpace>,
    stop: Arc<AtomicBool>,
}

impl ServerState {
    pub fn new(config: ServerConfig, shared: Arc<NameSpace>) -> std::io::Result<Self> {
        let mut databases = AHashMap::new();
        for db in &config.databases {
            let temp = config.temp_directory.join(&db.name);
            let handle = DbsHandle::open(&db.name, &db.directory, &temp, config.storage())
                .map_err(|e| std::io::Error::other(e.to_string()))?;
            let mut units = Vec::new();
            for path in &db.object_files {
                let bytes = std::fs::read(path)?;
                let unit = CompiledUnit::parse(&bytes)
                    .map_err(|e| std::io::Error::other(e.to_string()))?;
                units.push(unit);
            }
            log::info!(
                "serving database '{}' from {} ({} units)",
                db.name,
                db.directory.display(),
                units.len()
            );
            databases.insert(
                db.name.clone(),
                Database {
                    handle: Arc::new(handle),
                    units,
                },
            );
        }
        Ok(Self {
            config,
            databases,
            shared,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Build a session bound to the named database, with the configured
    /// units loaded.
    pub fn open_session(&self, database: &str) -> Result<Arc<Session>, String> {
        let db = self
            .databases
            .get(database)
            .ok_or_else(|| format!("database '{database}' is not served here"))?;
        let session = Session::new(
            Arc::clone(&db.handle),
            Arc::clone(&self.shared),
            Arc::clone(&self.stop),
            self.config.max_stack_count,
        );
        for unit in &db.units {
            session
                .load_compiled_unit(unit.clone())
                .map_err(|e| e.to_string())?;
        }
        Ok(Arc::new(session))
    }

    /// Flush every served database.
    pub fn sync_all(&self) {
        for (name, db) in &self.databases {
            if let Err(e) = db.handle.sync() {
                log::error!("sync of database '{name}' failed: {e}");
            }
        }
    }
}

pub struct Server {
    state: Arc<ServerState>,
    listener: TcpListener,
}

impl Server {
    pub fn bind(state: Arc<ServerState>) -> std::io::Result<Self> {
        let address = ("0.0.0.0", state.config().listen_port);
        let listener = TcpListener::bind(address)?;
        listener.set_nonblocking(true)?;
        log::info!("listening on port {}", state.config().listen_port);
        Ok(Self { state, listener })
    }

    /// Bind to an OS-assigned port; used by tests and single-shot tools.
    pub fn bind_ephemeral(state: Arc<ServerState>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0))?;
        listener.set_nonblocking(true)?;
        Ok(Self { state, listener })
    }

    pub fn local_port(&self) -> std::io::Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    /// Accept and serve until shutdown is signalled. Returns after all
    /// accepted connections have been handed to their threads; the
    /// threads themselves notice the flag between frames.
    pub fn serve(&self) -> std::io::Result<()> {
        let mut workers = Vec::new();
        while !self.state.is_stopping() {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    log::debug!("connection from {peer}");
                    stream.set_nonblocking(false)?;
                    let state = Arc::clone(&self.state);
                    workers.push(std::thread::spawn(move || {
                        serve_client(&state, stream);
                    }));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(20));
                }
                Err(e) => return Err(e),
            }
        }
        for worker in workers {
            let _ = worker.join();
        }
        self.state.sync_all();
        Ok(())
    }
}

fn serve_client(state: &ServerState, stream: TcpStream) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "<unknown>".into());
    match ClientConnection::handshake(state, stream) {
        Ok(mut connection) => match connection.serve(state) {
            Ok(()) | Err(ConnectionError::Closed) => {
                log::debug!("{peer}: session ended");
            }
            Err(e) => log::warn!("{peer}: connection dropped: {e}"),
        },
        Err(e) => log::warn!("{peer}: handshake failed: {e}"),
    }
}
