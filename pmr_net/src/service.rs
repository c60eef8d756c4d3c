//! The socket service: provider registry, accept limits and wait integration.

use crate::error::{Error, Result};
use crate::provider::{SocketProvider, StandardProvider};
use crate::socket::Socket;
use crate::ssl::SslConfig;
use crate::wait::WaitService;
use dashmap::DashMap;
use parking_lot::Mutex;
use pmr_dispatch::EventService;
use pmr_mem::Heap;
use socket2::Socket as OsSocket;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Weak};
use tracing::debug;

/// Hook run on a listening descriptor before `bind`. May replace it.
pub type PrebindHook = Box<dyn Fn(OsSocket) -> Result<OsSocket> + Send + Sync>;

/// Global socket service bound to the global event service
pub static SOCKET_SERVICE: LazyLock<Arc<SocketService>> = LazyLock::new(|| {
    SocketService::new(Arc::clone(pmr_dispatch::event_service()))
        .expect("initialize socket service")
});

/// Returns the process-wide socket service.
#[must_use]
pub fn socket_service() -> &'static Arc<SocketService> {
    &SOCKET_SERVICE
}

/// Owner of the provider registry, the accept cap and the wait service.
pub struct SocketService {
    this: Weak<Self>,
    events: Arc<EventService>,
    providers: DashMap<String, Arc<dyn SocketProvider>>,
    default_ssl_provider: Mutex<Option<String>>,
    standard: Arc<StandardProvider>,
    wait: Arc<WaitService>,
    max_accept: AtomicUsize,
    num_accept: AtomicUsize,
    prebind: Mutex<Option<PrebindHook>>,
}

impl SocketService {
    /// Creates a socket service over the given event service and installs its
    /// wait service as the event loop notifier.
    ///
    /// # Errors
    ///
    /// [`Error::CantCreate`] when the wakeup pipe cannot be created.
    pub fn new(events: Arc<EventService>) -> Result<Arc<Self>> {
        let wait = Arc::new(WaitService::new()?);
        events.set_notifier(Arc::clone(&wait) as Arc<dyn pmr_dispatch::Notifier>);
        let service = Arc::new_cyclic(|this| Self {
            this: this.clone(),
            events,
            providers: DashMap::new(),
            default_ssl_provider: Mutex::new(None),
            standard: Arc::new(StandardProvider),
            wait,
            max_accept: AtomicUsize::new(usize::MAX),
            num_accept: AtomicUsize::new(0),
            prebind: Mutex::new(None),
        });
        Ok(service)
    }

    /// The event service this socket layer schedules callbacks on.
    #[must_use]
    pub fn events(&self) -> &Arc<EventService> {
        &self.events
    }

    /// The heap, for GC coordination around blocking calls.
    #[must_use]
    pub fn heap(&self) -> &Arc<Heap> {
        self.events.heap()
    }

    /// The poll-based wait service.
    #[must_use]
    pub fn wait_service(&self) -> &Arc<WaitService> {
        &self.wait
    }

    /// Creates a socket bound to the standard provider.
    ///
    /// # Errors
    ///
    /// If the service no longer has a strong reference to hand the socket.
    pub fn create_socket(&self) -> Result<Arc<Socket>> {
        let Some(this) = self.this.upgrade() else {
            return Err(Error::CantCreate(
                "socket: failed to upgrade weak reference to socket service".to_string(),
            ));
        };
        Ok(Socket::new(this, self.standard_provider()))
    }

    /// The standard provider instance.
    #[must_use]
    pub fn standard_provider(&self) -> Arc<dyn SocketProvider> {
        Arc::clone(&self.standard) as Arc<dyn SocketProvider>
    }

    /// Registers a provider under its name. The first TLS provider registered
    /// becomes the default for upgrades that do not name one.
    pub fn add_socket_provider(&self, provider: Arc<dyn SocketProvider>) {
        let name = provider.name().to_string();
        debug!("adding socket provider {name}");
        self.providers.insert(name.clone(), provider);
        let mut default = self.default_ssl_provider.lock();
        if default.is_none() {
            *default = Some(name);
        }
    }

    /// Looks up a registered provider.
    #[must_use]
    pub fn lookup_provider(&self, name: &str) -> Option<Arc<dyn SocketProvider>> {
        self.providers.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Whether any TLS-capable provider is registered.
    #[must_use]
    pub fn has_secure_providers(&self) -> bool {
        !self.providers.is_empty()
    }

    /// Upgrades `sock` to TLS using `ssl` (or a fresh default config), routing
    /// through the configured provider.
    ///
    /// # Errors
    ///
    /// [`Error::CantInitialize`] when no suitable provider is registered, plus
    /// any provider upgrade failure.
    pub fn upgrade_socket(
        &self,
        sock: &Arc<Socket>,
        ssl: Option<Arc<SslConfig>>,
        peer_name: Option<&str>,
    ) -> Result<()> {
        let server = sock
            .flags()
            .contains(crate::socket::SocketFlags::SERVER);
        let ssl = ssl.unwrap_or_else(|| SslConfig::new(server));
        let provider_name = match ssl.provider_name() {
            Some(name) => name,
            None => self
                .default_ssl_provider
                .lock()
                .clone()
                .ok_or_else(|| {
                    Error::CantInitialize("no TLS provider registered".to_string())
                })?,
        };
        let provider = self.lookup_provider(&provider_name).ok_or_else(|| {
            Error::CantInitialize(format!("missing TLS provider {provider_name}"))
        })?;
        debug!("upgrading socket with provider {provider_name}");
        sock.set_ssl_config(Arc::clone(&ssl));
        sock.set_provider(Arc::clone(&provider));
        provider.upgrade(sock, ssl, peer_name)
    }

    /// Installs a hook run on listening descriptors before `bind`.
    pub fn set_prebind_hook(&self, hook: PrebindHook) {
        *self.prebind.lock() = Some(hook);
    }

    pub(crate) fn run_prebind(&self, socket: OsSocket) -> Result<OsSocket> {
        match self.prebind.lock().as_ref() {
            Some(hook) => hook(socket),
            None => Ok(socket),
        }
    }

    // ------------------------------------------------------------------
    // Accept limiting
    // ------------------------------------------------------------------

    /// Caps the number of simultaneously accepted client sockets.
    pub fn set_max_accept(&self, max: usize) {
        self.max_accept.store(max, Ordering::Relaxed);
    }

    /// Currently accepted client sockets.
    #[must_use]
    pub fn accept_count(&self) -> usize {
        self.num_accept.load(Ordering::Relaxed)
    }

    /// Accounts one accepted connection. Returns `false` when over the cap;
    /// the caller must close the connection, which undoes the count.
    pub(crate) fn on_accept(&self) -> bool {
        let count = self.num_accept.fetch_add(1, Ordering::AcqRel) + 1;
        count <= self.max_accept.load(Ordering::Relaxed)
    }

    pub(crate) fn on_close_server(&self) {
        let _ = self
            .num_accept
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                Some(count.saturating_sub(1))
            });
    }
}
