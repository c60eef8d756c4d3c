//! TLS configuration and the provider-facing contract.
//!
//! The core is provider-agnostic: a TLS implementation registers under a name
//! and compiles an [`SslConfig`] into its own representation, cached on the
//! config behind a type-erased handle and invalidated by the `changed` flag.

use bitflags::bitflags;
use parking_lot::{Mutex, MutexGuard};
use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;

bitflags! {
    /// Enabled TLS protocol versions.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct SslProtocols: u32 {
        const SSLV3 = 0x1;
        const TLSV1_0 = 0x2;
        const TLSV1_1 = 0x4;
        const TLSV1_2 = 0x8;
        const TLSV1_3 = 0x10;
    }
}

impl Default for SslProtocols {
    fn default() -> Self {
        SslProtocols::TLSV1_0 | SslProtocols::TLSV1_1 | SslProtocols::TLSV1_2
    }
}

/// Provider-visible TLS settings. Providers read these under
/// [`SslConfig::lock`] while building their compiled form.
pub struct SslSettings {
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub ca_file: Option<PathBuf>,
    pub ca_path: Option<PathBuf>,
    pub ciphers: Option<String>,
    pub protocols: SslProtocols,
    pub verify_peer: bool,
    pub verify_issuer: bool,
    pub verify_depth: u32,
    pub provider_name: Option<String>,
    /// Provider-specific compiled form of this configuration
    pub compiled: Option<Arc<dyn Any + Send + Sync>>,
    /// Set by every mutation; cleared by the provider after recompiling
    pub changed: bool,
}

/// A TLS configuration shared between sockets. Mutations set the `changed`
/// flag so providers rebuild their compiled state on next use.
pub struct SslConfig {
    server: bool,
    inner: Mutex<SslSettings>,
}

impl SslConfig {
    /// Creates a configuration with protocol and verification defaults:
    /// TLS 1.0-1.2, peers verified on the client side only.
    #[must_use]
    pub fn new(server: bool) -> Arc<Self> {
        Arc::new(Self {
            server,
            inner: Mutex::new(SslSettings {
                cert_file: None,
                key_file: None,
                ca_file: None,
                ca_path: None,
                ciphers: None,
                protocols: SslProtocols::default(),
                verify_peer: !server,
                verify_issuer: !server,
                verify_depth: 6,
                provider_name: None,
                compiled: None,
                changed: true,
            }),
        })
    }

    /// Whether this configuration is for the server side.
    #[must_use]
    pub fn is_server(&self) -> bool {
        self.server
    }

    /// Locks the settings for reading or provider compilation.
    pub fn lock(&self) -> MutexGuard<'_, SslSettings> {
        self.inner.lock()
    }

    pub fn set_cert_file(&self, path: impl Into<PathBuf>) {
        let mut inner = self.inner.lock();
        inner.cert_file = Some(path.into());
        inner.changed = true;
    }

    pub fn set_key_file(&self, path: impl Into<PathBuf>) {
        let mut inner = self.inner.lock();
        inner.key_file = Some(path.into());
        inner.changed = true;
    }

    pub fn set_ca_file(&self, path: impl Into<PathBuf>) {
        let mut inner = self.inner.lock();
        inner.ca_file = Some(path.into());
        inner.changed = true;
    }

    pub fn set_ca_path(&self, path: impl Into<PathBuf>) {
        let mut inner = self.inner.lock();
        inner.ca_path = Some(path.into());
        inner.changed = true;
    }

    /// Replaces the cipher list.
    pub fn set_ciphers(&self, ciphers: &str) {
        let mut inner = self.inner.lock();
        inner.ciphers = Some(ciphers.to_string());
        inner.changed = true;
    }

    /// Appends ciphers to the list, colon separated.
    pub fn add_ciphers(&self, ciphers: &str) {
        let mut inner = self.inner.lock();
        inner.ciphers = Some(match inner.ciphers.take() {
            Some(existing) => format!("{existing}:{ciphers}"),
            None => ciphers.to_string(),
        });
        inner.changed = true;
    }

    pub fn set_protocols(&self, protocols: SslProtocols) {
        let mut inner = self.inner.lock();
        inner.protocols = protocols;
        inner.changed = true;
    }

    pub fn set_verify_peer(&self, on: bool) {
        let mut inner = self.inner.lock();
        inner.verify_peer = on;
        inner.changed = true;
    }

    pub fn set_verify_issuer(&self, on: bool) {
        let mut inner = self.inner.lock();
        inner.verify_issuer = on;
        inner.changed = true;
    }

    pub fn set_verify_depth(&self, depth: u32) {
        let mut inner = self.inner.lock();
        inner.verify_depth = depth;
        inner.changed = true;
    }

    /// Selects the provider to use when upgrading with this configuration.
    pub fn set_provider(&self, name: &str) {
        let mut inner = self.inner.lock();
        inner.provider_name = Some(name.to_string());
        inner.changed = true;
    }

    #[must_use]
    pub fn provider_name(&self) -> Option<String> {
        self.inner.lock().provider_name.clone()
    }

    /// Returns the cached compiled form, rebuilding it with `build` when
    /// missing or stale. This is the provider's entry point.
    ///
    /// # Errors
    ///
    /// Propagates the provider's build error.
    pub fn compiled_with<E>(
        &self,
        build: impl FnOnce(&SslSettings) -> Result<Arc<dyn Any + Send + Sync>, E>,
    ) -> Result<Arc<dyn Any + Send + Sync>, E> {
        let mut inner = self.inner.lock();
        if !inner.changed {
            if let Some(compiled) = &inner.compiled {
                return Ok(Arc::clone(compiled));
            }
        }
        let compiled = build(&inner)?;
        inner.compiled = Some(Arc::clone(&compiled));
        inner.changed = false;
        Ok(compiled)
    }
}

/// Cipher description in a provider state string.
pub(crate) fn state_prefix(server_side: bool) -> &'static str {
    if server_side { "SERVER_" } else { "CLIENT_" }
}

/// Builds the canonical provider state string:
/// `PROVIDER=name,CIPHER=cipher,<prefix>S_CN=subject,<prefix>I_CN=issuer,...`
#[must_use]
pub fn format_ssl_state(
    provider: &str,
    cipher: &str,
    server_side: bool,
    peer_subject_cn: Option<&str>,
    peer_issuer_cn: Option<&str>,
    local_subject_cn: Option<&str>,
    local_issuer_cn: Option<&str>,
) -> String {
    let mut state = format!("PROVIDER={provider},CIPHER={cipher},");
    let peer_prefix = state_prefix(!server_side);
    let local_prefix = state_prefix(server_side);
    if let Some(subject) = peer_subject_cn {
        state.push_str(&format!("{peer_prefix}S_CN={subject},"));
    }
    if let Some(issuer) = peer_issuer_cn {
        state.push_str(&format!("{peer_prefix}I_CN={issuer},"));
    }
    if let Some(subject) = local_subject_cn {
        state.push_str(&format!("{local_prefix}S_CN={subject},"));
    }
    if let Some(issuer) = local_issuer_cn {
        state.push_str(&format!("{local_prefix}I_CN={issuer},"));
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_differ_by_role() {
        let server = SslConfig::new(true);
        let client = SslConfig::new(false);
        assert!(!server.lock().verify_peer);
        assert!(client.lock().verify_peer);
        assert_eq!(server.lock().protocols, SslProtocols::default());
    }

    #[test]
    fn add_ciphers_joins_with_colon() {
        let config = SslConfig::new(false);
        config.add_ciphers("AES128-SHA");
        config.add_ciphers("AES256-SHA");
        assert_eq!(
            config.lock().ciphers.as_deref(),
            Some("AES128-SHA:AES256-SHA")
        );
    }

    #[test]
    fn mutation_marks_changed_and_compile_clears_it() {
        let config = SslConfig::new(true);
        let first = config
            .compiled_with(|_settings| Ok::<_, ()>(Arc::new(1u32) as Arc<dyn Any + Send + Sync>))
            .expect("compile");
        // Unchanged config reuses the cached form
        let second = config
            .compiled_with(|_settings| Ok::<_, ()>(Arc::new(2u32) as Arc<dyn Any + Send + Sync>))
            .expect("compile");
        assert!(Arc::ptr_eq(&first, &second));

        config.set_verify_peer(true);
        let third = config
            .compiled_with(|_settings| Ok::<_, ()>(Arc::new(3u32) as Arc<dyn Any + Send + Sync>))
            .expect("compile");
        assert!(!Arc::ptr_eq(&first, &third));
    }

    #[test]
    fn state_string_shape() {
        let state = format_ssl_state(
            "mock",
            "TLS_AES_128_GCM_SHA256",
            true,
            Some("client.example.com"),
            Some("Example CA"),
            Some("server.example.com"),
            Some("Example CA"),
        );
        assert!(state.starts_with("PROVIDER=mock,CIPHER=TLS_AES_128_GCM_SHA256,"));
        assert!(state.contains("CLIENT_S_CN=client.example.com"));
        assert!(state.contains("SERVER_S_CN=server.example.com"));
    }
}
