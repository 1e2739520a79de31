//! Non-driving client operations, forwarded to the engine with status translation.

use crate::context::ClientContext;
use crate::engine::{ProtocolVersion, TlsFiles};
use crate::error::Result;
use crate::host::HostRuntime;
use crate::reason::translate_status;

impl<H: HostRuntime> ClientContext<H> {
    pub fn will_set(&self, topic: &str, payload: Option<&[u8]>, qos: i32, retain: bool) -> Result<()> {
        self.engine()?
            .will_set(topic, payload, qos, retain)
            .map_err(translate_status)
    }

    pub fn will_clear(&self) -> Result<()> {
        self.engine()?.will_clear().map_err(translate_status)
    }

    pub fn login_set(&self, username: Option<&str>, password: Option<&str>) -> Result<()> {
        self.engine()?
            .login_set(username, password)
            .map_err(translate_status)
    }

    pub fn tls_set(&self, files: &TlsFiles) -> Result<()> {
        self.engine()?.tls_set(files).map_err(translate_status)
    }

    pub fn tls_insecure_set(&self, insecure: bool) -> Result<()> {
        self.engine()?
            .tls_insecure_set(insecure)
            .map_err(translate_status)
    }

    pub fn tls_opts_set(&self, cert_reqs: i32, tls_version: Option<&str>, ciphers: Option<&str>) -> Result<()> {
        self.engine()?
            .tls_opts_set(cert_reqs, tls_version, ciphers)
            .map_err(translate_status)
    }

    pub fn tls_psk_set(&self, psk: &str, identity: &str, ciphers: Option<&str>) -> Result<()> {
        self.engine()?
            .tls_psk_set(psk, identity, ciphers)
            .map_err(translate_status)
    }

    pub fn threaded_set(&self, threaded: bool) -> Result<()> {
        self.engine()?.threaded_set(threaded).map_err(translate_status)
    }

    pub fn protocol_version_set(&self, version: ProtocolVersion) -> Result<()> {
        self.engine()?
            .protocol_version_set(version)
            .map_err(translate_status)
    }

    pub fn connect(&self, host: &str, port: i32, keepalive: i32) -> Result<()> {
        tracing::debug!(context = %self.id(), host, port, keepalive, "connect");
        self.engine()?
            .connect(host, port, keepalive)
            .map_err(translate_status)
    }

    pub fn connect_async(&self, host: &str, port: i32, keepalive: i32) -> Result<()> {
        tracing::debug!(context = %self.id(), host, port, keepalive, "connect (async)");
        self.engine()?
            .connect_async(host, port, keepalive)
            .map_err(translate_status)
    }

    pub fn reconnect(&self) -> Result<()> {
        self.engine()?.reconnect().map_err(translate_status)
    }

    pub fn reconnect_async(&self) -> Result<()> {
        self.engine()?.reconnect_async().map_err(translate_status)
    }

    pub fn reconnect_delay_set(&self, delay: u32, delay_max: u32, exponential: bool) -> Result<()> {
        self.engine()?
            .reconnect_delay_set(delay, delay_max, exponential)
            .map_err(translate_status)
    }

    pub fn disconnect(&self) -> Result<()> {
        self.engine()?.disconnect().map_err(translate_status)
    }

    /// Returns the message id assigned by the engine.
    pub fn publish(&self, topic: &str, payload: Option<&[u8]>, qos: i32, retain: bool) -> Result<i32> {
        self.engine()?
            .publish(topic, payload, qos, retain)
            .map_err(translate_status)
    }

    pub fn subscribe(&self, pattern: &str, qos: i32) -> Result<i32> {
        self.engine()?.subscribe(pattern, qos).map_err(translate_status)
    }

    pub fn unsubscribe(&self, pattern: &str) -> Result<i32> {
        self.engine()?.unsubscribe(pattern).map_err(translate_status)
    }

    /// Engine socket, if connected.
    pub fn socket(&self) -> Result<Option<i32>> {
        Ok(self.engine()?.socket())
    }

    pub fn want_write(&self) -> Result<bool> {
        Ok(self.engine()?.want_write())
    }
}
