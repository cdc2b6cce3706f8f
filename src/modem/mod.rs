use crate::serial::types::PortError;
use crate::serial::{SerialRequest, SerialSupervisor};
use anyhow::{anyhow, bail, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::log::debug;

pub mod codec;
pub mod info;
pub mod sms;

use info::{InfoProvider, InfoRegistry, InfoReport, InfoValue};

/// Deadline for a single provider query. Provider commands are short; slow
/// families already get their multiplier inside the daemon.
const INFO_QUERY_TIMEOUT: Duration = Duration::from_secs(1);

/// Typed query surface over the supervised serial transport: named info
/// providers, the SMS inbox/delete/send workflows, and raw AT passthrough.
pub struct ModemInterface {
    supervisor: Arc<SerialSupervisor>,
    registry: InfoRegistry,
    send_timeout: Duration,
}
impl ModemInterface {
    pub fn new(supervisor: Arc<SerialSupervisor>, send_timeout: Duration) -> Self {
        Self {
            supervisor,
            registry: InfoRegistry::with_default_providers(),
            send_timeout,
        }
    }

    pub fn register_provider(&mut self, provider: InfoProvider) {
        self.registry.register(provider);
    }

    pub fn all_info_keys(&self) -> Vec<&'static str> {
        self.registry.all_keys()
    }

    /// Issue one AT command (CRLF framing appended) through cache and
    /// coalescer, returning the raw response text.
    pub async fn fetch_raw(&self, command: &str, timeout: Duration) -> Result<String, PortError> {
        let request = SerialRequest::new(format!("{command}\r\n").into_bytes(), timeout);
        let response = self.supervisor.query(request).await?;
        Ok(String::from_utf8_lossy(&response.data).into_owned())
    }

    /// Raw bytes straight to the wire, no framing, no cache. The interactive
    /// send handshake goes through here.
    pub(crate) async fn fetch_raw_uncached(
        &self,
        data: Vec<u8>,
        timeout: Duration,
    ) -> Result<String, PortError> {
        let request = SerialRequest::new(data, timeout);
        let response = self.supervisor.query_uncached(request).await?;
        Ok(String::from_utf8_lossy(&response.data).into_owned())
    }

    pub(crate) fn send_timeout(&self) -> Duration {
        self.send_timeout
    }

    pub async fn get_info(&self, key: &str) -> Result<InfoValue> {
        let provider = self
            .registry
            .get(key)
            .ok_or_else(|| anyhow!("info provider not found for key: {key}"))?;
        self.fetch_provider(provider).await
    }

    async fn fetch_provider(&self, provider: &InfoProvider) -> Result<InfoValue> {
        let mut responses = Vec::new();
        for command in provider.commands {
            match self.fetch_raw(command, INFO_QUERY_TIMEOUT).await {
                Ok(text) if text.contains("OK") => responses.push(text),
                Ok(text) => debug!(
                    "provider {} got no OK for {command}: {:?}",
                    provider.key,
                    text.trim()
                ),
                Err(e) => debug!("provider {} query {command} failed: {e}", provider.key),
            }
        }
        if responses.is_empty() {
            bail!("fetch {} failed", provider.key);
        }

        (provider.parse)(&responses.join("\r\n"))
    }

    /// Fetch a set of keys, accumulating per-key failures instead of
    /// short-circuiting.
    pub async fn fetch_info(&self, keys: &[&str]) -> InfoReport {
        let mut report = InfoReport::default();
        for key in keys {
            match self.registry.get(key) {
                None => report
                    .errors
                    .push(format!("provider not found for key: {key}")),
                Some(provider) => match self.fetch_provider(provider).await {
                    Ok(value) => {
                        report.values.insert(provider.key, value);
                    }
                    Err(e) => report.errors.push(format!("error fetching {key}: {e}")),
                },
            }
        }
        report
    }

    pub async fn fetch_all_info(&self) -> InfoReport {
        self.fetch_info(&self.all_info_keys()).await
    }

    pub async fn fetch_module_info(&self) -> InfoReport {
        self.fetch_info(&["ModuleName", "ModuleCPUTemp", "SimStatus", "SimActive"])
            .await
    }

    /// Network attachment details. Only meaningful with an inserted SIM.
    pub async fn fetch_network_info(&self) -> Result<InfoReport> {
        match self.get_info("SimStatus").await? {
            InfoValue::Bool(true) => Ok(self
                .fetch_info(&[
                    "NetworkMode",
                    "DuplexMode",
                    "MCCMNC",
                    "APN",
                    "CellID",
                    "IPV4",
                    "IPV6",
                    "UploadSize",
                    "DownloadSize",
                ])
                .await),
            _ => bail!("network inactivity"),
        }
    }

    /// Signal metrics for the radio the modem is currently camped on.
    pub async fn fetch_signal_info(&self, mode: &str) -> Result<InfoReport> {
        if mode.contains("NR") {
            Ok(self.fetch_info(&["NR_RSRP", "NR_RSRQ", "NR_SINR"]).await)
        } else if mode.contains("LTE") {
            Ok(self.fetch_info(&["LTE_RSRP", "LTE_RSRQ", "LTE_SINR"]).await)
        } else {
            bail!("network mode not recognized: {mode}")
        }
    }

    pub fn stop(&self) {
        self.supervisor.stop();
    }
}
