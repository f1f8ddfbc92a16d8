//! INDI client
//!
//! Owns the transport, the shared [`ClientState`] and the consumer task that
//! applies transport events. Events arrive on an mpsc channel and are applied
//! one at a time, each under the device and property locks, so no reader ever
//! sees a device without its properties or the other way round.

use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::reporting::{DeviceChangeReport, PropertyChangeReport};
use crate::store::ClientState;
use crate::transport::{Transport, TransportEvent};
use crate::{
    AbortToken, DeviceItem, IndiClientConfig, IndiError, IndiResult, PropertyItem,
};

/// Host event-loop hook called once per poll iteration of a blocking send
pub type ProcessEventsHook = Arc<dyn Fn() + Send + Sync>;

/// Client for one INDI server connection
pub struct IndiClient {
    transport: Arc<dyn Transport>,
    config: IndiClientConfig,
    state: Arc<ClientState>,
    abort: AbortToken,
    process_events: Mutex<Option<ProcessEventsHook>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for IndiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndiClient").finish_non_exhaustive()
    }
}

impl IndiClient {
    pub fn new(transport: Arc<dyn Transport>, config: IndiClientConfig) -> Self {
        Self {
            transport,
            config,
            state: Arc::new(ClientState::new()),
            abort: AbortToken::new(),
            process_events: Mutex::new(None),
            pump: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &IndiClientConfig {
        &self.config
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Shared device and property state
    pub fn state(&self) -> &Arc<ClientState> {
        &self.state
    }

    /// Token checked by every blocking send of this client
    pub fn abort_token(&self) -> AbortToken {
        self.abort.clone()
    }

    pub fn set_process_events_hook(&self, hook: Option<ProcessEventsHook>) {
        *self.process_events.lock() = hook;
    }

    pub(crate) fn process_events(&self) {
        let hook = self.process_events.lock().clone();
        if let Some(hook) = hook {
            hook();
        }
    }

    /// Verbosity clamped to 0..=2
    pub fn verbosity(&self) -> u8 {
        self.config.verbosity.min(2)
    }

    // =========================================================================
    // CONNECTION
    // =========================================================================

    /// Connect to the configured server and start the event consumer
    pub async fn connect(&self) -> IndiResult<()> {
        if self.transport.is_connected() {
            return Err(IndiError::DuplicateConnection(format!(
                "{}:{}",
                self.config.host, self.config.port
            )));
        }

        let (tx, rx) = mpsc::channel(self.config.event_queue_capacity.max(1));
        let connection_timeout = self.config.connection_timeout();
        match timeout(
            connection_timeout,
            self.transport.connect(&self.config.host, self.config.port, tx),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(IndiError::ConnectionTimeout {
                    host: self.config.host.clone(),
                    port: self.config.port,
                    duration: connection_timeout,
                })
            }
        }

        let handle = tokio::spawn(event_pump(
            rx,
            self.state.clone(),
            self.config.download_directory.clone(),
        ));
        if let Some(previous) = self.pump.lock().replace(handle) {
            previous.abort();
        }

        tracing::info!(
            "Connected to INDI server {}:{}",
            self.config.host,
            self.config.port
        );
        Ok(())
    }

    /// Disconnect, stop the consumer and flush all state
    pub async fn disconnect(&self) -> IndiResult<()> {
        tracing::info!(
            "Disconnecting from INDI server {}:{}",
            self.config.host,
            self.config.port
        );
        let result = self.transport.disconnect().await;
        if let Some(handle) = self.pump.lock().take() {
            handle.abort();
        }
        self.state.reset();
        result
    }

    pub fn is_server_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub async fn connect_device(&self, device: &str) -> IndiResult<()> {
        if !self.transport.is_connected() {
            return Err(IndiError::NotConnected);
        }
        self.transport.connect_device(device).await
    }

    pub async fn disconnect_device(&self, device: &str) -> IndiResult<()> {
        if !self.transport.is_connected() {
            return Err(IndiError::NotConnected);
        }
        self.transport.disconnect_device(device).await
    }

    // =========================================================================
    // STATE ACCESS
    // =========================================================================

    pub fn devices(&self) -> Vec<DeviceItem> {
        self.state.devices.devices()
    }

    pub fn has_devices(&self) -> bool {
        self.state.devices.has_devices()
    }

    pub fn has_device(&self, device: &str) -> bool {
        self.state.devices.has_device(device)
    }

    pub fn is_device_connected(&self, device: &str) -> bool {
        self.state.is_device_connected(device)
    }

    pub fn get_property(
        &self,
        device: &str,
        property: &str,
        element: &str,
        formatted: bool,
    ) -> Option<PropertyItem> {
        self.state
            .properties
            .get_property(device, property, element, formatted)
    }

    /// Numeric value of a Number element
    pub fn get_number(&self, device: &str, property: &str, element: &str) -> Option<f64> {
        self.get_property(device, property, element, false)
            .and_then(|item| item.number())
    }

    /// Text or switch value of an element
    pub fn get_text(&self, device: &str, property: &str, element: &str) -> Option<String> {
        self.get_property(device, property, element, false)
            .map(|item| item.value)
    }

    pub fn get_property_elements(&self, device: &str, property: &str) -> Vec<PropertyItem> {
        self.state.properties.get_property_elements(device, property)
    }

    pub fn get_property_target(&self, device: &str, property: &str, element: &str) -> Option<String> {
        self.state
            .properties
            .get_property_target(device, property, element)
    }

    pub fn has_property(&self, device: &str, property: &str) -> bool {
        self.state.properties.has_property(device, property)
    }

    pub fn has_element(&self, device: &str, property: &str, element: &str) -> bool {
        self.state.properties.has_element(device, property, element)
    }

    pub fn current_server_message(&self) -> String {
        self.state.current_message()
    }

    pub fn has_downloaded_image(&self) -> bool {
        self.state.has_downloaded_image()
    }

    pub fn downloaded_image_path(&self) -> Option<PathBuf> {
        self.state.downloaded_image_path()
    }

    pub fn clear_downloaded_image_path(&self) {
        self.state.clear_downloaded_image_path()
    }

    // =========================================================================
    // CHANGE REPORTS
    // =========================================================================

    pub fn report_changed_devices(&self) -> Option<DeviceChangeReport> {
        self.state.report_changed_devices()
    }

    pub fn report_changed_properties(&self) -> Option<PropertyChangeReport> {
        self.state.report_changed_properties()
    }

    pub fn restart(&self) {
        self.state.restart_reports()
    }
}

impl Drop for IndiClient {
    fn drop(&mut self) {
        if let Some(handle) = self.pump.get_mut().take() {
            handle.abort();
        }
    }
}

/// Consumer side of the transport channel
async fn event_pump(
    mut rx: mpsc::Receiver<TransportEvent>,
    state: Arc<ClientState>,
    download_directory: PathBuf,
) {
    while let Some(event) = rx.recv().await {
        match &event {
            TransportEvent::BlobReceived {
                device,
                property,
                element,
                format,
                data,
            } => {
                let n = state.next_blob_number();
                let path = blob_path(&download_directory, device, property, element, n, format);
                match tokio::fs::write(&path, data).await {
                    Ok(()) => {
                        tracing::debug!(
                            "BLOB {}.{}.{} written to {} ({} bytes)",
                            device,
                            property,
                            element,
                            path.display(),
                            data.len()
                        );
                        state.record_download(&path);
                    }
                    Err(e) => {
                        tracing::error!("Failed to write BLOB to {}: {}", path.display(), e);
                    }
                }
            }
            TransportEvent::ServerDisconnected => {
                tracing::warn!("INDI server connection lost");
                state.apply(&event);
            }
            _ => state.apply(&event),
        }
    }
    tracing::debug!("INDI event channel closed");
}

fn blob_path(
    directory: &Path,
    device: &str,
    property: &str,
    element: &str,
    n: u64,
    format: &str,
) -> PathBuf {
    let sanitize = |s: &str| s.replace(|c: char| !c.is_ascii_alphanumeric() && c != '-', "_");
    let extension = if format.starts_with('.') {
        format.to_string()
    } else {
        format!(".{}", format)
    };
    directory.join(format!(
        "{}_{}_{}_{}{}",
        sanitize(device),
        sanitize(property),
        sanitize(element),
        n,
        extension
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;
    use crate::transport::{ElementSnapshot, PropertyVector};
    use crate::PropertyType;
    use std::time::Duration;

    #[tokio::test]
    async fn test_events_reach_the_store_through_the_channel() {
        let transport = Arc::new(MockTransport::new());
        let client = IndiClient::new(transport.clone(), IndiClientConfig::default());
        client.connect().await.unwrap();

        transport
            .push(TransportEvent::PropertyDefined(
                PropertyVector::new("Telescope Simulator", "TIME_LST", PropertyType::Number)
                    .with_element(ElementSnapshot::new("LST", "6.5")),
            ))
            .await;
        transport.settle().await;

        assert!(client.has_device("Telescope Simulator"));
        assert_eq!(client.get_number("Telescope Simulator", "TIME_LST", "LST"), Some(6.5));
        assert!(client.report_changed_devices().is_some());
    }

    #[tokio::test]
    async fn test_second_connect_reports_duplicate() {
        let transport = Arc::new(MockTransport::new());
        let client = IndiClient::new(transport, IndiClientConfig::default());
        client.connect().await.unwrap();
        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, IndiError::DuplicateConnection(_)));
    }

    #[tokio::test]
    async fn test_blob_is_written_and_recorded() {
        let dir = std::env::temp_dir().join(format!("indi-blob-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let config = IndiClientConfig {
            download_directory: dir.clone(),
            ..Default::default()
        };
        let transport = Arc::new(MockTransport::new());
        let client = IndiClient::new(transport.clone(), config);
        client.connect().await.unwrap();

        transport
            .push(TransportEvent::BlobReceived {
                device: "CCD Simulator".to_string(),
                property: "CCD1".to_string(),
                element: "CCD1".to_string(),
                format: ".fits".to_string(),
                data: b"SIMPLE  =                    T".to_vec(),
            })
            .await;

        let mut waited = Duration::ZERO;
        while !client.has_downloaded_image() && waited < Duration::from_secs(2) {
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += Duration::from_millis(10);
        }

        let path = client.downloaded_image_path().unwrap();
        assert_eq!(
            path.file_name().unwrap().to_string_lossy(),
            "CCD_Simulator_CCD1_CCD1_1.fits"
        );
        assert!(std::fs::read(&path).unwrap().starts_with(b"SIMPLE"));

        client.clear_downloaded_image_path();
        assert!(!client.has_downloaded_image());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_disconnect_flushes_state() {
        let transport = Arc::new(MockTransport::new());
        let client = IndiClient::new(transport.clone(), IndiClientConfig::default());
        client.connect().await.unwrap();
        transport
            .push(TransportEvent::DeviceAdded {
                device: "CCD Simulator".to_string(),
            })
            .await;
        transport.settle().await;
        assert!(client.has_devices());

        client.disconnect().await.unwrap();
        assert!(!client.has_devices());
        assert!(!client.is_server_connected());
    }
}
