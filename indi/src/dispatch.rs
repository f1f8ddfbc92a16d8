//! New-property requests
//!
//! A request carries every element of one property vector and goes out as a
//! single transport call. A blocking send then polls the store until each
//! requested element has left Busy.

use std::time::Instant;
use tokio::time::sleep;

use crate::protocol::{standard_properties as props, switch_value};
use crate::{
    IndiClient, IndiError, IndiResult, NewPropertyItem, PropertyKey, PropertyState, PropertyType,
};

/// How a request waits for the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    /// Return once the request is handed to the transport
    Async,
    /// Wait until every requested element is Ok or Idle
    Sync,
}

impl SendMode {
    pub fn from_async(is_async: bool) -> Self {
        if is_async {
            SendMode::Async
        } else {
            SendMode::Sync
        }
    }
}

fn validate(request: &NewPropertyItem) -> IndiResult<()> {
    if request.device.is_empty() {
        return Err(IndiError::InvalidRequest("empty device name".into()));
    }
    if request.property.is_empty() {
        return Err(IndiError::InvalidRequest("empty property name".into()));
    }
    if request.elements.is_empty() {
        return Err(IndiError::InvalidRequest(format!(
            "no elements for {}.{}",
            request.device, request.property
        )));
    }
    if let Some(element) = request.elements.iter().find(|e| e.element.is_empty()) {
        return Err(IndiError::InvalidRequest(format!(
            "empty element name in {}.{} (value '{}')",
            request.device, request.property, element.value
        )));
    }
    match request.property_type {
        PropertyType::Number => {
            for element in &request.elements {
                if element.value.trim().parse::<f64>().is_err() {
                    return Err(IndiError::InvalidRequest(format!(
                        "'{}' is not a number for {}.{}.{}",
                        element.value, request.device, request.property, element.element
                    )));
                }
            }
            Ok(())
        }
        PropertyType::Switch | PropertyType::Text => Ok(()),
        other => Err(IndiError::InvalidRequest(format!(
            "cannot send {} properties",
            other.type_tag()
        ))),
    }
}

impl IndiClient {
    /// Send one property vector request.
    ///
    /// With [`SendMode::Sync`] the call returns after every requested element
    /// reached Ok or Idle. An element in Alert fails with the latest server
    /// message; the abort token yields [`IndiError::Aborted`].
    pub async fn send_new_property_item(
        &self,
        request: &NewPropertyItem,
        mode: SendMode,
    ) -> IndiResult<()> {
        if let Err(e) = validate(request) {
            tracing::error!("{}", e);
            return Err(e);
        }
        if !self.transport().is_connected() {
            tracing::error!(
                "Cannot send {}.{}: not connected to INDI server",
                request.device,
                request.property
            );
            return Err(IndiError::NotConnected);
        }

        if self.verbosity() >= 1 {
            tracing::info!(
                "Sending {} {}.{} ({} element(s), {})",
                request.property_type.type_tag(),
                request.device,
                request.property,
                request.elements.len(),
                if mode == SendMode::Sync { "sync" } else { "async" }
            );
        }
        if self.verbosity() >= 2 {
            for element in &request.elements {
                tracing::debug!(
                    "  {} = {}",
                    request.key_of(&element.element),
                    element.value
                );
            }
        }

        let previous = self.mark_pending(request);
        if let Err(e) = self.transport().send_new_property(request).await {
            self.restore_states(&previous);
            tracing::error!(
                "Sending {}.{} failed: {}",
                request.device,
                request.property,
                e
            );
            return Err(e);
        }

        match mode {
            SendMode::Async => Ok(()),
            SendMode::Sync => self.wait_for_request(request).await,
        }
    }

    /// Send only when the device exposes the property. Returns Ok(false)
    /// without touching the transport otherwise.
    pub async fn maybe_send_new_property_item(
        &self,
        request: &NewPropertyItem,
        mode: SendMode,
    ) -> IndiResult<bool> {
        if !self.has_property(&request.device, &request.property) {
            if self.verbosity() >= 2 {
                tracing::debug!(
                    "Skipping {}.{}: not exposed by the driver",
                    request.device,
                    request.property
                );
            }
            return Ok(false);
        }
        self.send_new_property_item(request, mode).await?;
        Ok(true)
    }

    /// Single element request
    pub async fn send_new_property_value(
        &self,
        device: &str,
        property: &str,
        property_type: PropertyType,
        element: &str,
        value: impl ToString,
        mode: SendMode,
    ) -> IndiResult<()> {
        let request =
            NewPropertyItem::new(device, property, property_type).with_element(element, value);
        self.send_new_property_item(&request, mode).await
    }

    /// Several Number elements of one vector in one request
    pub async fn send_numbers(
        &self,
        device: &str,
        property: &str,
        values: &[(&str, f64)],
        mode: SendMode,
    ) -> IndiResult<()> {
        let request = NewPropertyItem::numbers(device, property, values);
        self.send_new_property_item(&request, mode).await
    }

    /// Turn one switch element ON
    pub async fn send_switch_on(
        &self,
        device: &str,
        property: &str,
        element: &str,
        mode: SendMode,
    ) -> IndiResult<()> {
        let request = NewPropertyItem::switch_on(device, property, element);
        self.send_new_property_item(&request, mode).await
    }

    /// Mark requested elements Busy and record Number targets so the wait
    /// cannot observe the state from before the request. Returns the
    /// previous states.
    fn mark_pending(&self, request: &NewPropertyItem) -> Vec<(PropertyKey, PropertyState)> {
        let mut properties = self.state().properties.write();
        let mut previous = Vec::with_capacity(request.elements.len());
        for element in &request.elements {
            let key = request.key_of(&element.element);
            if let Some(state) = properties.element_state(&key) {
                previous.push((key.clone(), state));
                properties.set_element_state(&key, PropertyState::Busy);
                if request.property_type == PropertyType::Number {
                    properties.set_element_target(&key, &element.value);
                }
            }
        }
        previous
    }

    fn restore_states(&self, previous: &[(PropertyKey, PropertyState)]) {
        let mut properties = self.state().properties.write();
        for (key, state) in previous {
            properties.set_element_state(key, *state);
        }
    }

    /// False when the device is gone or its CONNECTION switch is off
    fn device_dropped(&self, request: &NewPropertyItem) -> bool {
        let devices = self.state().devices.read();
        let properties = self.state().properties.read();
        if !devices.has_device(&request.device) {
            return true;
        }
        if request.property == props::CONNECTION {
            return false;
        }
        match properties.get_property(&request.device, props::CONNECTION, props::CONNECT, false) {
            Some(item) => !item.value.eq_ignore_ascii_case(switch_value::ON),
            None => false,
        }
    }

    async fn wait_for_request(&self, request: &NewPropertyItem) -> IndiResult<()> {
        let start = Instant::now();
        let poll_interval = self.config().poll_interval();
        let send_timeout = self.config().send_timeout();

        loop {
            self.process_events();

            if self.abort_token().is_aborted() {
                tracing::warn!(
                    "Wait for {}.{} aborted",
                    request.device,
                    request.property
                );
                return Err(IndiError::Aborted);
            }

            if self.device_dropped(request) {
                tracing::error!(
                    "Device '{}' disconnected while waiting for {}",
                    request.device,
                    request.property
                );
                return Err(IndiError::DeviceDisconnected(request.device.clone()));
            }

            let mut settled = true;
            {
                let properties = self.state().properties.read();
                for element in &request.elements {
                    match properties.element_state(&request.key_of(&element.element)) {
                        Some(PropertyState::Alert) => {
                            drop(properties);
                            let message = self.current_server_message();
                            tracing::error!(
                                "{}.{} went to Alert: {}",
                                request.device,
                                request.property,
                                message
                            );
                            return Err(IndiError::DeviceAlert {
                                device: request.device.clone(),
                                property: request.property.clone(),
                                message,
                            });
                        }
                        Some(PropertyState::Busy) => settled = false,
                        Some(_) => {}
                        None => {
                            return Err(IndiError::PropertyNotFound {
                                device: request.device.clone(),
                                property: request.property.clone(),
                            })
                        }
                    }
                }
            }
            if settled {
                if self.verbosity() >= 1 {
                    tracing::info!(
                        "{}.{} completed in {:?}",
                        request.device,
                        request.property,
                        start.elapsed()
                    );
                }
                return Ok(());
            }

            if let Some(limit) = send_timeout {
                if start.elapsed() >= limit {
                    return Err(IndiError::OperationTimeout {
                        device: request.device.clone(),
                        property: request.property.clone(),
                        duration: limit,
                    });
                }
            }

            sleep(poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;
    use crate::transport::{ElementSnapshot, PropertyVector, TransportEvent};
    use crate::IndiClientConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn fast_config() -> IndiClientConfig {
        IndiClientConfig {
            property_poll_interval_ms: 10,
            ..Default::default()
        }
    }

    fn coord_vector(state: PropertyState, ra: f64, dec: f64) -> TransportEvent {
        TransportEvent::PropertyUpdated(
            PropertyVector::new("Telescope Simulator", "EQUATORIAL_EOD_COORD", PropertyType::Number)
                .with_state(state)
                .with_element(ElementSnapshot::new("RA", &ra.to_string()))
                .with_element(ElementSnapshot::new("DEC", &dec.to_string())),
        )
    }

    async fn connected_mount(transport: &Arc<MockTransport>) -> IndiClient {
        let client = IndiClient::new(transport.clone(), fast_config());
        client.connect().await.unwrap();
        transport.push(coord_vector(PropertyState::Ok, 0.0, 0.0)).await;
        transport.settle().await;
        client
    }

    #[tokio::test]
    async fn test_sync_send_succeeds_after_busy_then_ok() {
        let transport = Arc::new(MockTransport::new());
        transport.respond_with(|request| {
            if request.property != "EQUATORIAL_EOD_COORD" {
                return vec![];
            }
            vec![
                (Duration::from_millis(5), coord_vector(PropertyState::Busy, 1.0, 2.0)),
                (Duration::from_millis(40), coord_vector(PropertyState::Ok, 5.0, 10.0)),
            ]
        });
        let client = connected_mount(&transport).await;

        client
            .send_numbers(
                "Telescope Simulator",
                "EQUATORIAL_EOD_COORD",
                &[("RA", 5.0), ("DEC", 10.0)],
                SendMode::Sync,
            )
            .await
            .unwrap();

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].elements.len(), 2);
        assert_eq!(
            client.get_number("Telescope Simulator", "EQUATORIAL_EOD_COORD", "RA"),
            Some(5.0)
        );
        assert_eq!(
            client
                .get_property_target("Telescope Simulator", "EQUATORIAL_EOD_COORD", "RA")
                .as_deref(),
            Some("5")
        );
    }

    #[tokio::test]
    async fn test_alert_fails_with_server_message() {
        let transport = Arc::new(MockTransport::new());
        transport.respond_with(|_| {
            vec![
                (
                    Duration::from_millis(5),
                    TransportEvent::ServerMessage {
                        device: "Telescope Simulator".to_string(),
                        message: "Slew failed: below horizon".to_string(),
                    },
                ),
                (Duration::from_millis(10), coord_vector(PropertyState::Alert, 0.0, 0.0)),
            ]
        });
        let client = connected_mount(&transport).await;

        let err = client
            .send_numbers(
                "Telescope Simulator",
                "EQUATORIAL_EOD_COORD",
                &[("RA", 5.0), ("DEC", -80.0)],
                SendMode::Sync,
            )
            .await
            .unwrap_err();

        match err {
            IndiError::DeviceAlert { message, .. } => {
                assert_eq!(message, "Slew failed: below horizon")
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_abort_interrupts_wait_and_calls_hook() {
        let transport = Arc::new(MockTransport::new());
        let client = connected_mount(&transport).await;
        let polls = Arc::new(AtomicUsize::new(0));
        let token = client.abort_token();
        let counter = polls.clone();
        client.set_process_events_hook(Some(Arc::new(move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 2 {
                token.abort();
            }
        })));

        // no responder: the property stays Busy
        let err = client
            .send_numbers(
                "Telescope Simulator",
                "EQUATORIAL_EOD_COORD",
                &[("RA", 5.0), ("DEC", 10.0)],
                SendMode::Sync,
            )
            .await
            .unwrap_err();

        assert!(err.is_aborted());
        assert_eq!(polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_device_removal_ends_wait() {
        let transport = Arc::new(MockTransport::new());
        transport.respond_with(|_| {
            vec![(
                Duration::from_millis(20),
                TransportEvent::DeviceRemoved {
                    device: "Telescope Simulator".to_string(),
                },
            )]
        });
        let client = connected_mount(&transport).await;

        let err = client
            .send_numbers(
                "Telescope Simulator",
                "EQUATORIAL_EOD_COORD",
                &[("RA", 5.0), ("DEC", 10.0)],
                SendMode::Sync,
            )
            .await
            .unwrap_err();
        assert_eq!(
            err,
            IndiError::DeviceDisconnected("Telescope Simulator".to_string())
        );
    }

    #[tokio::test]
    async fn test_timeout_when_configured() {
        let transport = Arc::new(MockTransport::new());
        let client = IndiClient::new(
            transport.clone(),
            IndiClientConfig {
                property_poll_interval_ms: 10,
                send_timeout_secs: Some(0),
                ..Default::default()
            },
        );
        client.connect().await.unwrap();
        transport.push(coord_vector(PropertyState::Ok, 0.0, 0.0)).await;
        transport.settle().await;

        let err = client
            .send_numbers(
                "Telescope Simulator",
                "EQUATORIAL_EOD_COORD",
                &[("RA", 1.0), ("DEC", 1.0)],
                SendMode::Sync,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, IndiError::OperationTimeout { .. }));
    }

    #[tokio::test]
    async fn test_maybe_send_skips_unknown_property() {
        let transport = Arc::new(MockTransport::new());
        let client = connected_mount(&transport).await;

        let request = NewPropertyItem::switch_on("Telescope Simulator", "NONEXISTENT_PROPERTY", "X");
        let sent = client
            .maybe_send_new_property_item(&request, SendMode::Sync)
            .await
            .unwrap();

        assert!(!sent);
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_requests_are_rejected_before_sending() {
        let transport = Arc::new(MockTransport::new());
        let client = connected_mount(&transport).await;

        let empty = NewPropertyItem::new("Telescope Simulator", "EQUATORIAL_EOD_COORD", PropertyType::Number);
        assert!(matches!(
            client.send_new_property_item(&empty, SendMode::Async).await,
            Err(IndiError::InvalidRequest(_))
        ));

        let light = NewPropertyItem::new("Telescope Simulator", "STATUS", PropertyType::Light)
            .with_element("READY", "Ok");
        assert!(matches!(
            client.send_new_property_item(&light, SendMode::Async).await,
            Err(IndiError::InvalidRequest(_))
        ));

        let not_a_number =
            NewPropertyItem::new("Telescope Simulator", "EQUATORIAL_EOD_COORD", PropertyType::Number)
                .with_element("RA", "north");
        assert!(client
            .send_new_property_item(&not_a_number, SendMode::Async)
            .await
            .is_err());
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_send_when_disconnected_fails_fast() {
        let transport = Arc::new(MockTransport::new());
        let client = IndiClient::new(transport.clone(), fast_config());

        let err = client
            .send_switch_on("Telescope Simulator", "TELESCOPE_PARK", "PARK", SendMode::Async)
            .await
            .unwrap_err();
        assert_eq!(err, IndiError::NotConnected);
        assert!(transport.sent().is_empty());
    }
}
