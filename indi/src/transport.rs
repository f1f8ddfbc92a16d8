//! Transport boundary
//!
//! A transport turns the server connection into typed events pushed onto an
//! mpsc channel and accepts new-property requests. The client never sees wire
//! bytes.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{IndiResult, NewPropertyItem, PropertyState, PropertyType};

/// One element as carried by a definition or update message
#[derive(Debug, Clone, PartialEq)]
pub struct ElementSnapshot {
    pub name: String,
    /// Empty on updates that do not carry a label
    pub label: String,
    pub value: String,
    /// Number display format, empty when not carried
    pub format: String,
}

impl ElementSnapshot {
    pub fn new(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            label: String::new(),
            value: value.to_string(),
            format: String::new(),
        }
    }

    pub fn with_format(mut self, format: &str) -> Self {
        self.format = format.to_string();
        self
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = label.to_string();
        self
    }
}

/// A property vector definition or update
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyVector {
    pub device: String,
    pub name: String,
    pub property_type: PropertyType,
    /// None when an update leaves the state untouched
    pub state: Option<PropertyState>,
    pub label: String,
    pub group: String,
    pub elements: Vec<ElementSnapshot>,
}

impl PropertyVector {
    pub fn new(device: &str, name: &str, property_type: PropertyType) -> Self {
        Self {
            device: device.to_string(),
            name: name.to_string(),
            property_type,
            state: None,
            label: String::new(),
            group: String::new(),
            elements: Vec::new(),
        }
    }

    pub fn with_state(mut self, state: PropertyState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_element(mut self, element: ElementSnapshot) -> Self {
        self.elements.push(element);
        self
    }
}

/// Events delivered by a transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    DeviceAdded { device: String },
    DeviceRemoved { device: String },
    PropertyDefined(PropertyVector),
    PropertyUpdated(PropertyVector),
    /// `property == None` removes every property of the device
    PropertyRemoved {
        device: String,
        property: Option<String>,
    },
    BlobReceived {
        device: String,
        property: String,
        element: String,
        format: String,
        data: Vec<u8>,
    },
    ServerMessage { device: String, message: String },
    ServerDisconnected,
}

/// Connection to an INDI or Indigo server
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect and start delivering events on `events`
    async fn connect(
        &self,
        host: &str,
        port: u16,
        events: mpsc::Sender<TransportEvent>,
    ) -> IndiResult<()>;

    async fn disconnect(&self) -> IndiResult<()>;

    fn is_connected(&self) -> bool;

    /// Send all elements of one property vector in a single request
    async fn send_new_property(&self, request: &NewPropertyItem) -> IndiResult<()>;

    async fn connect_device(&self, device: &str) -> IndiResult<()>;

    async fn disconnect_device(&self, device: &str) -> IndiResult<()>;
}
