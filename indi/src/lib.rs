//! INDI / Indigo client core
//!
//! Tracks the device and property state pushed by an INDI server and lets
//! callers change it.
//!
//! ## Features
//!
//! - Lock-protected property table with created/removed/updated change queues
//! - Device registry kept consistent with the property table per event
//! - Event channel between the transport and the state (one consumer task)
//! - Bulk property requests with optional blocking wait and cooperative abort
//! - `maybe_send` for properties a driver may not expose
//! - Session-keyed connection manager instead of a global client
//! - INDI XML transport over TCP

mod abort;
mod client;
mod connection;
mod dispatch;
mod error;
mod format;
mod protocol;
mod reporting;
mod store;
mod transport;
mod xml;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use abort::AbortToken;
pub use client::{IndiClient, ProcessEventsHook};
pub use connection::{ConnectionManager, SessionId};
pub use dispatch::SendMode;
pub use error::{IndiError, IndiResult};
pub use format::format_number;
pub use protocol::{standard_properties, switch_value, INDI_PROTOCOL_VERSION};
pub use reporting::{DeviceChangeReport, PropertyChangeReport};
pub use store::{
    ClientState, DeviceRegistry, DeviceTable, PropertyStore, PropertyTable, ServerStatus,
};
pub use transport::{ElementSnapshot, PropertyVector, Transport, TransportEvent};
pub use xml::XmlTransport;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Default INDI server port
pub const INDI_DEFAULT_PORT: u16 = 7624;

/// A device known to the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceItem {
    pub name: String,
    pub label: String,
}

impl DeviceItem {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            label: name.to_string(),
        }
    }
}

/// INDI property types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyType {
    Text,
    Number,
    Switch,
    Light,
    Blob,
}

impl PropertyType {
    /// Legacy type tag used by hosts ("INDI_NUMBER", ...)
    pub fn type_tag(self) -> &'static str {
        match self {
            PropertyType::Text => "INDI_TEXT",
            PropertyType::Number => "INDI_NUMBER",
            PropertyType::Switch => "INDI_SWITCH",
            PropertyType::Light => "INDI_LIGHT",
            PropertyType::Blob => "INDI_BLOB",
        }
    }

    pub fn from_type_tag(tag: &str) -> Option<Self> {
        match tag {
            "INDI_TEXT" => Some(PropertyType::Text),
            "INDI_NUMBER" => Some(PropertyType::Number),
            "INDI_SWITCH" => Some(PropertyType::Switch),
            "INDI_LIGHT" => Some(PropertyType::Light),
            "INDI_BLOB" => Some(PropertyType::Blob),
            _ => None,
        }
    }
}

/// INDI property state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyState {
    Idle,
    Ok,
    Busy,
    Alert,
}

impl PropertyState {
    /// Ok and Idle both mean the server is done with a request
    pub fn is_settled(self) -> bool {
        matches!(self, PropertyState::Ok | PropertyState::Idle)
    }
}

/// Identity of one property row: device, property vector, element
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PropertyKey {
    pub device: String,
    pub property: String,
    pub element: String,
}

impl PropertyKey {
    pub fn new(device: &str, property: &str, element: &str) -> Self {
        Self {
            device: device.to_string(),
            property: property.to_string(),
            element: element.to_string(),
        }
    }
}

impl fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}/{}", self.device, self.property, self.element)
    }
}

/// One element of a property vector as held by the property store
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyItem {
    pub device: String,
    pub property: String,
    pub element: String,
    pub property_type: PropertyType,
    pub state: PropertyState,
    /// printf-style display format (Number only)
    pub number_format: String,
    pub property_label: String,
    pub element_label: String,
    pub group: String,
    pub value: String,
    /// Last requested value (Number only)
    pub target: String,
}

impl PropertyItem {
    pub fn key(&self) -> PropertyKey {
        PropertyKey::new(&self.device, &self.property, &self.element)
    }

    /// Numeric value, if the stored text parses
    pub fn number(&self) -> Option<f64> {
        self.value.trim().parse().ok()
    }

    /// Switch value
    pub fn is_on(&self) -> bool {
        self.value.eq_ignore_ascii_case(switch_value::ON)
    }
}

/// Element/value pair of a new property request
#[derive(Debug, Clone, PartialEq)]
pub struct ElementValue {
    pub element: String,
    pub value: String,
}

impl ElementValue {
    pub fn new(element: &str, value: impl ToString) -> Self {
        Self {
            element: element.to_string(),
            value: value.to_string(),
        }
    }
}

/// A request to change the elements of one property vector in a single message
#[derive(Debug, Clone, PartialEq)]
pub struct NewPropertyItem {
    pub device: String,
    pub property: String,
    pub property_type: PropertyType,
    pub elements: Vec<ElementValue>,
}

impl NewPropertyItem {
    pub fn new(device: &str, property: &str, property_type: PropertyType) -> Self {
        Self {
            device: device.to_string(),
            property: property.to_string(),
            property_type,
            elements: Vec::new(),
        }
    }

    pub fn with_element(mut self, element: &str, value: impl ToString) -> Self {
        self.elements.push(ElementValue::new(element, value));
        self
    }

    /// Switch request turning one element on
    pub fn switch_on(device: &str, property: &str, element: &str) -> Self {
        Self::new(device, property, PropertyType::Switch).with_element(element, switch_value::ON)
    }

    /// Number request for several elements of one vector
    pub fn numbers(device: &str, property: &str, values: &[(&str, f64)]) -> Self {
        values.iter().fold(
            Self::new(device, property, PropertyType::Number),
            |item, (element, value)| item.with_element(element, value),
        )
    }

    pub fn key_of(&self, element: &str) -> PropertyKey {
        PropertyKey::new(&self.device, &self.property, element)
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndiClientConfig {
    pub host: String,
    pub port: u16,
    /// Connection timeout for the initial TCP connection (default: 30 seconds)
    pub connection_timeout_secs: u64,
    /// Property state polling interval of blocking sends (default: 100ms)
    pub property_poll_interval_ms: u64,
    /// Upper bound for a blocking send, none by default
    pub send_timeout_secs: Option<u64>,
    /// Capacity of the transport event channel
    pub event_queue_capacity: usize,
    /// Where received BLOBs are written
    pub download_directory: PathBuf,
    /// 0 = failures only, 1 = command summaries, 2 = element detail
    pub verbosity: u8,
}

impl Default for IndiClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: INDI_DEFAULT_PORT,
            connection_timeout_secs: 30,
            property_poll_interval_ms: 100,
            send_timeout_secs: None,
            event_queue_capacity: 1024,
            download_directory: std::env::temp_dir(),
            verbosity: 1,
        }
    }
}

impl IndiClientConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.property_poll_interval_ms)
    }

    pub fn send_timeout(&self) -> Option<Duration> {
        self.send_timeout_secs.map(Duration::from_secs)
    }
}
