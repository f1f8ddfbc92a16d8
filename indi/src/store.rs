//! Property store and device registry
//!
//! The property table and the device registry each sit behind a
//! `parking_lot::RwLock`: lookups share a read guard, mutations and queue
//! drains take the write guard. Guards release on every exit path when
//! dropped. Change queues live under the same lock as the table they
//! describe. The server status is a plain `Mutex`.
//!
//! Lock order when more than one is needed: devices, then properties, then
//! the server status.

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::format::format_number;
use crate::protocol::{standard_properties as props, switch_value};
use crate::transport::{ElementSnapshot, PropertyVector, TransportEvent};
use crate::{DeviceItem, PropertyItem, PropertyKey, PropertyState, PropertyType};

// =============================================================================
// PROPERTY STORE
// =============================================================================

/// Rows and change queues, reached through [`PropertyStore::read`] and
/// [`PropertyStore::write`]
#[derive(Debug, Default)]
pub struct PropertyTable {
    rows: BTreeMap<PropertyKey, PropertyItem>,
    created: Vec<PropertyItem>,
    removed: Vec<PropertyItem>,
    updated: Vec<PropertyItem>,
}

/// Table of device properties, one row per device/property/element
#[derive(Debug, Default)]
pub struct PropertyStore {
    table: RwLock<PropertyTable>,
}

impl PropertyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared access for a sequence of lookups
    pub fn read(&self) -> RwLockReadGuard<'_, PropertyTable> {
        self.table.read()
    }

    /// Exclusive access for a sequence of reads and writes
    pub fn write(&self) -> RwLockWriteGuard<'_, PropertyTable> {
        self.table.write()
    }

    /// Insert or update in place. Returns true when the row was created.
    pub fn upsert_property(&self, item: PropertyItem) -> bool {
        self.write().upsert_property(item)
    }

    pub fn remove_property(&self, key: &PropertyKey) -> bool {
        self.write().remove_property(key)
    }

    pub fn remove_property_vector(&self, device: &str, property: &str) -> usize {
        self.write().remove_property_vector(device, property)
    }

    pub fn remove_all_properties_for_device(&self, device: &str) -> usize {
        self.write().remove_all_properties_for_device(device)
    }

    pub fn get_property(
        &self,
        device: &str,
        property: &str,
        element: &str,
        formatted: bool,
    ) -> Option<PropertyItem> {
        self.read().get_property(device, property, element, formatted)
    }

    pub fn get_property_elements(&self, device: &str, property: &str) -> Vec<PropertyItem> {
        self.read().get_property_elements(device, property)
    }

    pub fn get_property_target(&self, device: &str, property: &str, element: &str) -> Option<String> {
        self.read().get_property_target(device, property, element)
    }

    pub fn has_property(&self, device: &str, property: &str) -> bool {
        self.read().has_property(device, property)
    }

    pub fn has_element(&self, device: &str, property: &str, element: &str) -> bool {
        self.read().has_element(device, property, element)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PropertyTable {
    pub fn upsert_property(&mut self, item: PropertyItem) -> bool {
        let key = item.key();
        match self.rows.get_mut(&key) {
            Some(row) => {
                row.property_type = item.property_type;
                row.state = item.state;
                row.value = item.value;
                if !item.number_format.is_empty() {
                    row.number_format = item.number_format;
                }
                if !item.property_label.is_empty() {
                    row.property_label = item.property_label;
                }
                if !item.element_label.is_empty() {
                    row.element_label = item.element_label;
                }
                if !item.group.is_empty() {
                    row.group = item.group;
                }
                if !item.target.is_empty() {
                    row.target = item.target;
                }
                let snapshot = row.clone();
                self.updated.push(snapshot);
                false
            }
            None => {
                self.created.push(item.clone());
                self.rows.insert(key, item);
                true
            }
        }
    }

    /// No-op when the row does not exist
    pub fn remove_property(&mut self, key: &PropertyKey) -> bool {
        match self.rows.remove(key) {
            Some(row) => {
                self.removed.push(row);
                true
            }
            None => false,
        }
    }

    pub fn remove_property_vector(&mut self, device: &str, property: &str) -> usize {
        self.remove_where(|row| row.device == device && row.property == property)
    }

    /// Removed rows are queued as property removals; the device removal
    /// itself is queued by the registry.
    pub fn remove_all_properties_for_device(&mut self, device: &str) -> usize {
        self.remove_where(|row| row.device == device)
    }

    fn remove_where(&mut self, predicate: impl Fn(&PropertyItem) -> bool) -> usize {
        let keys: Vec<PropertyKey> = self
            .rows
            .values()
            .filter(|row| predicate(row))
            .map(PropertyItem::key)
            .collect();
        for key in &keys {
            self.remove_property(key);
        }
        keys.len()
    }

    /// Lookup that reports absence for rows without a value. With
    /// `formatted` a Number value is rendered through its element format.
    pub fn get_property(
        &self,
        device: &str,
        property: &str,
        element: &str,
        formatted: bool,
    ) -> Option<PropertyItem> {
        let row = self
            .rows
            .get(&PropertyKey::new(device, property, element))?;
        if row.value.is_empty() {
            return None;
        }
        let mut item = row.clone();
        if formatted && item.property_type == PropertyType::Number && !item.number_format.is_empty() {
            if let Some(number) = item.number() {
                item.value = format_number(number, &item.number_format);
            }
        }
        Some(item)
    }

    pub fn get_property_elements(&self, device: &str, property: &str) -> Vec<PropertyItem> {
        self.rows
            .values()
            .filter(|row| row.device == device && row.property == property)
            .cloned()
            .collect()
    }

    pub fn get_property_target(&self, device: &str, property: &str, element: &str) -> Option<String> {
        self.rows
            .get(&PropertyKey::new(device, property, element))
            .map(|row| row.target.clone())
            .filter(|target| !target.is_empty())
    }

    pub fn has_property(&self, device: &str, property: &str) -> bool {
        self.rows
            .keys()
            .any(|key| key.device == device && key.property == property)
    }

    pub fn has_element(&self, device: &str, property: &str, element: &str) -> bool {
        self.rows
            .contains_key(&PropertyKey::new(device, property, element))
    }

    /// State of one row, without the empty-value filter of `get_property`
    pub fn element_state(&self, key: &PropertyKey) -> Option<PropertyState> {
        self.rows.get(key).map(|row| row.state)
    }

    /// Local state change, not reported as an update
    pub fn set_element_state(&mut self, key: &PropertyKey, state: PropertyState) -> bool {
        match self.rows.get_mut(key) {
            Some(row) => {
                row.state = state;
                true
            }
            None => false,
        }
    }

    pub fn set_element_target(&mut self, key: &PropertyKey, target: &str) -> bool {
        match self.rows.get_mut(key) {
            Some(row) => {
                row.target = target.to_string();
                true
            }
            None => false,
        }
    }

    /// Apply a definition or update of a whole vector. Elements keep their
    /// current state when the message carries none.
    pub fn apply_vector(&mut self, vector: &PropertyVector) {
        for element in &vector.elements {
            let key = PropertyKey::new(&vector.device, &vector.name, &element.name);
            let state = vector
                .state
                .or_else(|| self.element_state(&key))
                .unwrap_or(PropertyState::Idle);
            self.upsert_property(row_from(vector, element, state));
        }
    }

    /// Drain the created/removed/updated queues
    pub fn take_changes(&mut self) -> (Vec<PropertyItem>, Vec<PropertyItem>, Vec<PropertyItem>) {
        (
            std::mem::take(&mut self.created),
            std::mem::take(&mut self.removed),
            std::mem::take(&mut self.updated),
        )
    }

    /// Queue every current row as created and drop older history
    pub fn restart(&mut self) {
        let created = self.rows.values().cloned().collect();
        self.created = created;
        self.removed.clear();
        self.updated.clear();
    }

    /// Drop all rows and pending changes
    pub fn clear(&mut self) {
        *self = PropertyTable::default();
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

fn row_from(vector: &PropertyVector, element: &ElementSnapshot, state: PropertyState) -> PropertyItem {
    PropertyItem {
        device: vector.device.clone(),
        property: vector.name.clone(),
        element: element.name.clone(),
        property_type: vector.property_type,
        state,
        number_format: element.format.clone(),
        property_label: vector.label.clone(),
        element_label: element.label.clone(),
        group: vector.group.clone(),
        value: element.value.clone(),
        target: String::new(),
    }
}

// =============================================================================
// DEVICE REGISTRY
// =============================================================================

#[derive(Debug, Default)]
pub struct DeviceTable {
    devices: Vec<DeviceItem>,
    created: Vec<DeviceItem>,
    removed: Vec<DeviceItem>,
}

/// Devices currently known to the server, in arrival order
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    table: RwLock<DeviceTable>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self) -> RwLockReadGuard<'_, DeviceTable> {
        self.table.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, DeviceTable> {
        self.table.write()
    }

    pub fn upsert_device(&self, device: DeviceItem) -> bool {
        self.write().upsert_device(device)
    }

    pub fn remove_device(&self, name: &str) -> bool {
        self.write().remove_device(name)
    }

    pub fn has_device(&self, name: &str) -> bool {
        self.read().has_device(name)
    }

    pub fn has_devices(&self) -> bool {
        self.read().has_devices()
    }

    pub fn devices(&self) -> Vec<DeviceItem> {
        self.read().devices()
    }
}

impl DeviceTable {
    /// Returns true when the device was not known before
    pub fn upsert_device(&mut self, device: DeviceItem) -> bool {
        match self.devices.iter_mut().find(|d| d.name == device.name) {
            Some(existing) => {
                existing.label = device.label;
                false
            }
            None => {
                self.created.push(device.clone());
                self.devices.push(device);
                true
            }
        }
    }

    pub fn remove_device(&mut self, name: &str) -> bool {
        match self.devices.iter().position(|d| d.name == name) {
            Some(index) => {
                let device = self.devices.remove(index);
                self.removed.push(device);
                true
            }
            None => false,
        }
    }

    pub fn has_device(&self, name: &str) -> bool {
        self.devices.iter().any(|d| d.name == name)
    }

    pub fn has_devices(&self) -> bool {
        !self.devices.is_empty()
    }

    pub fn devices(&self) -> Vec<DeviceItem> {
        self.devices.clone()
    }

    pub fn take_changes(&mut self) -> (Vec<DeviceItem>, Vec<DeviceItem>) {
        (
            std::mem::take(&mut self.created),
            std::mem::take(&mut self.removed),
        )
    }

    pub fn restart(&mut self) {
        let created = self.devices.clone();
        self.created = created;
        self.removed.clear();
    }

    pub fn clear(&mut self) {
        *self = DeviceTable::default();
    }
}

// =============================================================================
// CLIENT STATE
// =============================================================================

/// Scalar server state: latest message and last downloaded image
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerStatus {
    pub current_message: String,
    pub message_device: String,
    pub downloaded_image_path: Option<PathBuf>,
    pub blobs_received: u64,
}

/// Registry, store and server status of one connection
#[derive(Debug, Default)]
pub struct ClientState {
    pub devices: DeviceRegistry,
    pub properties: PropertyStore,
    status: Mutex<ServerStatus>,
}

impl ClientState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one transport event. Device and property changes happen while
    /// both write guards are held, devices first.
    pub fn apply(&self, event: &TransportEvent) {
        match event {
            TransportEvent::DeviceAdded { device } => {
                let mut devices = self.devices.write();
                let _properties = self.properties.write();
                devices.upsert_device(DeviceItem::new(device));
            }
            TransportEvent::DeviceRemoved { device } => {
                let mut devices = self.devices.write();
                let mut properties = self.properties.write();
                properties.remove_all_properties_for_device(device);
                devices.remove_device(device);
            }
            TransportEvent::PropertyDefined(vector) | TransportEvent::PropertyUpdated(vector) => {
                let mut devices = self.devices.write();
                let mut properties = self.properties.write();
                if !devices.has_device(&vector.device) {
                    devices.upsert_device(DeviceItem::new(&vector.device));
                }
                properties.apply_vector(vector);
            }
            TransportEvent::PropertyRemoved { device, property } => {
                let _devices = self.devices.write();
                let mut properties = self.properties.write();
                match property {
                    Some(property) => properties.remove_property_vector(device, property),
                    None => properties.remove_all_properties_for_device(device),
                };
            }
            TransportEvent::ServerMessage { device, message } => {
                let mut status = self.status.lock();
                status.current_message = message.clone();
                status.message_device = device.clone();
            }
            TransportEvent::ServerDisconnected => self.reset(),
            // written to disk by the client, recorded via `record_download`
            TransportEvent::BlobReceived { .. } => {}
        }
    }

    /// Flush devices, properties, queues and server status
    pub fn reset(&self) {
        let mut devices = self.devices.write();
        let mut properties = self.properties.write();
        let mut status = self.status.lock();
        devices.clear();
        properties.clear();
        *status = ServerStatus::default();
    }

    pub fn status(&self) -> ServerStatus {
        self.status.lock().clone()
    }

    pub fn current_message(&self) -> String {
        self.status.lock().current_message.clone()
    }

    /// Reserve a sequence number for the next BLOB file name
    pub fn next_blob_number(&self) -> u64 {
        let mut status = self.status.lock();
        status.blobs_received += 1;
        status.blobs_received
    }

    pub fn record_download(&self, path: &Path) {
        self.status.lock().downloaded_image_path = Some(path.to_path_buf());
    }

    pub fn has_downloaded_image(&self) -> bool {
        self.status.lock().downloaded_image_path.is_some()
    }

    pub fn downloaded_image_path(&self) -> Option<PathBuf> {
        self.status.lock().downloaded_image_path.clone()
    }

    pub fn clear_downloaded_image_path(&self) {
        self.status.lock().downloaded_image_path = None;
    }

    /// CONNECTION.CONNECT is ON and the device is registered
    pub fn is_device_connected(&self, device: &str) -> bool {
        let devices = self.devices.read();
        let properties = self.properties.read();
        devices.has_device(device)
            && properties
                .get_property(device, props::CONNECTION, props::CONNECT, false)
                .map(|item| item.value.eq_ignore_ascii_case(switch_value::ON))
                .unwrap_or(false)
    }
}
