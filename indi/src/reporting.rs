//! Change reports for polling consumers (UI refresh timers, execution loops).
//!
//! Draining is single-consumer: two concurrent drains of the same queue are
//! not supported.

use crate::store::ClientState;
use crate::{DeviceItem, PropertyItem};

/// Devices created and removed since the last drain
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceChangeReport {
    pub created: Vec<DeviceItem>,
    pub removed: Vec<DeviceItem>,
}

impl DeviceChangeReport {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.removed.is_empty()
    }
}

/// Property rows created, removed and updated since the last drain
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyChangeReport {
    pub created: Vec<PropertyItem>,
    pub removed: Vec<PropertyItem>,
    pub updated: Vec<PropertyItem>,
}

impl PropertyChangeReport {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }
}

impl ClientState {
    /// Drain the device queues; None when nothing changed
    pub fn report_changed_devices(&self) -> Option<DeviceChangeReport> {
        let (created, removed) = self.devices.write().take_changes();
        let report = DeviceChangeReport { created, removed };
        (!report.is_empty()).then_some(report)
    }

    /// Drain the property queues; None when nothing changed
    pub fn report_changed_properties(&self) -> Option<PropertyChangeReport> {
        let (created, removed, updated) = self.properties.write().take_changes();
        let report = PropertyChangeReport {
            created,
            removed,
            updated,
        };
        (!report.is_empty()).then_some(report)
    }

    /// Re-queue the full current state as created, for a view that is shown
    /// again and repopulates from scratch
    pub fn restart_reports(&self) {
        let mut devices = self.devices.write();
        let mut properties = self.properties.write();
        devices.restart();
        properties.restart();
    }
}
