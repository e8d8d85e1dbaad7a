use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::app::error::AppError;
use crate::app::models::{Device, DeviceStatus};
use crate::app::store::{JsonStore, Record};

impl Record for Device {
    fn record_id(&self) -> &str {
        &self.serial
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetStatistics {
    pub total: usize,
    pub online: usize,
    pub offline: usize,
    pub not_connected: usize,
    pub low_battery: usize,
    pub high_temperature: usize,
}

pub struct DeviceRegistry {
    store: JsonStore<Device>,
}

impl DeviceRegistry {
    pub fn open(path: impl Into<PathBuf>, trace_id: &str) -> Result<Self, AppError> {
        Ok(Self {
            store: JsonStore::open(path, trace_id)?,
        })
    }

    pub fn is_known(&self, serial: &str) -> bool {
        self.store.contains(serial)
    }

    /// Adds a device seen for the first time. An unset sort order lands after every known
    /// device.
    pub fn register(&self, mut device: Device, trace_id: &str) -> Result<Device, AppError> {
        if device.serial.trim().is_empty() {
            return Err(AppError::validation("Device serial is required", trace_id));
        }
        if self.is_known(&device.serial) {
            return Err(AppError::validation(
                format!("Device already registered: {}", device.serial),
                trace_id,
            ));
        }
        if device.sort_order == 0 {
            let last = self.store.all().iter().map(|d| d.sort_order).max().unwrap_or(0);
            device.sort_order = last + 1;
        }
        device.first_connected.get_or_insert_with(Utc::now);
        self.store.put(device.clone(), trace_id)?;
        info!(
            trace_id = %trace_id,
            serial = %device.serial,
            sort_order = device.sort_order,
            "device registered"
        );
        Ok(device)
    }

    /// Registers unknown devices and overwrites known ones.
    pub fn save(&self, device: Device, trace_id: &str) -> Result<Device, AppError> {
        if self.is_known(&device.serial) {
            self.store.put(device.clone(), trace_id)?;
            Ok(device)
        } else {
            self.register(device, trace_id)
        }
    }

    pub fn save_many(&self, devices: Vec<Device>, trace_id: &str) -> Result<(), AppError> {
        if devices.is_empty() {
            return Ok(());
        }
        self.store.put_many(devices, trace_id)
    }

    pub fn get(&self, serial: &str) -> Option<Device> {
        self.store.get(serial)
    }

    /// Looks a device up by serial or by its `ip:port` connection string.
    pub fn find(&self, target: &str) -> Option<Device> {
        self.get(target).or_else(|| {
            self.store
                .all()
                .into_iter()
                .find(|device| device.connection_string() == target)
        })
    }

    /// Every device in display order: sort order, then serial.
    pub fn all(&self) -> Vec<Device> {
        let mut devices = self.store.all();
        devices.sort_by(|a, b| {
            a.sort_order
                .cmp(&b.sort_order)
                .then_with(|| a.serial.cmp(&b.serial))
        });
        devices
    }

    pub fn remove(&self, serial: &str, trace_id: &str) -> Result<bool, AppError> {
        let removed = self.store.delete(serial, trace_id)?;
        if removed {
            info!(trace_id = %trace_id, serial = %serial, "device removed");
        }
        Ok(removed)
    }

    pub fn move_up(&self, serial: &str, trace_id: &str) -> Result<bool, AppError> {
        self.swap_with_neighbour(serial, -1, trace_id)
    }

    pub fn move_down(&self, serial: &str, trace_id: &str) -> Result<bool, AppError> {
        self.swap_with_neighbour(serial, 1, trace_id)
    }

    fn swap_with_neighbour(
        &self,
        serial: &str,
        step: isize,
        trace_id: &str,
    ) -> Result<bool, AppError> {
        let devices = self.all();
        let index = devices
            .iter()
            .position(|device| device.serial == serial)
            .ok_or_else(|| AppError::not_found(format!("Unknown device: {serial}"), trace_id))?;
        let neighbour = index.checked_add_signed(step).filter(|i| *i < devices.len());
        let Some(neighbour_index) = neighbour else {
            return Ok(false);
        };

        let mut current = devices[index].clone();
        let mut neighbour = devices[neighbour_index].clone();
        if current.sort_order == neighbour.sort_order {
            // Equal orders cannot be swapped; spread them first.
            current.sort_order = neighbour_index as i64 + 1;
            neighbour.sort_order = index as i64 + 1;
        } else {
            std::mem::swap(&mut current.sort_order, &mut neighbour.sort_order);
        }
        self.store.put_many([current, neighbour], trace_id)?;
        Ok(true)
    }

    pub fn statistics(
        &self,
        battery_low_threshold: u8,
        temperature_high_threshold: f32,
    ) -> FleetStatistics {
        let devices = self.store.all();
        FleetStatistics {
            total: devices.len(),
            online: devices.iter().filter(|d| d.status == DeviceStatus::Online).count(),
            offline: devices.iter().filter(|d| d.status == DeviceStatus::Offline).count(),
            not_connected: devices.iter().filter(|d| d.status.is_not_connected()).count(),
            low_battery: devices
                .iter()
                .filter(|d| d.is_online() && d.is_low_battery(battery_low_threshold))
                .count(),
            high_temperature: devices
                .iter()
                .filter(|d| d.is_high_temperature(temperature_high_threshold))
                .count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (tempfile::TempDir, DeviceRegistry) {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry =
            DeviceRegistry::open(dir.path().join("devices.json"), "t").expect("registry");
        (dir, registry)
    }

    #[test]
    fn register_appends_sort_order() {
        let (_dir, registry) = registry();
        let first = registry.register(Device::new("B"), "t").expect("register");
        let second = registry.register(Device::new("A"), "t").expect("register");
        assert_eq!(first.sort_order, 1);
        assert_eq!(second.sort_order, 2);
        assert!(second.first_connected.is_some());

        let serials: Vec<_> = registry.all().into_iter().map(|d| d.serial).collect();
        assert_eq!(serials, vec!["B".to_string(), "A".to_string()]);

        let err = registry.register(Device::new("A"), "t").expect_err("duplicate");
        assert_eq!(err.code, "ERR_VALIDATION");
    }

    #[test]
    fn move_up_and_down_swap_neighbours() {
        let (_dir, registry) = registry();
        for serial in ["A", "B", "C"] {
            registry.register(Device::new(serial), "t").expect("register");
        }
        assert!(registry.move_up("C", "t").expect("move"));
        assert!(!registry.move_up("A", "t").expect("move"));
        let serials: Vec<_> = registry.all().into_iter().map(|d| d.serial).collect();
        assert_eq!(serials, vec!["A".to_string(), "C".to_string(), "B".to_string()]);

        assert!(registry.move_down("A", "t").expect("move"));
        assert!(registry.move_down("A", "t").expect("move"));
        assert!(!registry.move_down("A", "t").expect("move"));
        let serials: Vec<_> = registry.all().into_iter().map(|d| d.serial).collect();
        assert_eq!(serials, vec!["C".to_string(), "B".to_string(), "A".to_string()]);

        let err = registry.move_up("missing", "t").expect_err("unknown");
        assert_eq!(err.code, "ERR_NOT_FOUND");
    }

    #[test]
    fn find_matches_connection_string() {
        let (_dir, registry) = registry();
        registry
            .register(Device::new("Q1").with_address("10.0.0.7", 5555), "t")
            .expect("register");
        assert_eq!(registry.find("10.0.0.7:5555").map(|d| d.serial), Some("Q1".to_string()));
        assert!(registry.find("10.0.0.8:5555").is_none());
    }

    #[test]
    fn statistics_count_alerts() {
        let (_dir, registry) = registry();
        let mut low = Device::new("A");
        low.status = DeviceStatus::Online;
        low.battery = 10;
        let mut hot = Device::new("B");
        hot.status = DeviceStatus::Online;
        hot.battery = 90;
        hot.temperature = 45.0;
        let mut idle = Device::new("C");
        idle.status = DeviceStatus::AdbNotEnabled;
        for device in [low, hot, idle] {
            registry.save(device, "t").expect("save");
        }

        let stats = registry.statistics(20, 40.0);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.online, 2);
        assert_eq!(stats.not_connected, 1);
        assert_eq!(stats.low_battery, 1);
        assert_eq!(stats.high_temperature, 1);
    }
}
