use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::app::error::AppError;
use crate::app::store::{JsonStore, Record};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Room {
    pub room_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// 0 means unlimited.
    #[serde(default)]
    pub capacity: usize,
    #[serde(default)]
    pub device_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Room {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let now = Utc::now();
        Self {
            room_id: uuid::Uuid::new_v4().simple().to_string()[..12].to_string(),
            name: name.into(),
            description: None,
            capacity,
            device_ids: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_full(&self) -> bool {
        self.capacity != 0 && self.device_ids.len() >= self.capacity
    }

    pub fn has_device(&self, serial: &str) -> bool {
        self.device_ids.iter().any(|id| id == serial)
    }

    pub fn capacity_text(&self) -> String {
        if self.capacity == 0 {
            self.device_ids.len().to_string()
        } else {
            format!("{}/{}", self.device_ids.len(), self.capacity)
        }
    }
}

impl Record for Room {
    fn record_id(&self) -> &str {
        &self.room_id
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomStatistics {
    pub total_rooms: usize,
    pub total_devices: usize,
    pub rooms_with_devices: usize,
    pub empty_rooms: usize,
}

pub struct RoomRegistry {
    store: JsonStore<Room>,
}

impl RoomRegistry {
    pub fn open(path: impl Into<PathBuf>, trace_id: &str) -> Result<Self, AppError> {
        Ok(Self {
            store: JsonStore::open(path, trace_id)?,
        })
    }

    pub fn create(
        &self,
        name: &str,
        description: Option<String>,
        capacity: usize,
        trace_id: &str,
    ) -> Result<Room, AppError> {
        let name = name.trim();
        let length = name.chars().count();
        if length == 0 || length > 50 {
            return Err(AppError::validation("Room name must be 1 to 50 characters", trace_id));
        }
        if self.by_name(name).is_some() {
            return Err(AppError::validation(format!("Room already exists: {name}"), trace_id));
        }
        let mut room = Room::new(name, capacity);
        room.description = description.filter(|text| !text.trim().is_empty());
        self.store.put(room.clone(), trace_id)?;
        info!(trace_id = %trace_id, room_id = %room.room_id, name = %room.name, "room created");
        Ok(room)
    }

    pub fn get(&self, room_id: &str) -> Option<Room> {
        self.store.get(room_id)
    }

    fn require(&self, room_id: &str, trace_id: &str) -> Result<Room, AppError> {
        self.get(room_id)
            .ok_or_else(|| AppError::not_found(format!("Unknown room: {room_id}"), trace_id))
    }

    pub fn by_name(&self, name: &str) -> Option<Room> {
        self.store.all().into_iter().find(|room| room.name == name)
    }

    /// Oldest first.
    pub fn all(&self) -> Vec<Room> {
        let mut rooms = self.store.all();
        rooms.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.name.cmp(&b.name)));
        rooms
    }

    pub fn delete(&self, room_id: &str, trace_id: &str) -> Result<bool, AppError> {
        self.store.delete(room_id, trace_id)
    }

    /// Puts `serial` in the room, taking it out of whichever room held it before. Returns the
    /// previous room id, if any.
    pub fn add_device(
        &self,
        room_id: &str,
        serial: &str,
        trace_id: &str,
    ) -> Result<Option<String>, AppError> {
        let mut room = self.require(room_id, trace_id)?;
        if room.has_device(serial) {
            return Ok(None);
        }
        if room.is_full() {
            return Err(AppError::validation(
                format!("Room {} is full ({})", room.name, room.capacity_text()),
                trace_id,
            ));
        }

        let mut changed = Vec::with_capacity(2);
        let previous = self.room_of(serial).map(|mut previous| {
            previous.device_ids.retain(|id| id != serial);
            previous.updated_at = Utc::now();
            let id = previous.room_id.clone();
            changed.push(previous);
            id
        });
        room.device_ids.push(serial.to_string());
        room.updated_at = Utc::now();
        changed.push(room);
        self.store.put_many(changed, trace_id)?;
        info!(
            trace_id = %trace_id,
            room_id = %room_id,
            serial = %serial,
            previous = ?previous,
            "device assigned to room"
        );
        Ok(previous)
    }

    pub fn remove_device(
        &self,
        room_id: &str,
        serial: &str,
        trace_id: &str,
    ) -> Result<bool, AppError> {
        let mut room = self.require(room_id, trace_id)?;
        if !room.has_device(serial) {
            return Ok(false);
        }
        room.device_ids.retain(|id| id != serial);
        room.updated_at = Utc::now();
        self.store.put(room, trace_id)?;
        Ok(true)
    }

    pub fn room_of(&self, serial: &str) -> Option<Room> {
        self.store.all().into_iter().find(|room| room.has_device(serial))
    }

    pub fn device_ids(&self, room_id: &str, trace_id: &str) -> Result<Vec<String>, AppError> {
        Ok(self.require(room_id, trace_id)?.device_ids)
    }

    pub fn statistics(&self) -> RoomStatistics {
        let rooms = self.store.all();
        let occupied = rooms.iter().filter(|room| !room.device_ids.is_empty()).count();
        RoomStatistics {
            total_rooms: rooms.len(),
            total_devices: rooms.iter().map(|room| room.device_ids.len()).sum(),
            rooms_with_devices: occupied,
            empty_rooms: rooms.len() - occupied,
        }
    }
}
