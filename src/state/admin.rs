//! The admin room.
//!
//! Admins see every other location of the server and can broadcast system
//! messages to all of them.

use std::sync::Arc;

use serde_json::{json, Value};

use super::location::{
    handle_base_request, Location, LocationCore, LocationError, LocationOptions, LocationRegistry,
};
use super::session::Session;

/// Admin-only location.
pub struct AdminLocation {
    core: LocationCore,
}

impl AdminLocation {
    /// Create and register the admin location.
    pub fn new(registry: &Arc<LocationRegistry>) -> Arc<Self> {
        let options = LocationOptions {
            has_chat: true,
            persistent: true,
            cheats_enabled: false,
        };
        let admin = Arc::new(Self {
            core: LocationCore::new(registry, options),
        });
        registry.register(admin.clone());
        admin
    }

    /// Descriptions of every other location, by id.
    pub fn overview(&self) -> Vec<Value> {
        let Some(registry) = self.core.registry() else {
            return Vec::new();
        };
        registry
            .all()
            .iter()
            .filter(|l| l.id() != self.id())
            .map(|l| l.describe())
            .collect()
    }
}

impl Location for AdminLocation {
    fn core(&self) -> &LocationCore {
        &self.core
    }

    fn kind(&self) -> &'static str {
        "admin"
    }

    fn send_init(&self, session: &Arc<Session>) {
        session.send(json!({
            "command": "admin.init",
            "locations": self.overview(),
        }));
    }

    fn handle_request(
        &self,
        session: &Arc<Session>,
        command: &str,
        data: &Value,
    ) -> Result<bool, LocationError> {
        if !command.starts_with("admin.") {
            return handle_base_request(self, session, command, data);
        }
        if !session.is_admin() {
            return Err(LocationError::Privilege);
        }

        match command {
            "admin.send_system_message" => {
                let text = data
                    .get("message")
                    .and_then(Value::as_str)
                    .ok_or_else(|| LocationError::BadRequest("system message without text".to_string()))?;
                tracing::info!(admin = session.id(), text, "admin system message");
                if let Some(registry) = self.core.registry() {
                    for location in registry.all() {
                        location.system_message(text);
                    }
                }
                Ok(true)
            }
            "admin.refresh" => {
                self.send_init(session);
                Ok(true)
            }
            "admin.switch" => {
                let target = data
                    .get("to")
                    .and_then(Value::as_u64)
                    .and_then(|id| self.core.registry()?.get(id))
                    .ok_or_else(|| LocationError::BadRequest("unknown location".to_string()))?;
                session.move_to(Some(target));
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
