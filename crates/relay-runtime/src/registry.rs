use std::collections::HashMap;
use std::sync::Arc;

use relay_protocol::{ClientError, ClientResult, Priority};
use serde_json::Value;

use crate::action::{Action, ClientHandler};

/// Resolves descriptors for actions the server pushes without a request.
pub trait ActionDefinitions: Send + Sync {
    fn resolve(&self, descriptor: &str) -> ClientResult<ActionDef>;
}

#[derive(Clone)]
pub struct ActionDef {
    descriptor: String,
    storable: bool,
    priority: Priority,
    handler: Option<ClientHandler>,
}

impl std::fmt::Debug for ActionDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionDef")
            .field("descriptor", &self.descriptor)
            .field("storable", &self.storable)
            .field("priority", &self.priority)
            .field("client", &self.handler.is_some())
            .finish()
    }
}

impl ActionDef {
    pub fn server(descriptor: impl Into<String>) -> Self {
        Self {
            descriptor: descriptor.into(),
            storable: false,
            priority: Priority::Foreground,
            handler: None,
        }
    }

    pub fn client(
        descriptor: impl Into<String>,
        handler: impl Fn(&Value) -> Result<Value, String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            descriptor: descriptor.into(),
            storable: false,
            priority: Priority::Foreground,
            handler: Some(Arc::new(handler)),
        }
    }

    pub fn storable(mut self) -> Self {
        self.storable = true;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    pub fn new_instance(&self, params: Value) -> Action {
        let action = match &self.handler {
            Some(handler) => Action::client(self.descriptor.clone(), params, handler.clone()),
            None => Action::server(self.descriptor.clone(), params),
        };
        let action = action.priority(self.priority);
        if self.storable {
            action.storable()
        } else {
            action
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct ActionRegistry {
    defs: HashMap<String, ActionDef>,
}

impl ActionRegistry {
    pub fn register(&mut self, def: ActionDef) {
        self.defs.insert(def.descriptor.clone(), def);
    }

    pub fn get(&self, descriptor: &str) -> Option<&ActionDef> {
        self.defs.get(descriptor)
    }

    pub fn definitions(&self) -> impl Iterator<Item = &ActionDef> {
        self.defs.values()
    }
}

impl ActionDefinitions for ActionRegistry {
    fn resolve(&self, descriptor: &str) -> ClientResult<ActionDef> {
        self.get(descriptor)
            .cloned()
            .ok_or_else(|| ClientError::MissingDefinition(descriptor.to_owned()))
    }
}
