use parking_lot::Mutex;
use relay_protocol::{ClientResult, ContextPort, RenderPort};
use serde_json::{Map, Value};

/// Request context held in memory. Server pushes are merged key by key.
#[derive(Debug)]
pub struct SharedContext {
    value: Mutex<Value>,
    restored: bool,
}

impl Default for SharedContext {
    fn default() -> Self {
        Self::new(Value::Object(Map::new()))
    }
}

impl SharedContext {
    pub fn new(value: Value) -> Self {
        Self {
            value: Mutex::new(value),
            restored: true,
        }
    }

    /// A context created fresh rather than restored from storage.
    pub fn fresh(value: Value) -> Self {
        Self {
            value: Mutex::new(value),
            restored: false,
        }
    }

    pub fn snapshot(&self) -> Value {
        self.value.lock().clone()
    }
}

impl ContextPort for SharedContext {
    fn encode_for_server(&self) -> ClientResult<String> {
        Ok(serde_json::to_string(&*self.value.lock())?)
    }

    fn merge(&self, pushed: &Value) -> ClientResult<()> {
        let mut current = self.value.lock();
        match (&mut *current, pushed) {
            (Value::Object(current), Value::Object(pushed)) => {
                for (key, value) in pushed {
                    current.insert(key.clone(), value.clone());
                }
            }
            (current, pushed) => *current = pushed.clone(),
        }
        Ok(())
    }

    fn restored_from_storage(&self) -> bool {
        self.restored
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRenderer;

impl RenderPort for NoopRenderer {
    fn rerender_dirty(&self) {}
}
