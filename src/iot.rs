//! IoT device registry
//!
//! The server can drive local devices through structured commands. The
//! registry abstracts what devices exist: it describes them at channel
//! open, reports state snapshots, and executes inbound commands. Each
//! command in a batch runs independently; one failure never aborts the
//! rest.

use serde_json::Value;

use crate::Result;

/// Local device inventory driven by server commands
pub trait IotRegistry: Send {
    /// Descriptor document announcing available devices, sent once per
    /// audio channel open
    fn descriptors(&self) -> Value;

    /// Current state snapshot, sent after descriptors and after command
    /// batches
    fn states(&mut self) -> Value;

    /// Execute one command
    ///
    /// # Errors
    ///
    /// Returns error if the command is unknown or the device rejects it
    fn execute(&mut self, command: &Value) -> Result<()>;
}

/// Registry with no devices
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRegistry;

impl IotRegistry for NullRegistry {
    fn descriptors(&self) -> Value {
        Value::Array(vec![])
    }

    fn states(&mut self) -> Value {
        Value::Object(serde_json::Map::new())
    }

    fn execute(&mut self, command: &Value) -> Result<()> {
        tracing::debug!(%command, "no registry, command ignored");
        Ok(())
    }
}
