//! Message shapes exchanged between the coordinator and its executors
//!
//! A `DataPacket` travels down the work channel carrying one chunk of a call;
//! the executor answers on the result channel with a `ResultPacket` holding
//! either the chunk's outputs or the error raised while computing them.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::errors::RemoteError;
use crate::executor::functions::RemoteFn;
use crate::executor::local_pool::LocalPool;

/// Outputs of one chunk, or the failure that replaced them
pub type ChunkOutcome = std::result::Result<Vec<Value>, RemoteError>;

/// Stable reference to a registered callable plus arguments captured on the
/// client side
///
/// Captured arguments are passed first, ahead of the per-element arguments,
/// so `FuncRef::new("pow").with_captured(vec![json!(2)])` applied to `x`
/// calls `pow(2, x)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FuncRef {
    pub name: String,
    #[serde(default)]
    pub captured: Vec<Value>,
}

impl FuncRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            captured: Vec::new(),
        }
    }

    pub fn with_captured(mut self, captured: Vec<Value>) -> Self {
        self.captured = captured;
        self
    }
}

impl From<&str> for FuncRef {
    fn from(name: &str) -> Self {
        FuncRef::new(name)
    }
}

impl From<String> for FuncRef {
    fn from(name: String) -> Self {
        FuncRef::new(name)
    }
}

impl fmt::Display for FuncRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.captured.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}(+{} captured)", self.name, self.captured.len())
        }
    }
}

/// Signature shared by the local pool's mapping operations
pub type MapStrategy = fn(&LocalPool, Arc<dyn RemoteFn>, &[Value], Vec<Value>) -> ChunkOutcome;

/// How the executor applies a function to the elements of a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MapMode {
    /// `func(x)` for every element
    Elementwise,
    /// every element is an argument list, `func(*x)`
    Unpack,
}

impl MapMode {
    /// Pick the local pool operation matching this mode
    pub fn choose_mode(self) -> MapStrategy {
        match self {
            MapMode::Elementwise => LocalPool::map,
            MapMode::Unpack => LocalPool::starmap,
        }
    }

    /// Positional arguments for one chunk element
    pub fn arguments(
        self,
        captured: &[Value],
        element: Value,
    ) -> std::result::Result<Vec<Value>, String> {
        let mut args = captured.to_vec();
        match self {
            MapMode::Elementwise => args.push(element),
            MapMode::Unpack => match element {
                Value::Array(items) => args.extend(items),
                other => {
                    return Err(format!(
                        "expected an argument list, got {}",
                        value_kind(&other)
                    ))
                }
            },
        }
        Ok(args)
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// The configuration triple an executor builds its local pool from
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub initializer: Option<FuncRef>,
    #[serde(default)]
    pub initargs: Vec<Value>,
    pub maxtasksperchild: Option<usize>,
}

/// One chunk of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPacket {
    /// Call this chunk belongs to, unique per coordinator
    pub call: u64,
    /// Chunk sequence number, contiguous from 0 within a call
    pub id: usize,
    pub func: FuncRef,
    pub chunk: Vec<Value>,
    pub mode: MapMode,
    pub config: PoolConfig,
}

/// Sent by an executor on the work channel when it is ready for one more
/// `DataPacket`; the coordinator never sends a packet nobody asked for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkRequest {
    pub executor: String,
}

/// The executor's answer to one `DataPacket`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultPacket {
    pub call: u64,
    pub id: usize,
    pub result: ChunkOutcome,
}

impl ResultPacket {
    pub fn new(call: u64, id: usize, result: ChunkOutcome) -> Self {
        Self { call, id, result }
    }

    /// Reply to `packet` with `result`
    pub fn reply_to(packet: &DataPacket, result: ChunkOutcome) -> Self {
        Self::new(packet.call, packet.id, result)
    }

    pub fn holds_error(&self) -> bool {
        self.result.is_err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::RemoteErrorKind;
    use serde_json::json;

    #[test]
    fn elementwise_appends_element_after_captured() {
        let args = MapMode::Elementwise
            .arguments(&[json!(2)], json!([1, 2]))
            .unwrap();
        assert_eq!(args, vec![json!(2), json!([1, 2])]);
    }

    #[test]
    fn unpack_spreads_argument_list() {
        let args = MapMode::Unpack.arguments(&[], json!([3, 4])).unwrap();
        assert_eq!(args, vec![json!(3), json!(4)]);

        let err = MapMode::Unpack.arguments(&[], json!(3)).unwrap_err();
        assert!(err.contains("a number"));
    }

    #[test]
    fn pool_config_equality_drives_rebuilds() {
        let base = PoolConfig::default();
        let with_init = PoolConfig {
            initializer: Some(FuncRef::new("setup")),
            ..Default::default()
        };
        let with_args = PoolConfig {
            initializer: Some(FuncRef::new("setup")),
            initargs: vec![json!(1)],
            maxtasksperchild: None,
        };
        assert_ne!(base, with_init);
        assert_ne!(with_init, with_args);
        assert_eq!(with_init, with_init.clone());
    }

    #[test]
    fn result_packet_error_predicate() {
        let ok = ResultPacket::new(1, 0, Ok(vec![json!(1)]));
        let err = ResultPacket::new(
            1,
            1,
            Err(RemoteError::new(RemoteErrorKind::User, "f", "bad")),
        );
        assert!(!ok.holds_error());
        assert!(err.holds_error());
    }

    #[test]
    fn func_ref_display() {
        assert_eq!(FuncRef::from("square").to_string(), "square");
        let partial = FuncRef::new("pow").with_captured(vec![json!(2)]);
        assert_eq!(partial.to_string(), "pow(+1 captured)");
    }
}
