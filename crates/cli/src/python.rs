//! Pickle decoding through an embedded Python interpreter.
//!
//! Trajectories pickled by the agent hold enum members and class instances
//! that a pure-Rust decoder cannot rebuild. Unknown classes are replaced by
//! empty stand-ins that keep their attribute dicts, and the result is handed
//! back as JSON.

use pyo3::prelude::*;
use pyo3::types::PyBytes;
use serde_json::Value;

use trajectory_serializer_core::PickleDecoder;

const LOADER: &str = r#"
import base64, enum, io, json, math, pickle

class _Stand_in:
    def __setstate__(self, state):
        if isinstance(state, tuple) and len(state) == 2:
            state = {**(state[0] or {}), **(state[1] or {})}
        if isinstance(state, dict):
            self.__dict__.update(state)
        else:
            self.__dict__["state"] = state

class _Permissive(pickle.Unpickler):
    def find_class(self, module, name):
        try:
            return super().find_class(module, name)
        except Exception:
            return type(name, (_Stand_in,), {})

def _plain(obj):
    if obj is None or isinstance(obj, (bool, int, str)):
        return obj
    if isinstance(obj, float):
        return obj if math.isfinite(obj) else None
    if isinstance(obj, enum.Enum):
        return obj.name
    if isinstance(obj, dict):
        return {str(k): _plain(v) for k, v in obj.items()}
    if isinstance(obj, (list, tuple, set, frozenset)):
        return [_plain(v) for v in obj]
    if isinstance(obj, (bytes, bytearray)):
        return "data:application/octet-stream;base64," + base64.b64encode(bytes(obj)).decode()
    if hasattr(obj, "tolist"):
        return _plain(obj.tolist())
    if hasattr(obj, "__dict__"):
        return _plain(vars(obj))
    return str(obj)

def load(data):
    return json.dumps(_plain(_Permissive(io.BytesIO(data)).load()))
"#;

#[derive(Debug, Clone, Copy, Default)]
pub struct PyPickleDecoder;

impl PickleDecoder for PyPickleDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<Value, Box<dyn std::error::Error + Send + Sync>> {
        let text = Python::with_gil(|py| -> PyResult<String> {
            let module =
                PyModule::from_code(py, LOADER, "trajectory_loader.py", "trajectory_loader")?;
            module
                .getattr("load")?
                .call1((PyBytes::new(py, bytes),))?
                .extract()
        })?;
        Ok(serde_json::from_str(&text)?)
    }
}
