//! Sandbox Runtime — a memory-capped WebAssembly isolate for untrusted
//! operator scripts.
//!
//! The script text in an `ExecutionRequest` is WebAssembly Text Format
//! (WAT); it is compiled via the `wat` crate and instantiated into a fresh
//! `wasmtime::Store` per run, so no mutable state or host reference ever
//! crosses between runs. The only globals visible inside the isolate are
//! the Host Bridge capability functions installed on the `Linker` — no
//! WASI, no module loader, no ambient authority.
//!
//! Values cross the guest/host boundary as JSON bytes in guest linear
//! memory: the guest exports `alloc(len) -> ptr` so the host can write
//! arguments and the guest can write its result; every function that
//! crosses the boundary takes/returns a packed `(ptr << 32) | len` i64,
//! which is the same convention documented for the single-function
//! `execute` entry point this runtime generalises.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use wasmtime::{Caller, Config, Engine, Linker, Memory, Module, ResourceLimiter, Store};

use crate::bridge::HostBridge;
use crate::error::SandboxError;
use crate::policy::ResourceQuotas;
use crate::tracer::Tracer;

/// wasmtime fuel budget. One unit is roughly one bytecode instruction;
/// this is the isolate's own execution-time guard, independent of the
/// host-side wall-clock timeout.
const FUEL_BUDGET: u64 = 50_000_000;

const WASM_PAGE_BYTES: usize = 64 * 1024;

/// States a run passes through, each reflected by a trace event of the
/// same name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Validated,
    IsolateCreated,
    CapabilitiesInstalled,
    Compiled,
    Running,
    Completed,
    Failed,
    TimedOut,
    Oom,
}

impl RunState {
    fn event_name(self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Validated => "validated",
            RunState::IsolateCreated => "isolate_created",
            RunState::CapabilitiesInstalled => "capabilities_installed",
            RunState::Compiled => "compiled",
            RunState::Running => "running",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
            RunState::TimedOut => "timed_out",
            RunState::Oom => "oom",
        }
    }
}

fn transition(tracer: &Tracer, state: RunState) {
    tracer.emit(state.event_name(), serde_json::json!({}));
}

/// Per-run isolate state: the one thing the `Store` owns besides wasmtime's
/// own bookkeeping. Holds the memory cap and a handle to the Host Bridge so
/// imported host functions can reach policy/tracer/tool-registry/LLM client.
struct IsolateState {
    bridge: Arc<HostBridge>,
    memory_limit_bytes: usize,
    memory_used_bytes: usize,
}

impl ResourceLimiter for IsolateState {
    fn memory_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        if desired > self.memory_limit_bytes {
            return Ok(false);
        }
        self.memory_used_bytes = desired;
        Ok(true)
    }

    fn table_growing(
        &mut self,
        _current: usize,
        desired: usize,
        maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        Ok(maximum.is_none_or(|max| desired <= max))
    }
}

/// Creates isolates, compiles scripts, and runs them under dual wall-clock
/// and memory ceilings.
pub struct SandboxRuntime {
    engine: Engine,
}

impl SandboxRuntime {
    pub fn new() -> Result<Self, SandboxError> {
        let mut config = Config::new();
        config.async_support(true);
        config.consume_fuel(true);
        let engine =
            Engine::new(&config).map_err(|e| SandboxError::InstantiationError(e.to_string()))?;
        Ok(Self { engine })
    }

    /// Compile and run `script` (WAT text) inside a fresh isolate, honoring
    /// `quotas.max_memory_mb` as a hard heap cap and `quotas.max_wall_ms` as
    /// a host-side wall-clock ceiling. Returns the script's result value
    /// (the guest's `run` export's return value, JSON-decoded).
    pub async fn run(
        &self,
        script: &str,
        bridge: Arc<HostBridge>,
        quotas: &ResourceQuotas,
        tracer: &Tracer,
    ) -> Result<Value, SandboxError> {
        transition(tracer, RunState::IsolateCreated);
        let memory_limit_bytes = (quotas.max_memory_mb as usize) * WASM_PAGE_BYTES * 16; // MB -> bytes
        let mut store = Store::new(
            &self.engine,
            IsolateState {
                bridge,
                memory_limit_bytes,
                memory_used_bytes: 0,
            },
        );
        store.limiter(|s| s as &mut dyn ResourceLimiter);
        store
            .set_fuel(FUEL_BUDGET)
            .map_err(|e| SandboxError::InstantiationError(e.to_string()))?;

        let linker = self.build_linker()?;
        transition(tracer, RunState::CapabilitiesInstalled);

        let wasm_bytes =
            wat::parse_str(script).map_err(|e| SandboxError::CompileError(e.to_string()))?;
        let module = Module::new(&self.engine, &wasm_bytes)
            .map_err(|e| SandboxError::CompileError(e.to_string()))?;
        transition(tracer, RunState::Compiled);

        let instance = linker
            .instantiate_async(&mut store, &module)
            .await
            .map_err(|e| SandboxError::InstantiationError(e.to_string()))?;

        let run_fn = instance
            .get_typed_func::<(), u64>(&mut store, "run")
            .map_err(|e| SandboxError::InstantiationError(format!("missing `run` export: {e}")))?;

        transition(tracer, RunState::Running);

        let wall_budget = Duration::from_millis(quotas.max_wall_ms);
        let outcome = tokio::time::timeout(wall_budget, run_fn.call_async(&mut store, ())).await;

        let packed = match outcome {
            Err(_elapsed) => {
                transition(tracer, RunState::TimedOut);
                return Err(SandboxError::TimedOut(quotas.max_wall_ms));
            }
            Ok(Err(trap)) => {
                let message = trap.to_string();
                if message.contains("fuel") {
                    transition(tracer, RunState::TimedOut);
                    return Err(SandboxError::TimedOut(quotas.max_wall_ms));
                }
                if message.contains("memory") || message.contains("alloc") {
                    transition(tracer, RunState::Oom);
                    return Err(SandboxError::OutOfMemory(quotas.max_memory_mb));
                }
                transition(tracer, RunState::Failed);
                return Err(SandboxError::ExecutionError(message));
            }
            Ok(Ok(packed)) => packed,
        };

        let (ptr, len) = unpack(packed);
        let memory = get_memory(&mut store, &instance)
            .map_err(|e| SandboxError::ExecutionError(e.to_string()))?;
        let bytes = read_bytes(&memory, &store, ptr, len)
            .map_err(|e| SandboxError::ExecutionError(e.to_string()))?;
        let result: Value = serde_json::from_slice(&bytes)
            .map_err(|e| SandboxError::ExecutionError(format!("malformed result JSON: {e}")))?;

        transition(tracer, RunState::Completed);
        Ok(result)
        // `store` is dropped here, deterministically releasing the isolate
        // and every resource it held.
    }

    fn build_linker(&self) -> Result<Linker<IsolateState>, SandboxError> {
        let mut linker: Linker<IsolateState> = Linker::new(&self.engine);

        linker
            .func_wrap_async(
                "env",
                "call_tool",
                |mut caller: Caller<'_, IsolateState>, (ptr, len): (i32, i32)| {
                    Box::new(async move {
                        let args = match read_args(&mut caller, ptr, len) {
                            Ok(v) => v,
                            Err(e) => return encode_error(&mut caller, &e.to_string()),
                        };
                        let name = args
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_owned();
                        let params = args.get("params").cloned().unwrap_or(Value::Null);
                        let bridge = caller.data().bridge.clone();
                        match bridge.call_tool(&name, params).await {
                            Ok(result) => encode_result(&mut caller, &result),
                            Err(e) => encode_error(&mut caller, &e.to_string()),
                        }
                    })
                },
            )
            .map_err(|e| SandboxError::InstantiationError(e.to_string()))?;

        linker
            .func_wrap_async(
                "env",
                "llm",
                |mut caller: Caller<'_, IsolateState>, (ptr, len): (i32, i32)| {
                    Box::new(async move {
                        let args = match read_args(&mut caller, ptr, len) {
                            Ok(v) => v,
                            Err(e) => return encode_error(&mut caller, &e.to_string()),
                        };
                        let messages = args.get("messages").cloned().unwrap_or(Value::Array(vec![]));
                        let options = args.get("options").cloned().unwrap_or(Value::Null);
                        let bridge = caller.data().bridge.clone();
                        match bridge.llm(messages, options).await {
                            Ok(result) => encode_result(&mut caller, &result),
                            Err(e) => encode_error(&mut caller, &e.to_string()),
                        }
                    })
                },
            )
            .map_err(|e| SandboxError::InstantiationError(e.to_string()))?;

        linker
            .func_wrap_async(
                "env",
                "sleep",
                |caller: Caller<'_, IsolateState>, ms: i64| {
                    Box::new(async move {
                        let bridge = caller.data().bridge.clone();
                        bridge.sleep(ms).await.map_err(|e| wasmtime::Error::msg(e.to_string()))
                    })
                },
            )
            .map_err(|e| SandboxError::InstantiationError(e.to_string()))?;

        linker
            .func_wrap(
                "env",
                "create_artifact",
                |mut caller: Caller<'_, IsolateState>, ptr: i32, len: i32| -> u64 {
                    let args = match read_args(&mut caller, ptr, len) {
                        Ok(v) => v,
                        Err(e) => return encode_error(&mut caller, &e.to_string()),
                    };
                    let bridge = caller.data().bridge.clone();
                    match bridge.create_artifact_sync(args) {
                        Ok(result) => encode_result(&mut caller, &result),
                        Err(e) => encode_error(&mut caller, &e.to_string()),
                    }
                },
            )
            .map_err(|e| SandboxError::InstantiationError(e.to_string()))?;

        linker
            .func_wrap("env", "get_quota_usage", |mut caller: Caller<'_, IsolateState>| -> u64 {
                let bridge = caller.data().bridge.clone();
                let usage = bridge.quota_usage();
                encode_result(&mut caller, &serde_json::to_value(usage).unwrap_or(Value::Null))
            })
            .map_err(|e| SandboxError::InstantiationError(e.to_string()))?;

        for (name, level) in [
            ("console_log", "log"),
            ("console_info", "info"),
            ("console_warn", "warn"),
            ("console_error", "error"),
        ] {
            linker
                .func_wrap(
                    "env",
                    name,
                    move |mut caller: Caller<'_, IsolateState>, ptr: i32, len: i32| {
                        if let Ok(args) = read_args(&mut caller, ptr, len) {
                            let bridge = caller.data().bridge.clone();
                            bridge.console(level, args);
                        }
                    },
                )
                .map_err(|e| SandboxError::InstantiationError(e.to_string()))?;
        }

        Ok(linker)
    }
}

impl Default for SandboxRuntime {
    fn default() -> Self {
        Self::new().expect("wasmtime engine construction must not fail with a valid Config")
    }
}

// ─── Marshalling helpers ───────────────────────────────────────────────────

fn pack(ptr: i32, len: i32) -> u64 {
    ((ptr as u32 as u64) << 32) | (len as u32 as u64)
}

fn unpack(packed: u64) -> (i32, i32) {
    ((packed >> 32) as i32, (packed & 0xffff_ffff) as i32)
}

fn get_memory(
    store: &mut Store<IsolateState>,
    instance: &wasmtime::Instance,
) -> Result<Memory, String> {
    instance
        .get_memory(&mut *store, "memory")
        .ok_or_else(|| "guest module does not export `memory`".to_owned())
}

fn read_bytes(memory: &Memory, store: &Store<IsolateState>, ptr: i32, len: i32) -> Result<Vec<u8>, String> {
    if ptr < 0 || len < 0 {
        return Err("negative pointer or length".to_owned());
    }
    let data = memory.data(store);
    let start = ptr as usize;
    let end = start + len as usize;
    data.get(start..end)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| "pointer/length out of bounds".to_owned())
}

fn read_args(caller: &mut Caller<'_, IsolateState>, ptr: i32, len: i32) -> Result<Value, String> {
    let memory = caller
        .get_export("memory")
        .and_then(|e| e.into_memory())
        .ok_or_else(|| "guest module does not export `memory`".to_owned())?;
    let bytes = read_bytes(&memory, caller.as_context(), ptr, len)?;
    serde_json::from_slice(&bytes).map_err(|e| format!("malformed argument JSON: {e}"))
}

/// Write `value` into guest memory via the guest's own `alloc` export and
/// pack the resulting `(ptr, len)` as the u64 return convention.
fn encode_result(caller: &mut Caller<'_, IsolateState>, value: &Value) -> u64 {
    match write_json(caller, value) {
        Ok((ptr, len)) => pack(ptr, len),
        Err(_) => pack(0, 0),
    }
}

fn encode_error(caller: &mut Caller<'_, IsolateState>, message: &str) -> u64 {
    let payload = serde_json::json!({ "__error__": true, "message": message });
    match write_json(caller, &payload) {
        Ok((ptr, len)) => pack(ptr, len),
        Err(_) => pack(0, 0),
    }
}

fn write_json(caller: &mut Caller<'_, IsolateState>, value: &Value) -> Result<(i32, i32), String> {
    let bytes = serde_json::to_vec(value).map_err(|e| e.to_string())?;
    let alloc = caller
        .get_export("alloc")
        .and_then(|e| e.into_func())
        .ok_or_else(|| "guest module does not export `alloc`".to_owned())?
        .typed::<i32, i32>(&mut *caller)
        .map_err(|e| e.to_string())?;
    let ptr = alloc
        .call(&mut *caller, bytes.len() as i32)
        .map_err(|e| e.to_string())?;
    let memory = caller
        .get_export("memory")
        .and_then(|e| e.into_memory())
        .ok_or_else(|| "guest module does not export `memory`".to_owned())?;
    memory
        .write(&mut *caller, ptr as usize, &bytes)
        .map_err(|e| e.to_string())?;
    Ok((ptr, bytes.len() as i32))
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_round_trips() {
        let packed = pack(1234, 56);
        assert_eq!(unpack(packed), (1234, 56));
    }

    #[test]
    fn memory_limiter_rejects_growth_past_cap() {
        let mut state = IsolateState {
            bridge: Arc::new(HostBridge::for_test()),
            memory_limit_bytes: WASM_PAGE_BYTES,
            memory_used_bytes: 0,
        };
        assert!(state.memory_growing(0, WASM_PAGE_BYTES, None).unwrap());
        assert!(!state.memory_growing(WASM_PAGE_BYTES, WASM_PAGE_BYTES * 2, None).unwrap());
    }

    #[tokio::test]
    async fn runtime_compiles_trivial_script() {
        let runtime = SandboxRuntime::new().unwrap();
        let tracer = Tracer::new();
        let bridge = Arc::new(HostBridge::for_test());
        let quotas = ResourceQuotas::default();
        let wat = r#"
            (module
              (memory (export "memory") 1)
              (func (export "alloc") (param i32) (result i32) (i32.const 65536))
              (func (export "run") (result i64) (i64.const 0))
            )
        "#;
        let result = runtime.run(wat, bridge, &quotas, &tracer).await;
        // A `run` that returns a zero-length buffer at offset 0 decodes to
        // an empty byte slice, which is not valid JSON — exercising the
        // malformed-result path without requiring a full guest program.
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn runtime_reports_compile_error_for_invalid_wat() {
        let runtime = SandboxRuntime::new().unwrap();
        let tracer = Tracer::new();
        let bridge = Arc::new(HostBridge::for_test());
        let quotas = ResourceQuotas::default();
        let result = runtime.run("(not valid wat", bridge, &quotas, &tracer).await;
        assert!(matches!(result, Err(SandboxError::CompileError(_))));
    }
}
