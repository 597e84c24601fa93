use super::arena::MemoryArena;
use crate::envconfig::{SandboxConfig, PAGE_SIZE};
use anyhow::{anyhow, Context, Result};
use wasmtime::{Config, Engine as WasmEngine, Linker, Memory, MemoryType, Module, Store, TypedFunc};

// Default inference routine. Projects the input onto the weight matrix the same
// way `kernel::forward` does and divides by temperature; top_k is left to the host.
pub const DEFAULT_RUNTIME_WAT: &str = r#"
(module
  (import "env" "memory" (memory 1))
  (func (export "infer")
    (param $w i32) (param $wlen i32) (param $in i32) (param $inlen i32)
    (param $out i32) (param $outlen i32) (param $temp f32) (param $topk i32)
    (result i32)
    (local $i i32) (local $j i32) (local $idx i32) (local $acc f32) (local $wv f32)
    (if (f32.le (local.get $temp) (f32.const 0))
      (then (local.set $temp (f32.const 1))))
    (block $done_j
      (loop $loop_j
        (br_if $done_j (i32.ge_u (local.get $j) (local.get $outlen)))
        (local.set $acc (f32.const 0))
        (local.set $i (i32.const 0))
        (block $done_i
          (loop $loop_i
            (br_if $done_i (i32.ge_u (local.get $i) (local.get $inlen)))
            (if (i32.eqz (local.get $wlen))
              (then (local.set $wv (f32.const 1)))
              (else
                (local.set $idx
                  (i32.rem_u
                    (i32.add (i32.mul (local.get $i) (local.get $outlen)) (local.get $j))
                    (local.get $wlen)))
                (local.set $wv
                  (f32.load (i32.add (local.get $w) (i32.shl (local.get $idx) (i32.const 2)))))))
            (local.set $acc
              (f32.add (local.get $acc)
                (f32.mul
                  (f32.load (i32.add (local.get $in) (i32.shl (local.get $i) (i32.const 2))))
                  (local.get $wv))))
            (local.set $i (i32.add (local.get $i) (i32.const 1)))
            (br $loop_i)))
        (f32.store
          (i32.add (local.get $out) (i32.shl (local.get $j) (i32.const 2)))
          (f32.div (local.get $acc) (local.get $temp)))
        (local.set $j (i32.add (local.get $j) (i32.const 1)))
        (br $loop_j)))
    (local.get $outlen)))
"#;

type InferFn = TypedFunc<(i32, i32, i32, i32, i32, i32, f32, i32), i32>;

#[derive(Debug, Clone, Copy)]
pub struct WeightRegion {
    pub ptr: u32,
    pub elements: u32,
}

// One instantiated runtime module plus the arena carved out of its memory.
pub struct SandboxRuntime {
    store: Store<()>,
    memory: Memory,
    infer: InferFn,
    arena: MemoryArena,
    max_pages: u64,
    fuel_per_call: Option<u64>,
}

impl SandboxRuntime {
    pub fn new(config: &SandboxConfig, module_source: &[u8]) -> Result<Self> {
        let mut wasm_config = Config::new();
        if config.fuel_per_call.is_some() {
            wasm_config.consume_fuel(true);
        }
        let engine = WasmEngine::new(&wasm_config)?;
        let module = Module::new(&engine, module_source).context("compiling runtime module")?;

        let mut store = Store::new(&engine, ());
        let memory = Memory::new(
            &mut store,
            MemoryType::new(config.initial_pages, Some(config.maximum_pages)),
        )?;

        let mut linker = Linker::new(&engine);
        linker.define(&store, "env", "memory", memory)?;
        let instance = linker.instantiate(&mut store, &module)?;
        let infer: InferFn = instance
            .get_typed_func(&mut store, "infer")
            .context("runtime module must export `infer`")?;

        let arena = MemoryArena::new(ARENA_BASE, memory.data_size(&store));

        Ok(Self {
            store,
            memory,
            infer,
            arena,
            max_pages: config.maximum_pages as u64,
            fuel_per_call: config.fuel_per_call,
        })
    }

    pub fn arena_usage(&self) -> usize {
        self.arena.used()
    }

    pub fn arena_capacity(&self) -> usize {
        self.arena.capacity()
    }

    pub fn allocate(&mut self, size: usize) -> Result<u32> {
        if let Some(missing) = self.arena.shortfall(size) {
            let pages = missing.div_ceil(PAGE_SIZE) as u64;
            let current = self.memory.size(&self.store);
            if current + pages > self.max_pages {
                return Err(anyhow!(
                    "allocation of {} bytes needs {} pages beyond the {} page maximum",
                    size,
                    current + pages - self.max_pages,
                    self.max_pages
                ));
            }
            self.memory.grow(&mut self.store, pages)?;
            self.arena.set_capacity(self.memory.data_size(&self.store));
        }
        Ok(self.arena.allocate(size)?)
    }

    pub fn free(&mut self, ptr: u32) -> Result<()> {
        Ok(self.arena.free(ptr)?)
    }

    pub fn load_weights(&mut self, weights: &[u8]) -> Result<WeightRegion> {
        let ptr = self.allocate(weights.len())?;
        if let Err(e) = self.memory.write(&mut self.store, ptr as usize, weights) {
            self.free(ptr)?;
            return Err(e.into());
        }
        Ok(WeightRegion { ptr, elements: (weights.len() / 4) as u32 })
    }

    // Input and output regions are always released, whether or not the call traps.
    pub fn run(
        &mut self,
        weights: WeightRegion,
        input: &[f32],
        output_len: usize,
        temperature: f32,
        top_k: usize,
    ) -> Result<Vec<f32>> {
        let input_bytes: &[u8] = bytemuck::cast_slice(input);
        let input_ptr = self.allocate(input_bytes.len())?;
        let output_ptr = match self.allocate(output_len * 4) {
            Ok(ptr) => ptr,
            Err(e) => {
                self.free(input_ptr)?;
                return Err(e);
            }
        };

        let result = self.invoke(weights, input_ptr, input_bytes, output_ptr, output_len, temperature, top_k);

        self.free(output_ptr)?;
        self.free(input_ptr)?;
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn invoke(
        &mut self,
        weights: WeightRegion,
        input_ptr: u32,
        input_bytes: &[u8],
        output_ptr: u32,
        output_len: usize,
        temperature: f32,
        top_k: usize,
    ) -> Result<Vec<f32>> {
        self.memory.write(&mut self.store, input_ptr as usize, input_bytes)?;
        if let Some(fuel) = self.fuel_per_call {
            self.store.set_fuel(fuel)?;
        }

        let written = self.infer.call(
            &mut self.store,
            (
                weights.ptr as i32,
                weights.elements as i32,
                input_ptr as i32,
                (input_bytes.len() / 4) as i32,
                output_ptr as i32,
                output_len as i32,
                temperature,
                top_k.min(i32::MAX as usize) as i32,
            ),
        )?;
        let written = (written.max(0) as usize).min(output_len);

        let mut raw = vec![0u8; written * 4];
        self.memory.read(&self.store, output_ptr as usize, &mut raw)?;
        Ok(raw
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }
}

const ARENA_BASE: usize = 64;

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime(initial: u32, maximum: u32) -> SandboxRuntime {
        let config = SandboxConfig { initial_pages: initial, maximum_pages: maximum, ..Default::default() };
        SandboxRuntime::new(&config, DEFAULT_RUNTIME_WAT.as_bytes()).unwrap()
    }

    #[test]
    fn test_matches_reference_kernel() {
        let mut rt = runtime(1, 4);
        let weights = [0.5f32, -1.0, 2.0, 0.25, 3.0];
        let region = rt.load_weights(bytemuck::cast_slice(&weights)).unwrap();
        let input = [1.0f32, 2.0, 3.0];

        let out = rt.run(region, &input, 4, 2.0, 0).unwrap();
        let expected = crate::kernel::forward(&weights, &input, 4, 2.0);
        assert_eq!(out.len(), 4);
        for (a, b) in out.iter().zip(&expected) {
            assert!((a - b).abs() < 1e-5, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_grows_memory_up_to_maximum() {
        let mut rt = runtime(1, 2);
        let region = rt.load_weights(&[]).unwrap();
        let before = rt.arena_usage();

        // 20k floats = 80 KB of output forces growth into the second page
        let out = rt.run(region, &[1.0], 20_000, 1.0, 0).unwrap();
        assert_eq!(out.len(), 20_000);
        assert_eq!(rt.arena_usage(), before);
        assert_eq!(rt.arena_capacity(), 2 * PAGE_SIZE);

        assert!(rt.run(region, &[1.0], 40_000, 1.0, 0).is_err());
        assert_eq!(rt.arena_usage(), before);
    }

    #[test]
    fn test_fuel_limit_traps_runaway_work() {
        let config = SandboxConfig {
            initial_pages: 4,
            maximum_pages: 4,
            fuel_per_call: Some(1_000),
            ..Default::default()
        };
        let mut rt = SandboxRuntime::new(&config, DEFAULT_RUNTIME_WAT.as_bytes()).unwrap();
        let region = rt.load_weights(bytemuck::cast_slice(&[1.0f32; 16])).unwrap();
        let before = rt.arena_usage();
        assert!(rt.run(region, &[1.0; 64], 256, 1.0, 0).is_err());
        assert_eq!(rt.arena_usage(), before);
    }

    #[test]
    fn test_rejects_module_without_infer() {
        let config = SandboxConfig::default();
        let wat = r#"(module (import "env" "memory" (memory 1)))"#;
        assert!(SandboxRuntime::new(&config, wat.as_bytes()).is_err());
    }
}
