pub mod edge;
pub mod gpu;
pub mod sandbox;
pub mod worker;

pub use edge::EdgeEngine;
pub use gpu::GpuEngine;
pub use sandbox::SandboxEngine;
pub use worker::WorkerEngine;
