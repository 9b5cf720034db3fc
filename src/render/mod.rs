//! Reassembly stage.
//!
//! Validated predictions are painted back onto the slide geometry and
//! streamed into a pyramidal output image, optionally blended over the
//! source pixels.

mod blend;
mod reassembler;
mod sink;

pub use blend::{blend, blend_tile, DEFAULT_BLEND_WEIGHT};
pub use reassembler::{ClassGrid, Overlay, Reassembler, StagedOutput, RENDER_QUEUE_DEPTH};
pub use sink::{MemorySink, TileSink};
