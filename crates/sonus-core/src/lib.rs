//! sonus-core: shared sample vocabulary, lockless primitives, the ID
//! registry, and the buffer object (components A, B, C, D of the spec).

mod buffer;
mod convert;
mod error;
mod registry;
mod ring;
mod sample;
mod seqlock;

pub use buffer::{AccessFlags, Buffer, LoopPoints, MappedRegion};
pub use convert::{block_shape, decode_alaw, decode_ima4_block, decode_msadpcm_block, decode_ulaw};
pub use error::{ErrorLatch, SonusError, SonusResult};
pub use registry::{Id, Registry};
pub use ring::SpscRing;
pub use sample::{ChannelLayout, Format, InternalFormat, Sample, SampleType};
pub use seqlock::{SeqLock, Spinlock};
