//! sonus-spatial: 3D positioning, distance attenuation, panning,
//! Ambisonic encode/decode and HRTF convolution (component I of the
//! spec, plus the position/distance primitives components F/H rely on).

mod ambisonic;
mod distance;
mod error;
mod hrtf;
mod panner;
mod position;

pub use ambisonic::{acn_index, encode, encode_direction, AmbisonicDecoder, AmbisonicOrder, SpeakerDirection, StereoDecodeMode};
pub use distance::{DistanceModel, DistanceParams};
pub use error::{SpatialError, SpatialResult};
pub use hrtf::{HrirMeasurement, HrtfDataset, HrtfField, PartitionedConvolver};
pub use panner::{pan, ConeParams, PanTarget, PannerInput, PannerOutput};
pub use position::{ListenerFrame, Orientation, Vec3};
