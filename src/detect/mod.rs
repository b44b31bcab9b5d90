mod backend;
mod backends;
mod registry;
mod result;

pub use backend::DetectorBackend;
pub use backends::{MotionBackend, StubBackend};
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use registry::DetectorRegistry;
pub use result::{class_color, BoundingBox, Detection, DetectorFamily, Rgb, FACE_COLOR};
