pub mod battery;
pub mod load;
pub mod status;

pub use battery::*;
pub use load::*;
pub use status::*;
