pub mod frame;

pub use frame::{AckMode, Frame, FrameType};
