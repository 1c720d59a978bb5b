mod category;
mod item;
mod job;
mod source;
mod task;

pub use category::*;
pub use item::*;
pub use job::*;
pub use source::*;
pub use task::*;
