//! Records handled by the storage core: versioned tuples, the bounding boxes
//! they occupy, joined multi-tuples and table names.

mod hyperrectangle;
mod multi_tuple;
mod name;
mod tuple;

pub use hyperrectangle::Hyperrectangle;
pub use multi_tuple::MultiTuple;
pub use name::TableName;
pub use tuple::{now_micros, Tuple};
