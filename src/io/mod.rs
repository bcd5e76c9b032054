mod obj;
pub use obj::{write_obj, write_obj_file};
mod ply;
pub use ply::{read_ply, write_ply};
pub mod tum;
pub use tum::TumSource;
