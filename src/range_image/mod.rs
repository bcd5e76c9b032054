mod range_image;
pub use range_image::RangeImage;

mod resize;
pub use resize::halve_range_grid;
