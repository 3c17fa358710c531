//! I/O modules for tile archives, rasters, vectors and training tables

pub mod archive;
pub mod table;
#[cfg(feature = "raster-io")]
pub mod raster;
#[cfg(feature = "raster-io")]
pub mod vector;
#[cfg(feature = "raster-io")]
pub mod dem;

pub use archive::TileExtractor;
pub use table::{read_training_table, write_training_table};
#[cfg(feature = "raster-io")]
pub use raster::RasterIo;
#[cfg(feature = "raster-io")]
pub use vector::{read_vector, read_vectors};
#[cfg(feature = "raster-io")]
pub use dem::TileAssembler;
